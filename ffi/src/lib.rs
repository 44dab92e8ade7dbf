#![no_std]

use core::ptr;

pub use lfalloc::prelude::*;

mod handler;

#[unsafe(no_mangle)]
pub extern "C" fn malloc(size: usize) -> *mut u8 {
  LfAlloc::allocate(size)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { LfAlloc::deallocate(ptr) };
}

#[unsafe(no_mangle)]
pub extern "C" fn calloc(count: usize, size: usize) -> *mut u8 {
  LfAlloc::allocate_zeroed(count, size)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { LfAlloc::reallocate(ptr, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  LfAlloc::usable_size(ptr)
}

#[unsafe(no_mangle)]
pub extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut u8 {
  LfAlloc::allocate_aligned(align, size)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut u8, align: usize, size: usize) -> i32 {
  if memptr.is_null()
    || !align.is_power_of_two()
    || align % core::mem::size_of::<*mut u8>() != 0
  {
    return libc::EINVAL;
  }

  let ptr = LfAlloc::allocate_aligned(align, size);
  if ptr.is_null() {
    return libc::ENOMEM;
  }

  unsafe { *memptr = ptr };
  0
}

#[unsafe(no_mangle)]
pub extern "C" fn memalign(align: usize, size: usize) -> *mut u8 {
  LfAlloc::allocate_aligned(align, size)
}

#[unsafe(no_mangle)]
pub extern "C" fn valloc(size: usize) -> *mut u8 {
  LfAlloc::allocate_aligned(page_size(), size)
}

#[unsafe(no_mangle)]
pub extern "C" fn pvalloc(size: usize) -> *mut u8 {
  let ps = page_size();
  let Some(rounded) = size.checked_next_multiple_of(ps) else {
    return ptr::null_mut();
  };

  LfAlloc::allocate_aligned(ps, rounded)
}
