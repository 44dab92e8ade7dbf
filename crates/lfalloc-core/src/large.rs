use core::ptr::NonNull;

use lfalloc_pagemap::PAGE_MAP;
use lfalloc_sys::{
  math::align_up,
  prim::page_ceiling,
};
use log::debug;

use crate::{
  anchor::{
    Anchor,
    SbState,
  },
  descriptor::{
    Descriptor,
    desc_alloc,
    desc_retire,
  },
  page_alloc,
  page_free,
};

/// Allocations above the largest size class get a dedicated page run and a
/// descriptor with no owning bin.
pub fn allocate(size: usize) -> Option<NonNull<u8>> {
  let bytes = page_ceiling(size).ok()?;

  let desc = desc_alloc()?;
  let Some(region) = page_alloc(bytes) else {
    desc_retire(desc);
    return None;
  };

  let desc_ref = unsafe { desc.as_ref() };
  desc_ref.init(region, core::ptr::null_mut(), bytes, 1);
  desc_ref.anchor().store(Anchor::new(SbState::Full, 0, 0, 0));

  // only the first page needs a map entry; free() always rounds through it
  PAGE_MAP.set(region as usize, desc.as_ptr() as usize);

  debug!("large allocation of {} bytes at {:p}", bytes, region);
  NonNull::new(region)
}

/// Aligned variant: over-allocate by the alignment, advance the returned
/// pointer, and register the aligned page too so free() can find the
/// descriptor from either address.
pub fn allocate_aligned(align: usize, size: usize) -> Option<NonNull<u8>> {
  debug_assert!(align.is_power_of_two());

  let bytes = page_ceiling(size.checked_add(align)?).ok()?;

  let desc = desc_alloc()?;
  let Some(region) = page_alloc(bytes) else {
    desc_retire(desc);
    return None;
  };

  let desc_ref = unsafe { desc.as_ref() };
  desc_ref.init(region, core::ptr::null_mut(), bytes, 1);
  desc_ref.anchor().store(Anchor::new(SbState::Full, 0, 0, 0));

  PAGE_MAP.set(region as usize, desc.as_ptr() as usize);

  let aligned = align_up(region as usize, align)? as *mut u8;
  if aligned != region {
    PAGE_MAP.set(aligned as usize, desc.as_ptr() as usize);
  }

  debug!("aligned large allocation at {:p} (region {:p})", aligned, region);
  NonNull::new(aligned)
}

/// # Safety
///
/// `desc` must be a live large-allocation descriptor and `ptr` the pointer
/// previously handed to the caller.
pub unsafe fn deallocate(desc: NonNull<Descriptor>, ptr: NonNull<u8>) {
  let desc_ref = unsafe { desc.as_ref() };
  let region = desc_ref.superblock();
  let bytes = desc_ref.block_size();

  PAGE_MAP.clear(region as usize);
  if ptr.as_ptr() != region {
    PAGE_MAP.clear(ptr.as_ptr() as usize);
  }

  unsafe { page_free(region, bytes) };

  // large descriptors are never listed anywhere, reuse immediately
  desc_retire(desc);

  debug!("released large allocation at {:p} ({} bytes)", region, bytes);
}
