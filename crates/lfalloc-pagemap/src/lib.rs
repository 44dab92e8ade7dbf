#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{
  AtomicUsize,
  Ordering,
};

use lfalloc_sys::{
  GLOBAL_SYSTEM,
  prim::page_size,
  system::{
    SysError,
    SysOption,
  },
};
use spin::Lazy;

/// Address bits the map can service. Pointers above this range are not
/// managed by the allocator.
const VA_BITS: u32 = 48;

#[derive(Debug)]
pub enum PageMapError {
  System(SysError),
}

pub type PageMapResult<T> = Result<T, PageMapError>;

/// Page -> owner reverse map.
///
/// One word per page over the low [`VA_BITS`] of the address space, backed
/// by a single reserved mapping. Only slots that are actually written get
/// committed by the OS, so the huge virtual footprint stays cheap. A slot
/// value of zero means "no owner".
pub struct PageMap {
  slots: &'static [AtomicUsize],
  page_shift: u32,
}

impl PageMap {
  pub fn new() -> PageMapResult<Self> {
    let page_shift = page_size().trailing_zeros();
    let len = 1usize << (VA_BITS - page_shift);
    let bytes = len * core::mem::size_of::<AtomicUsize>();

    let slice =
      unsafe { GLOBAL_SYSTEM.alloc(bytes, SysOption::Reserve) }.map_err(PageMapError::System)?;
    let slots = unsafe { core::slice::from_raw_parts(slice.as_ptr() as *const AtomicUsize, len) };

    Ok(Self { slots, page_shift })
  }

  #[inline(always)]
  fn slot(&self, addr: usize) -> &AtomicUsize {
    let idx = (addr >> self.page_shift) & (self.slots.len() - 1);
    &self.slots[idx]
  }

  #[inline(always)]
  pub fn set(&self, addr: usize, value: usize) {
    self.slot(addr).store(value, Ordering::SeqCst);
  }

  #[inline(always)]
  pub fn get(&self, addr: usize) -> usize {
    self.slot(addr).load(Ordering::SeqCst)
  }

  #[inline(always)]
  pub fn clear(&self, addr: usize) {
    self.set(addr, 0);
  }
}

pub static PAGE_MAP: Lazy<PageMap> = Lazy::new(|| {
  PageMap::new().expect("failed to reserve page map backing store")
});
