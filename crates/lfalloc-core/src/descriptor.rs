use core::{
  ptr::NonNull,
  sync::atomic::{
    AtomicPtr,
    AtomicUsize,
    Ordering,
  },
};

use lfalloc_sys::{
  GLOBAL_SYSTEM,
  prim::{
    CACHELINE,
    page_size,
  },
  system::SysOption,
};
use log::debug;
use portable_atomic::AtomicU128;
use static_assertions::const_assert_eq;

use crate::{
  anchor::AtomicAnchor,
  bin::Bin,
};

/// Pages fetched from the OS per descriptor-pool refill.
pub const DESC_BLOCK_PAGES: usize = 16;

/// Tagged descriptor pointer.
///
/// Packed into a single `u128` for double-width CAS: the pointer occupies
/// the low 64 bits, the ABA counter the high 64. Descriptor memory is never
/// returned to the OS, so the counter is the only ABA defense these lists
/// need.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescNode {
  desc: *mut Descriptor,
  counter: u64,
}

impl DescNode {
  pub const NULL: DescNode = DescNode {
    desc: core::ptr::null_mut(),
    counter: 0,
  };

  pub fn new(desc: Option<NonNull<Descriptor>>, counter: u64) -> Self {
    Self {
      desc: desc.map_or(core::ptr::null_mut(), |d| d.as_ptr()),
      counter,
    }
  }

  pub fn desc(self) -> Option<NonNull<Descriptor>> {
    NonNull::new(self.desc)
  }

  pub const fn counter(self) -> u64 {
    self.counter
  }

  fn pack(self) -> u128 {
    ((self.counter as u128) << 64) | (self.desc as usize as u128)
  }

  fn unpack(raw: u128) -> Self {
    Self {
      desc: (raw as usize) as *mut Descriptor,
      counter: (raw >> 64) as u64,
    }
  }
}

pub struct AtomicDescNode(AtomicU128);

impl AtomicDescNode {
  pub const fn null() -> Self {
    Self(AtomicU128::new(0))
  }

  pub fn load(&self) -> DescNode {
    DescNode::unpack(self.0.load(Ordering::SeqCst))
  }

  pub fn store(&self, node: DescNode) {
    self.0.store(node.pack(), Ordering::SeqCst);
  }

  pub fn compare_exchange_weak(&self, current: DescNode, new: DescNode) -> Result<(), DescNode> {
    self
      .0
      .compare_exchange_weak(current.pack(), new.pack(), Ordering::SeqCst, Ordering::SeqCst)
      .map(|_| ())
      .map_err(DescNode::unpack)
  }
}

/// Superblock metadata record.
///
/// Descriptors are carved from dedicated OS pages and *never* freed; a
/// retired descriptor goes back on [`AVAIL_DESC`] for reuse. The cache-line
/// alignment keeps the low bits of every descriptor address clear for the
/// credit field packed into each bin's active word.
#[repr(C, align(64))]
pub struct Descriptor {
  next_free: AtomicDescNode,
  next_partial: AtomicDescNode,
  anchor: AtomicAnchor,
  superblock: AtomicPtr<u8>,
  owner: AtomicPtr<Bin>,
  block_size: AtomicUsize,
  max_count: AtomicUsize,
}

const_assert_eq!(core::mem::align_of::<Descriptor>(), CACHELINE);
const_assert_eq!(core::mem::size_of::<Descriptor>() % CACHELINE, 0);

impl Descriptor {
  pub fn anchor(&self) -> &AtomicAnchor {
    &self.anchor
  }

  pub fn next_free(&self) -> &AtomicDescNode {
    &self.next_free
  }

  pub fn next_partial(&self) -> &AtomicDescNode {
    &self.next_partial
  }

  pub fn superblock(&self) -> *mut u8 {
    self.superblock.load(Ordering::Relaxed)
  }

  /// Bin this superblock belongs to; `None` marks a large allocation.
  pub fn owner(&self) -> Option<NonNull<Bin>> {
    NonNull::new(self.owner.load(Ordering::Relaxed))
  }

  pub fn block_size(&self) -> usize {
    self.block_size.load(Ordering::Relaxed)
  }

  pub fn max_count(&self) -> usize {
    self.max_count.load(Ordering::Relaxed)
  }

  /// Refits a freshly claimed descriptor for a new superblock. The relaxed
  /// stores are published by the subsequent anchor store and page-map
  /// registration, which happen before the descriptor becomes reachable.
  pub fn init(&self, superblock: *mut u8, owner: *mut Bin, block_size: usize, max_count: usize) {
    self.superblock.store(superblock, Ordering::Relaxed);
    self.owner.store(owner, Ordering::Relaxed);
    self.block_size.store(block_size, Ordering::Relaxed);
    self.max_count.store(max_count, Ordering::Relaxed);
  }
}

/// Global recycle list of retired descriptors.
static AVAIL_DESC: AtomicDescNode = AtomicDescNode::null();

pub fn desc_alloc() -> Option<NonNull<Descriptor>> {
  let mut old = AVAIL_DESC.load();
  loop {
    match old.desc() {
      Some(desc) => {
        let next = unsafe { desc.as_ref() }.next_free().load();
        let new = DescNode::new(next.desc(), old.counter());
        match AVAIL_DESC.compare_exchange_weak(old, new) {
          Ok(()) => return Some(desc),
          Err(current) => old = current,
        }
      }
      None => return refill(),
    }
  }
}

pub fn desc_retire(desc: NonNull<Descriptor>) {
  let mut old = AVAIL_DESC.load();
  loop {
    unsafe { desc.as_ref() }.next_free().store(old);
    let new = DescNode::new(Some(desc), old.counter() + 1);
    match AVAIL_DESC.compare_exchange_weak(old, new) {
      Ok(()) => return,
      Err(current) => old = current,
    }
  }
}

/// Carves a fresh batch of descriptors out of OS pages, keeps the first for
/// the caller and pushes the rest onto the recycle list.
fn refill() -> Option<NonNull<Descriptor>> {
  let bytes = DESC_BLOCK_PAGES * page_size();
  let slice = unsafe { GLOBAL_SYSTEM.alloc(bytes, SysOption::Commit) }.ok()?;

  let base = slice.as_mut_ptr() as *mut Descriptor;
  let stride = core::mem::size_of::<Descriptor>();
  let count = bytes / stride;
  debug_assert!(count >= 2);

  // mmap memory is zeroed and every field is atomic, so the records are
  // valid Descriptors as-is
  let at = |idx: usize| unsafe { &*base.add(idx) };

  for idx in 1..count - 1 {
    let next = unsafe { NonNull::new_unchecked(base.add(idx + 1)) };
    at(idx).next_free().store(DescNode::new(Some(next), 0));
  }

  let first = unsafe { NonNull::new_unchecked(base.add(1)) };
  let last = at(count - 1);

  let mut old = AVAIL_DESC.load();
  loop {
    last.next_free().store(old);
    let new = DescNode::new(Some(first), old.counter() + 1);
    match AVAIL_DESC.compare_exchange_weak(old, new) {
      Ok(()) => break,
      Err(current) => old = current,
    }
  }

  debug!("descriptor pool refilled with {} records", count);
  Some(unsafe { NonNull::new_unchecked(base) })
}

/// Snapshot of the recycle-list head, for stop-the-world audits.
pub(crate) fn avail_head() -> DescNode {
  AVAIL_DESC.load()
}
