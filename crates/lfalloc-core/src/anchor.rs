use core::sync::atomic::{
  AtomicU64,
  Ordering,
};

use static_assertions::{
  const_assert,
  const_assert_eq,
};

use crate::classes::{
  QUANTUM,
  SB_SIZE,
};

const STATE_BITS: u64 = 2;
const AVAIL_BITS: u64 = 25;
const COUNT_BITS: u64 = 25;
const TAG_BITS: u64 = 12;

const STATE_SHIFT: u64 = 0;
const AVAIL_SHIFT: u64 = STATE_SHIFT + STATE_BITS;
const COUNT_SHIFT: u64 = AVAIL_SHIFT + AVAIL_BITS;
const TAG_SHIFT: u64 = COUNT_SHIFT + COUNT_BITS;

const STATE_MASK: u64 = (1 << STATE_BITS) - 1;
const AVAIL_MASK: u64 = (1 << AVAIL_BITS) - 1;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

const_assert_eq!(STATE_BITS + AVAIL_BITS + COUNT_BITS + TAG_BITS, 64);
// every block index of the densest class must fit in the avail field
const_assert!((SB_SIZE / QUANTUM) as u64 <= AVAIL_MASK);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SbState {
  /// Superblock installed in its bin's active slot.
  Active = 0,
  /// All blocks allocated or reserved.
  Full = 1,
  /// Not active but has unreserved available blocks.
  Partial = 2,
  /// Not active and all blocks are free.
  Empty = 3,
}

impl SbState {
  const fn from_bits(bits: u64) -> Self {
    match bits {
      0 => SbState::Active,
      1 => SbState::Full,
      2 => SbState::Partial,
      _ => SbState::Empty,
    }
  }
}

/// Packed superblock state word.
///
/// The whole allocation state of a superblock lives in these 64 bits so a
/// single CAS covers every transition: `avail` is the head of the intrusive
/// free stack, `count` the number of unreserved free blocks, `tag` a
/// monotonically increasing stamp that defeats ABA on `avail`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Anchor(u64);

static_assertions::assert_eq_size!(Anchor, u64);

impl Anchor {
  pub const fn new(state: SbState, avail: u64, count: u64, tag: u64) -> Self {
    Self(
      ((state as u64) << STATE_SHIFT)
        | ((avail & AVAIL_MASK) << AVAIL_SHIFT)
        | ((count & COUNT_MASK) << COUNT_SHIFT)
        | ((tag & TAG_MASK) << TAG_SHIFT),
    )
  }

  pub const fn state(self) -> SbState {
    SbState::from_bits((self.0 >> STATE_SHIFT) & STATE_MASK)
  }

  pub const fn avail(self) -> u64 {
    (self.0 >> AVAIL_SHIFT) & AVAIL_MASK
  }

  pub const fn count(self) -> u64 {
    (self.0 >> COUNT_SHIFT) & COUNT_MASK
  }

  pub const fn tag(self) -> u64 {
    (self.0 >> TAG_SHIFT) & TAG_MASK
  }

  pub fn set_state(&mut self, state: SbState) {
    self.0 = (self.0 & !(STATE_MASK << STATE_SHIFT)) | ((state as u64) << STATE_SHIFT);
  }

  pub fn set_avail(&mut self, avail: u64) {
    self.0 = (self.0 & !(AVAIL_MASK << AVAIL_SHIFT)) | ((avail & AVAIL_MASK) << AVAIL_SHIFT);
  }

  pub fn set_count(&mut self, count: u64) {
    self.0 = (self.0 & !(COUNT_MASK << COUNT_SHIFT)) | ((count & COUNT_MASK) << COUNT_SHIFT);
  }

  pub fn bump_tag(&mut self) {
    let tag = (self.tag() + 1) & TAG_MASK;
    self.0 = (self.0 & !(TAG_MASK << TAG_SHIFT)) | (tag << TAG_SHIFT);
  }

  const fn raw(self) -> u64 {
    self.0
  }

  const fn from_raw(raw: u64) -> Self {
    Self(raw)
  }
}

impl core::fmt::Debug for Anchor {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Anchor")
      .field("state", &self.state())
      .field("avail", &self.avail())
      .field("count", &self.count())
      .field("tag", &self.tag())
      .finish()
  }
}

pub struct AtomicAnchor(AtomicU64);

impl AtomicAnchor {
  pub const fn zeroed() -> Self {
    Self(AtomicU64::new(0))
  }

  pub fn load(&self) -> Anchor {
    Anchor::from_raw(self.0.load(Ordering::SeqCst))
  }

  pub fn store(&self, anchor: Anchor) {
    self.0.store(anchor.raw(), Ordering::SeqCst);
  }

  pub fn compare_exchange_weak(&self, current: Anchor, new: Anchor) -> Result<(), Anchor> {
    self
      .0
      .compare_exchange_weak(current.raw(), new.raw(), Ordering::SeqCst, Ordering::SeqCst)
      .map(|_| ())
      .map_err(Anchor::from_raw)
  }
}
