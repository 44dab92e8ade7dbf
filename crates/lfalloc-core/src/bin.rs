use core::{
  ptr::NonNull,
  sync::atomic::{
    AtomicU64,
    Ordering,
  },
};

use log::debug;
use spin::Lazy;

use crate::{
  anchor::{
    Anchor,
    SbState,
  },
  classes::{
    NCLASSES,
    ScIdx,
    SizeClass,
    class_at,
  },
  descriptor::{
    AtomicDescNode,
    DescNode,
    Descriptor,
    desc_alloc,
    desc_retire,
  },
  page_alloc,
  page_free,
  register_superblock,
  unregister_superblock,
};

/// Most blocks that can sit reserved on an active superblock at once. The
/// reservation lives in the low bits of the active word, below the
/// cache-line alignment of the descriptor address.
pub const CREDITS_MAX: u64 = 63;
const CREDITS_MASK: u64 = CREDITS_MAX;

/// Descriptor address with the credit count packed into the low bits.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Active(u64);

impl Active {
  fn new(desc: NonNull<Descriptor>, credits: u64) -> Self {
    debug_assert_eq!(desc.as_ptr() as u64 & CREDITS_MASK, 0);
    debug_assert!(credits <= CREDITS_MAX);
    Self(desc.as_ptr() as u64 | credits)
  }

  fn desc(self) -> NonNull<Descriptor> {
    // the word is only ever built from a NonNull
    unsafe { NonNull::new_unchecked((self.0 & !CREDITS_MASK) as *mut Descriptor) }
  }

  fn credits(self) -> u64 {
    self.0 & CREDITS_MASK
  }
}

struct AtomicActive(AtomicU64);

impl AtomicActive {
  const fn none() -> Self {
    Self(AtomicU64::new(0))
  }

  fn load(&self) -> Option<Active> {
    match self.0.load(Ordering::SeqCst) {
      0 => None,
      raw => Some(Active(raw)),
    }
  }

  fn raw(active: Option<Active>) -> u64 {
    active.map_or(0, |a| a.0)
  }

  fn compare_exchange(
    &self,
    current: Option<Active>,
    new: Option<Active>,
  ) -> Result<(), Option<Active>> {
    self
      .0
      .compare_exchange(Self::raw(current), Self::raw(new), Ordering::SeqCst, Ordering::SeqCst)
      .map(|_| ())
      .map_err(|raw| match raw {
        0 => None,
        raw => Some(Active(raw)),
      })
  }

  fn compare_exchange_weak(
    &self,
    current: Option<Active>,
    new: Option<Active>,
  ) -> Result<(), Option<Active>> {
    self
      .0
      .compare_exchange_weak(Self::raw(current), Self::raw(new), Ordering::SeqCst, Ordering::SeqCst)
      .map(|_| ())
      .map_err(|raw| match raw {
        0 => None,
        raw => Some(Active(raw)),
      })
  }
}

#[derive(Debug)]
enum NewSbError {
  /// Another thread installed an active superblock first; retry the loop.
  Raced,
  OutOfMemory,
}

/// Per-size-class allocation front.
pub struct Bin {
  active: AtomicActive,
  partial: AtomicDescNode,
  class: ScIdx,
}

static BINS: Lazy<[Bin; NCLASSES]> = Lazy::new(|| core::array::from_fn(|i| Bin::new(ScIdx(i))));

pub fn bin_for(class: ScIdx) -> &'static Bin {
  &BINS[class.0]
}

impl Bin {
  fn new(class: ScIdx) -> Self {
    Self {
      active: AtomicActive::none(),
      partial: AtomicDescNode::null(),
      class,
    }
  }

  pub fn class(&self) -> ScIdx {
    self.class
  }

  fn size_class(&self) -> SizeClass {
    class_at(self.class)
  }

  pub fn allocate(&'static self) -> Option<NonNull<u8>> {
    loop {
      if let Some(ptr) = self.from_active() {
        return Some(ptr);
      }
      if let Some(ptr) = self.from_partial() {
        return Some(ptr);
      }
      match self.from_new_sb() {
        Ok(ptr) => return Some(ptr),
        Err(NewSbError::Raced) => continue,
        Err(NewSbError::OutOfMemory) => return None,
      }
    }
  }

  /// Fast path: spend one credit of the active superblock.
  fn from_active(&'static self) -> Option<NonNull<u8>> {
    let mut old = self.active.load();
    let (desc, old_credits) = loop {
      let active = old?;

      // spend a credit; the last credit uninstalls the superblock
      let new = match active.credits() {
        0 => None,
        credits => Some(Active::new(active.desc(), credits - 1)),
      };
      match self.active.compare_exchange_weak(Some(active), new) {
        Ok(()) => break (active.desc(), active.credits()),
        Err(current) => old = current,
      }
    };

    // one block is now reserved for us; the superblock cannot empty out
    // under our feet, so the descriptor fields are stable
    let desc_ref = unsafe { desc.as_ref() };
    let superblock = desc_ref.superblock();
    let block_size = desc_ref.block_size();

    let mut old_anchor = desc_ref.anchor().load();
    let (ptr, refill) = loop {
      debug_assert!((old_anchor.avail() as usize) < desc_ref.max_count());

      let ptr = unsafe { superblock.add(old_anchor.avail() as usize * block_size) };
      let next = free_link(ptr).load(Ordering::Relaxed);

      let mut new_anchor = old_anchor;
      new_anchor.set_avail(next);
      new_anchor.bump_tag();

      // took the last credit: either the superblock is exhausted or we
      // draw a new batch of credits out of the unreserved count
      let mut refill = 0;
      if old_credits == 0 {
        if old_anchor.count() == 0 {
          new_anchor.set_state(SbState::Full);
        } else {
          refill = old_anchor.count().min(CREDITS_MAX);
          new_anchor.set_count(old_anchor.count() - refill);
        }
      }

      match desc_ref.anchor().compare_exchange_weak(old_anchor, new_anchor) {
        Ok(()) => break (ptr, refill),
        Err(current) => old_anchor = current,
      }
    };

    if refill > 0 {
      self.update_active(desc, refill);
    }

    NonNull::new(ptr)
  }

  /// Reinstalls `desc` with `credits - 1` remaining reservations. If another
  /// superblock got there first, the credits flow back into the anchor and
  /// the superblock joins the partial list.
  fn update_active(&self, desc: NonNull<Descriptor>, credits: u64) {
    let new = Active::new(desc, credits - 1);
    if self.active.compare_exchange(None, Some(new)).is_ok() {
      return;
    }

    let desc_ref = unsafe { desc.as_ref() };
    let mut old_anchor = desc_ref.anchor().load();
    loop {
      let mut new_anchor = old_anchor;
      new_anchor.set_count(old_anchor.count() + credits);
      new_anchor.set_state(SbState::Partial);
      match desc_ref.anchor().compare_exchange_weak(old_anchor, new_anchor) {
        Ok(()) => break,
        Err(current) => old_anchor = current,
      }
    }

    self.push_partial(desc);
  }

  fn from_partial(&'static self) -> Option<NonNull<u8>> {
    loop {
      let desc = self.pop_partial()?;
      let desc_ref = unsafe { desc.as_ref() };

      // reserve one block for ourselves plus a batch of credits
      let mut old_anchor = desc_ref.anchor().load();
      let credits = loop {
        if old_anchor.state() == SbState::Empty {
          // emptied between the list pop and here; the freeing thread
          // already released the superblock
          desc_retire(desc);
          break None;
        }

        debug_assert!(old_anchor.count() >= 1);
        let credits = (old_anchor.count() - 1).min(CREDITS_MAX);
        let mut new_anchor = old_anchor;
        new_anchor.set_count(old_anchor.count() - 1 - credits);
        new_anchor.set_state(if credits > 0 { SbState::Active } else { SbState::Full });

        match desc_ref.anchor().compare_exchange_weak(old_anchor, new_anchor) {
          Ok(()) => break Some(credits),
          Err(current) => old_anchor = current,
        }
      };
      let Some(credits) = credits else {
        continue;
      };

      let superblock = desc_ref.superblock();
      let block_size = desc_ref.block_size();

      // pop the reserved block; concurrent frees keep moving avail
      let mut old_anchor = desc_ref.anchor().load();
      let ptr = loop {
        let ptr = unsafe { superblock.add(old_anchor.avail() as usize * block_size) };
        let next = free_link(ptr).load(Ordering::Relaxed);

        let mut new_anchor = old_anchor;
        new_anchor.set_avail(next);
        new_anchor.bump_tag();

        match desc_ref.anchor().compare_exchange_weak(old_anchor, new_anchor) {
          Ok(()) => break ptr,
          Err(current) => old_anchor = current,
        }
      };

      if credits > 0 {
        self.update_active(desc, credits);
      }

      return NonNull::new(ptr);
    }
  }

  /// Slow path: build a superblock from fresh OS pages and try to install
  /// it as active. Losing the install race undoes everything.
  fn from_new_sb(&'static self) -> Result<NonNull<u8>, NewSbError> {
    let class = self.size_class();
    let max_count = class.max_count();

    let desc = desc_alloc().ok_or(NewSbError::OutOfMemory)?;
    let Some(superblock) = page_alloc(class.sb_size()) else {
      desc_retire(desc);
      return Err(NewSbError::OutOfMemory);
    };

    let desc_ref = unsafe { desc.as_ref() };
    desc_ref.init(
      superblock,
      self as *const Bin as *mut Bin,
      class.block_size(),
      max_count,
    );

    // chain blocks 1..max_count-1; block 0 goes straight to the caller and
    // the final block's link is never followed
    for idx in 1..max_count - 1 {
      let block = unsafe { superblock.add(idx * class.block_size()) };
      free_link(block).store(idx as u64 + 1, Ordering::Relaxed);
    }

    let credits = (max_count as u64 - 1).min(CREDITS_MAX);
    let anchor = Anchor::new(SbState::Active, 1, (max_count as u64 - 1) - credits, 0);
    desc_ref.anchor().store(anchor);

    // reachable via the page map from here on
    register_superblock(desc);

    let new = Active::new(desc, credits - 1);
    match self.active.compare_exchange(None, Some(new)) {
      Ok(()) => {
        debug!(
          "installed superblock {:p} for class {} ({} blocks)",
          superblock, self.class.0, max_count
        );
        Ok(unsafe { NonNull::new_unchecked(superblock) })
      }
      Err(_) => {
        unregister_superblock(superblock, class.sb_size());
        unsafe { page_free(superblock, class.sb_size()) };
        desc_retire(desc);
        Err(NewSbError::Raced)
      }
    }
  }

  /// Gives a block back to its superblock and drives the state machine.
  ///
  /// # Safety
  ///
  /// `ptr` must lie inside `desc`'s superblock and `desc` must belong to
  /// this bin, with the block currently allocated.
  pub unsafe fn deallocate(&self, desc: NonNull<Descriptor>, ptr: NonNull<u8>) {
    let desc_ref = unsafe { desc.as_ref() };

    // after the CAS the descriptor may be recycled at any moment, so take
    // everything we need up front
    let superblock = desc_ref.superblock();
    let block_size = desc_ref.block_size();
    let max_count = desc_ref.max_count() as u64;
    let sb_size = self.size_class().sb_size();

    let idx = (ptr.as_ptr() as usize - superblock as usize) / block_size;
    let block = unsafe { superblock.add(idx * block_size) };

    let mut old_anchor = desc_ref.anchor().load();
    let new_anchor = loop {
      free_link(block).store(old_anchor.avail(), Ordering::Relaxed);

      let mut new_anchor = old_anchor;
      new_anchor.set_avail(idx as u64);
      new_anchor.bump_tag();

      if old_anchor.state() == SbState::Full {
        new_anchor.set_state(SbState::Partial);
      }
      if old_anchor.count() == max_count - 1 {
        // entirely free; cannot happen while active because of the
        // reserved credits
        new_anchor.set_state(SbState::Empty);
      } else {
        new_anchor.set_count(old_anchor.count() + 1);
      }

      match desc_ref.anchor().compare_exchange_weak(old_anchor, new_anchor) {
        Ok(()) => break new_anchor,
        Err(current) => old_anchor = current,
      }
    };

    if new_anchor.state() == SbState::Empty {
      unregister_superblock(superblock, sb_size);
      unsafe { page_free(superblock, sb_size) };
      // the descriptor stays discoverable on the partial list; whichever
      // thread pops it observes Empty and retires it
      debug!("released superblock {:p} of class {}", superblock, self.class.0);
    } else if old_anchor.state() == SbState::Full {
      self.push_partial(desc);
    }
  }

  fn pop_partial(&self) -> Option<NonNull<Descriptor>> {
    let mut old = self.partial.load();
    loop {
      let desc = old.desc()?;
      let next = unsafe { desc.as_ref() }.next_partial().load();
      let new = DescNode::new(next.desc(), old.counter());
      match self.partial.compare_exchange_weak(old, new) {
        Ok(()) => return Some(desc),
        Err(current) => old = current,
      }
    }
  }

  fn push_partial(&self, desc: NonNull<Descriptor>) {
    let mut old = self.partial.load();
    loop {
      unsafe { desc.as_ref() }.next_partial().store(old);
      let new = DescNode::new(Some(desc), old.counter() + 1);
      match self.partial.compare_exchange_weak(old, new) {
        Ok(()) => return,
        Err(current) => old = current,
      }
    }
  }

  pub(crate) fn audit_active(&self) -> Option<(NonNull<Descriptor>, u64)> {
    self.active.load().map(|a| (a.desc(), a.credits()))
  }

  pub(crate) fn audit_partial_head(&self) -> DescNode {
    self.partial.load()
  }
}

/// Atomic view of the free-stack link stored in the first word of a free
/// block. Going through an atomic keeps the raced re-read in the CAS loops
/// well-defined; a stale value just fails the anchor CAS.
#[inline(always)]
fn free_link(block: *mut u8) -> &'static AtomicU64 {
  unsafe { &*(block as *const AtomicU64) }
}
