//! Stop-the-world introspection hooks for tests.
//!
//! Nothing here is synchronized against concurrent allocator traffic; the
//! caller must quiesce every other thread before trusting the results.

use core::{
  ptr::NonNull,
  sync::atomic::{
    AtomicU64,
    Ordering,
  },
};

use crate::{
  bin::bin_for,
  classes::ScIdx,
  descriptor::{
    Descriptor,
    avail_head,
  },
};

const WALK_CAP: usize = 1 << 20;

pub struct BinAudit {
  pub active_desc: Option<NonNull<Descriptor>>,
  pub active_credits: u64,
  pub partial_len: usize,
}

pub fn bin_audit(class: ScIdx) -> BinAudit {
  let bin = bin_for(class);

  let (active_desc, active_credits) = match bin.audit_active() {
    Some((desc, credits)) => (Some(desc), credits),
    None => (None, 0),
  };

  let mut partial_len = 0;
  let mut node = bin.audit_partial_head();
  while let Some(desc) = node.desc() {
    partial_len += 1;
    assert!(partial_len < WALK_CAP, "partial list walk ran away");
    node = unsafe { desc.as_ref() }.next_partial().load();
  }

  BinAudit {
    active_desc,
    active_credits,
    partial_len,
  }
}

/// Number of descriptors sitting on the global recycle list.
pub fn free_pool_len() -> usize {
  let mut len = 0;
  let mut node = avail_head();
  while let Some(desc) = node.desc() {
    len += 1;
    assert!(len < WALK_CAP, "free pool walk ran away");
    node = unsafe { desc.as_ref() }.next_free().load();
  }
  len
}

/// Follows the intrusive free stack of `desc` for `steps` hops, handing
/// each block index to `f`.
///
/// For a quiesced superblock the stack holds `anchor.count` entries, plus
/// `credits + 1` more when the superblock is installed as active.
///
/// # Safety
///
/// `desc` must have a live superblock (state not Empty, not concurrently
/// released) and no other thread may mutate the allocator during the walk.
pub unsafe fn walk_free_chain<F>(desc: NonNull<Descriptor>, steps: u64, mut f: F)
where
  F: FnMut(u64),
{
  let desc_ref = unsafe { desc.as_ref() };
  let superblock = desc_ref.superblock();
  let block_size = desc_ref.block_size();
  let max_count = desc_ref.max_count() as u64;

  let mut idx = desc_ref.anchor().load().avail();
  for _ in 0..steps {
    assert!(idx < max_count, "free chain escaped the superblock");
    f(idx);

    let block = unsafe { superblock.add(idx as usize * block_size) };
    idx = unsafe { &*(block as *const AtomicU64) }.load(Ordering::Relaxed);
  }
}
