use std::collections::HashSet;

use lfalloc::{
  LfAlloc,
  audit,
  classes::{
    SCLASS_CUTOFF,
    class_for,
  },
};

#[test]
fn test_roundtrip_preserves_pattern() {
  for _ in 0..100_000 {
    let ptr = LfAlloc::allocate(64);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % 16, 0);

    unsafe {
      ptr.write_bytes(0xA5, 64);
      for i in 0..64 {
        assert_eq!(*ptr.add(i), 0xA5);
      }
      LfAlloc::deallocate(ptr);
    }
  }
}

#[test]
fn test_outstanding_blocks_keep_their_bytes() {
  let keeper = LfAlloc::allocate(64);
  unsafe { keeper.write_bytes(0x5A, 64) };

  // churn the same class while the keeper is live
  for _ in 0..10_000 {
    let ptr = LfAlloc::allocate(64);
    unsafe {
      ptr.write_bytes(0xFF, 64);
      LfAlloc::deallocate(ptr);
    }
  }

  unsafe {
    for i in 0..64 {
      assert_eq!(*keeper.add(i), 0x5A);
    }
    LfAlloc::deallocate(keeper);
  }
}

#[test]
fn test_zero_size_sentinel() {
  let ptr = LfAlloc::allocate(0);
  assert!(!ptr.is_null());
  assert_eq!(ptr, LfAlloc::sentinel());
  assert_eq!(LfAlloc::usable_size(ptr), 0);

  // freeing the sentinel is a no-op
  unsafe { LfAlloc::deallocate(ptr) };

  // and it revives like a null pointer under realloc
  let grown = unsafe { LfAlloc::reallocate(ptr, 64) };
  assert!(!LfAlloc::is_invalid(grown));
  unsafe { LfAlloc::deallocate(grown) };
}

#[test]
fn test_usable_size_covers_request() {
  let ptr = LfAlloc::allocate(300);
  assert!(LfAlloc::usable_size(ptr) >= 300);
  // 300 rounds up to the 304-byte class
  assert_eq!(LfAlloc::usable_size(ptr), 304);
  unsafe { LfAlloc::deallocate(ptr) };
}

#[test]
fn test_class_boundary_sizes() {
  // exactly one class size, one under, one over
  let exact = LfAlloc::allocate(160);
  let under = LfAlloc::allocate(159);
  let over = LfAlloc::allocate(161);

  assert_eq!(LfAlloc::usable_size(exact), 160);
  assert_eq!(LfAlloc::usable_size(under), 160);
  assert_eq!(LfAlloc::usable_size(over), 176);

  unsafe {
    LfAlloc::deallocate(exact);
    LfAlloc::deallocate(under);
    LfAlloc::deallocate(over);
  }
}

#[test]
fn test_calloc_zeroes_and_checks_overflow() {
  let ptr = LfAlloc::allocate_zeroed(8, 25);
  assert!(!LfAlloc::is_invalid(ptr));
  unsafe {
    for i in 0..200 {
      assert_eq!(*ptr.add(i), 0);
    }
    LfAlloc::deallocate(ptr);
  }

  assert!(LfAlloc::allocate_zeroed(usize::MAX, 2).is_null());
  assert!(LfAlloc::allocate_zeroed(2, usize::MAX).is_null());
}

#[test]
fn test_realloc_preserves_contents() {
  let ptr = LfAlloc::allocate(100);
  unsafe {
    for i in 0..100 {
      *ptr.add(i) = i as u8;
    }
  }

  // grow: every original byte must survive
  let grown = unsafe { LfAlloc::reallocate(ptr, 5000) };
  assert!(!grown.is_null());
  unsafe {
    for i in 0..100 {
      assert_eq!(*grown.add(i), i as u8);
    }
  }

  // shrink: the prefix survives
  let shrunk = unsafe { LfAlloc::reallocate(grown, 40) };
  assert!(!shrunk.is_null());
  unsafe {
    for i in 0..40 {
      assert_eq!(*shrunk.add(i), i as u8);
    }
    LfAlloc::deallocate(shrunk);
  }

  // realloc of null behaves like malloc
  let fresh = unsafe { LfAlloc::reallocate(std::ptr::null_mut(), 64) };
  assert!(!fresh.is_null());
  unsafe { LfAlloc::deallocate(fresh) };
}

#[test]
fn test_large_allocation_roundtrip() {
  let size = 3 * 1024 * 1024;
  assert!(class_for(size).is_none());

  let ptr = LfAlloc::allocate(size);
  assert!(!ptr.is_null());
  assert_eq!(ptr as usize % lfalloc::prelude::page_size(), 0);
  assert!(LfAlloc::usable_size(ptr) >= size);

  unsafe {
    *ptr = 0xEE;
    *ptr.add(size - 1) = 0xEE;
    assert_eq!(*ptr, 0xEE);
    assert_eq!(*ptr.add(size - 1), 0xEE);
    LfAlloc::deallocate(ptr);
  }
}

#[test]
fn test_aligned_small_allocation() {
  let ptr = LfAlloc::allocate_aligned(4096, 128);
  assert!(!ptr.is_null());
  assert_eq!(ptr as usize % 4096, 0);
  assert!(LfAlloc::usable_size(ptr) >= 128);

  unsafe {
    ptr.write_bytes(0x11, 128);
    LfAlloc::deallocate(ptr);
  }
}

#[test]
fn test_aligned_large_allocation() {
  let align = 65536;
  let size = 5 * 1024 * 1024;
  assert!(size > SCLASS_CUTOFF);

  let ptr = LfAlloc::allocate_aligned(align, size);
  assert!(!ptr.is_null());
  assert_eq!(ptr as usize % align, 0);
  assert!(LfAlloc::usable_size(ptr) >= size);

  unsafe {
    *ptr = 0x22;
    *ptr.add(size - 1) = 0x22;
    LfAlloc::deallocate(ptr);
  }
}

#[test]
fn test_bogus_alignment_is_rejected() {
  assert!(LfAlloc::allocate_aligned(3, 64).is_null());
  assert!(LfAlloc::allocate_aligned(0, 64).is_null());
}

#[test]
fn test_free_chain_matches_anchor() {
  // class 2560 is not used by any other test in this binary, so the bin is
  // quiescent while we walk its free stack
  let ptrs: Vec<*mut u8> = (0..5).map(|_| LfAlloc::allocate(2500)).collect();
  assert!(ptrs.iter().all(|p| !p.is_null()));
  unsafe {
    LfAlloc::deallocate(ptrs[1]);
    LfAlloc::deallocate(ptrs[3]);
  }

  let class = class_for(2500).unwrap();
  let report = audit::bin_audit(class);
  let desc = report.active_desc.expect("class should have an active superblock");

  let anchor = unsafe { desc.as_ref() }.anchor().load();
  let max_count = unsafe { desc.as_ref() }.max_count() as u64;
  assert!(anchor.count() <= max_count);

  // installed active superblock: stack holds count + credits + 1 blocks
  let steps = anchor.count() + report.active_credits + 1;
  let mut seen = HashSet::new();
  unsafe {
    audit::walk_free_chain(desc, steps, |idx| {
      assert!(idx < max_count);
      assert!(seen.insert(idx), "free chain revisited block {}", idx);
    });
  }

  unsafe {
    LfAlloc::deallocate(ptrs[0]);
    LfAlloc::deallocate(ptrs[2]);
    LfAlloc::deallocate(ptrs[4]);
  }
}
