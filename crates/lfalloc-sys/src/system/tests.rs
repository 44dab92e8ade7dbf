use super::*;
use crate::prim::page_size;

#[test]
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn test_alloc_dealloc_roundtrip() {
  let size = page_size();

  unsafe {
    let memory = GLOBAL_SYSTEM.alloc(size, SysOption::Commit);
    assert!(memory.is_ok());

    let slice = memory.unwrap();
    assert_eq!(slice.len(), size);

    slice[0] = 42;
    slice[size - 1] = 24;
    assert_eq!(slice[0], 42);
    assert_eq!(slice[size - 1], 24);

    assert!(GLOBAL_SYSTEM.dealloc(slice).is_ok());
  }
}

#[test]
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn test_alloc_is_zeroed() {
  let size = page_size() * 4;

  unsafe {
    let slice = GLOBAL_SYSTEM.alloc(size, SysOption::Commit).unwrap();
    assert!(slice.iter().all(|b| *b == 0));
    assert!(GLOBAL_SYSTEM.dealloc(slice).is_ok());
  }
}

#[test]
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn test_reserve_commits_on_touch() {
  // 1 GiB reservation; only a few pages are ever touched.
  let size = 1 << 30;

  unsafe {
    let slice = GLOBAL_SYSTEM.alloc(size, SysOption::Reserve).unwrap();

    slice[0] = 1;
    slice[size / 2] = 2;
    slice[size - 1] = 3;
    assert_eq!(slice[0], 1);
    assert_eq!(slice[size / 2], 2);
    assert_eq!(slice[size - 1], 3);

    assert!(GLOBAL_SYSTEM.dealloc(slice).is_ok());
  }
}

#[test]
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn test_unaligned_size_rejected() {
  unsafe {
    let result = GLOBAL_SYSTEM.alloc(123, SysOption::Commit);
    assert!(matches!(result, Err(SysError::InvalidArgument)));
  }
}

#[test]
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn test_unsupported_system() {
  unsafe {
    let result = GLOBAL_SYSTEM.alloc(4096, SysOption::Commit);
    assert!(matches!(result, Err(SysError::Unsupported)));
  }
}
