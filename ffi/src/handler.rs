#![allow(dead_code)]

#[cfg(not(test))]
#[panic_handler]
pub fn panic_handler(info: &core::panic::PanicInfo) -> ! {
  fn report(bytes: &[u8]) {
    unsafe {
      libc::write(libc::STDERR_FILENO, bytes.as_ptr() as *const libc::c_void, bytes.len());
    }
  }

  report(b"lfalloc panic");
  if let Some(message) = info.message().as_str() {
    report(b": ");
    report(message.as_bytes());
  }
  report(b"\n");

  unsafe { libc::abort() }
}
