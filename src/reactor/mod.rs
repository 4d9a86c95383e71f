//! The backend polling primitive: register/deregister handles, block until
//! readiness or an out-of-band wake, and report a batch of events.

use ffi::{self, RawFd};

use std::io;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use self::epoll::Backend;

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd",
          target_os = "netbsd"))]
mod kqueue;
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd",
          target_os = "netbsd"))]
pub use self::kqueue::Backend;

/// One readiness notification, resolved back to a handle by the loop.
#[derive(Clone, Copy, Debug)]
pub struct EventDesc {
    pub fd: RawFd,
    pub input: bool,
    pub output: bool,
    pub error: bool,
}

/// A nonblocking pipe pair always registered in the poll set, so that
/// `interrupt()` is effective even while the poll call is blocked.
pub struct Interrupter {
    rfd: RawFd,
    wfd: RawFd,
}

impl Interrupter {
    pub fn new() -> io::Result<Self> {
        let (rfd, wfd) = ffi::pipe()?;
        ffi::set_cloexec(rfd)?;
        ffi::set_cloexec(wfd)?;
        ffi::setnonblock(rfd)?;
        ffi::setnonblock(wfd)?;
        Ok(Interrupter { rfd: rfd, wfd: wfd })
    }

    pub fn reader_fd(&self) -> RawFd {
        self.rfd
    }

    pub fn interrupt(&self) {
        let buf: [u8; 1] = [1];
        let _ = ffi::write(self.wfd, &buf);
    }

    /// Empties the wake pipe; a burst of interrupts collapses into one wakeup.
    pub fn drain(&self) {
        let mut buf = [0; 64];
        while ffi::read(self.rfd, &mut buf) > 0 {}
    }
}

impl Drop for Interrupter {
    fn drop(&mut self) {
        ffi::close(self.rfd);
        ffi::close(self.wfd);
    }
}

#[test]
fn test_interrupter() {
    let intr = Interrupter::new().unwrap();
    intr.interrupt();
    intr.interrupt();
    intr.drain();
    let mut buf = [0; 8];
    assert!(ffi::read(intr.reader_fd(), &mut buf) < 0);
}
