use errno::errno;
use libc;

use std::io;

pub use std::os::unix::io::{AsRawFd, RawFd};

/// The distinguished not-a-handle sentinel.
pub const INVALID_FD: RawFd = -1;

pub fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds: [RawFd; 2] = [0; 2];
    libc_try!(libc::pipe(fds.as_mut_ptr()));
    Ok((fds[0], fds[1]))
}

pub fn close(fd: RawFd) {
    libc_ign!(libc::close(fd));
}

pub fn setnonblock(fd: RawFd) -> io::Result<()> {
    let flags = libc_try!(libc::fcntl(fd, libc::F_GETFL));
    libc_try!(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK));
    Ok(())
}

pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = libc_try!(libc::fcntl(fd, libc::F_GETFD));
    libc_try!(libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC));
    Ok(())
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) as isize }
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) as isize }
}

pub fn last_errno() -> i32 {
    errno().0
}

pub fn would_block(err: i32) -> bool {
    err == libc::EAGAIN || err == libc::EWOULDBLOCK
}

pub fn interrupted(err: i32) -> bool {
    err == libc::EINTR
}

#[test]
fn test_pipe_nonblock() {
    let (rfd, wfd) = pipe().unwrap();
    setnonblock(rfd).unwrap();
    setnonblock(wfd).unwrap();

    let mut buf = [0; 8];
    assert_eq!(read(rfd, &mut buf), -1);
    assert!(would_block(last_errno()));

    assert_eq!(write(wfd, b"ab"), 2);
    assert_eq!(read(rfd, &mut buf), 2);
    assert_eq!(&buf[..2], b"ab");

    close(rfd);
    close(wfd);
}
