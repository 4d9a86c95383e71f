use super::{EventDesc, Interrupter};
use ffi::{self, RawFd};
use instance::IoMode;

use libc::{kevent, kqueue, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_CLEAR,
           EV_DELETE, EV_EOF, EV_ERROR};
use std::io;
use std::mem;
use std::ptr;

const MAX_EVENTS: usize = 128;

pub struct Backend {
    kq: RawFd,
    intr: Interrupter,
}

impl Backend {
    pub fn new() -> io::Result<Self> {
        let kq = libc_try!(kqueue());
        let intr = Interrupter::new()?;
        let backend = Backend { kq: kq, intr: intr };
        let kev = make_kevent(backend.intr.reader_fd(), EVFILT_READ, EV_ADD);
        libc_try!(kevent(
            backend.kq,
            &kev,
            1,
            ptr::null_mut(),
            0,
            ptr::null()
        ));
        Ok(backend)
    }

    pub fn register(&self, fd: RawFd, mode: IoMode) -> bool {
        let mut kevs = Vec::with_capacity(2);
        if mode.contains(IoMode::READ) {
            kevs.push(make_kevent(fd, EVFILT_READ, EV_ADD | EV_CLEAR));
        }
        if mode.contains(IoMode::WRITE) {
            kevs.push(make_kevent(fd, EVFILT_WRITE, EV_ADD | EV_CLEAR));
        }
        let rc = unsafe {
            kevent(
                self.kq,
                kevs.as_ptr(),
                kevs.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        rc == 0
    }

    pub fn deregister(&self, fd: RawFd) {
        let kevs = [
            make_kevent(fd, EVFILT_READ, EV_DELETE),
            make_kevent(fd, EVFILT_WRITE, EV_DELETE),
        ];
        // A handle registered read-only reports ENOENT for the write filter.
        for kev in &kevs {
            libc_ign!(kevent(self.kq, kev, 1, ptr::null_mut(), 0, ptr::null()));
        }
    }

    pub fn wake(&self) {
        self.intr.interrupt();
    }

    pub fn wait(&self, events: &mut Vec<EventDesc>) {
        events.clear();
        let mut kevs: [libc::kevent; MAX_EVENTS] = unsafe { mem::zeroed() };
        let n = unsafe {
            kevent(
                self.kq,
                ptr::null(),
                0,
                kevs.as_mut_ptr(),
                MAX_EVENTS as i32,
                ptr::null(),
            )
        };
        if n < 0 {
            return;
        }
        for kev in &kevs[..n as usize] {
            let fd = kev.ident as RawFd;
            if fd == self.intr.reader_fd() {
                self.intr.drain();
                continue;
            }
            events.push(EventDesc {
                fd: fd,
                input: kev.filter == EVFILT_READ,
                output: kev.filter == EVFILT_WRITE,
                error: kev.flags & (EV_ERROR | EV_EOF) != 0,
            });
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        ffi::close(self.kq);
    }
}

fn make_kevent(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
    libc::kevent {
        ident: fd as ::libc::uintptr_t,
        filter: filter,
        flags: flags,
        fflags: 0,
        data: 0,
        udata: ptr::null_mut(),
    }
}
