use super::{EventDesc, Interrupter};
use ffi::{self, RawFd};
use instance::IoMode;

use libc::{epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR,
           EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLL_CLOEXEC, EPOLL_CTL_ADD,
           EPOLL_CTL_DEL};
use std::io;
use std::mem;

const MAX_EVENTS: usize = 128;

pub struct Backend {
    epfd: RawFd,
    intr: Interrupter,
}

impl Backend {
    pub fn new() -> io::Result<Self> {
        let epfd = libc_try!(epoll_create1(EPOLL_CLOEXEC));
        let intr = Interrupter::new()?;
        let backend = Backend {
            epfd: epfd,
            intr: intr,
        };
        let mut ev = epoll_event {
            events: EPOLLIN as u32,
            u64: backend.intr.reader_fd() as u64,
        };
        libc_try!(epoll_ctl(
            backend.epfd,
            EPOLL_CTL_ADD,
            backend.intr.reader_fd(),
            &mut ev
        ));
        Ok(backend)
    }

    pub fn register(&self, fd: RawFd, mode: IoMode) -> bool {
        let mut events = EPOLLET;
        if mode.contains(IoMode::READ) {
            events |= EPOLLIN;
        }
        if mode.contains(IoMode::WRITE) {
            events |= EPOLLOUT;
        }
        let mut ev = epoll_event {
            events: events as u32,
            u64: fd as u64,
        };
        unsafe { epoll_ctl(self.epfd, EPOLL_CTL_ADD, fd, &mut ev) == 0 }
    }

    pub fn deregister(&self, fd: RawFd) {
        let mut ev = epoll_event { events: 0, u64: 0 };
        libc_ign!(epoll_ctl(self.epfd, EPOLL_CTL_DEL, fd, &mut ev));
    }

    pub fn wake(&self) {
        self.intr.interrupt();
    }

    /// Blocks until at least one handle is ready or the interrupter fires.
    /// Wake events are consumed here and never surface to the loop.
    pub fn wait(&self, events: &mut Vec<EventDesc>) {
        events.clear();
        let mut evs: [epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };
        let n = unsafe { epoll_wait(self.epfd, evs.as_mut_ptr(), MAX_EVENTS as i32, -1) };
        if n < 0 {
            // EINTR and friends are tolerated; the loop just iterates again.
            return;
        }
        for ev in &evs[..n as usize] {
            let fd = ev.u64 as RawFd;
            if fd == self.intr.reader_fd() {
                self.intr.drain();
                continue;
            }
            events.push(EventDesc {
                fd: fd,
                input: ev.events & EPOLLIN as u32 != 0,
                output: ev.events & EPOLLOUT as u32 != 0,
                error: ev.events & (EPOLLERR | EPOLLHUP) as u32 != 0,
            });
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        ffi::close(self.epfd);
    }
}
