use super::timeout_millis;
use crate::reactor::event::{Interest, Readiness};

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

pub(crate) struct Poller {
    epoll: OwnedFd,
    events: Vec<epoll_event>,
}

impl Poller {
    pub(crate) fn new(max_events: usize) -> io::Result<Self> {
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        let events = vec![epoll_event { events: 0, u64: 0 }; max_events.max(1)];

        Ok(Self { epoll, events })
    }

    pub(crate) fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, interest)
    }

    pub(crate) fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, interest)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe { epoll_ctl(self.epoll.as_raw_fd(), EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits for readiness and appends one report per ready descriptor.
    ///
    /// An interrupted wait reports nothing.
    pub(crate) fn poll(
        &mut self,
        ready: &mut Vec<Readiness>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let count = unsafe {
            epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_millis(timeout),
            )
        };

        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for event in &self.events[..count as usize] {
            let bits = event.events;
            let token = event.u64;

            let mut interest = Interest::empty();
            if bits & (EPOLLIN | EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
                interest |= Interest::READ;
            }
            if bits & (EPOLLOUT | EPOLLHUP | EPOLLERR) as u32 != 0 {
                interest |= Interest::WRITE;
            }

            ready.push(Readiness {
                fd: token as RawFd,
                ready: interest,
            });
        }

        Ok(())
    }

    fn ctl(&self, op: i32, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut bits = 0u32;
        if interest.contains(Interest::READ) {
            bits |= (EPOLLIN | EPOLLRDHUP) as u32;
        }
        if interest.contains(Interest::WRITE) {
            bits |= EPOLLOUT as u32;
        }

        let mut event = epoll_event {
            events: bits,
            u64: fd as u64,
        };

        let ret = unsafe { epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
