use crate::reactor::event::{Interest, Readiness};

use libc::{EV_ADD, EV_DELETE, EV_ENABLE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_WRITE, kevent};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

pub(crate) struct Poller {
    kqueue: OwnedFd,
    events: Vec<kevent>,
    registered: HashMap<RawFd, Interest>,
}

fn change(fd: RawFd, filter: i16, flags: u16) -> kevent {
    let mut event: kevent = unsafe { mem::zeroed() };
    event.ident = fd as _;
    event.filter = filter as _;
    event.flags = flags as _;
    event
}

impl Poller {
    pub(crate) fn new(max_events: usize) -> io::Result<Self> {
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let kqueue = unsafe { OwnedFd::from_raw_fd(fd) };
        let events = vec![unsafe { mem::zeroed::<kevent>() }; max_events.max(1)];

        Ok(Self {
            kqueue,
            events,
            registered: HashMap::new(),
        })
    }

    pub(crate) fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.apply(fd, Interest::empty(), interest)?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    pub(crate) fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let previous = self.registered.get(&fd).copied().unwrap_or(Interest::empty());
        self.apply(fd, previous, interest)?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let previous = self.registered.remove(&fd).unwrap_or(Interest::empty());
        self.apply(fd, previous, Interest::empty())
    }

    pub(crate) fn poll(
        &mut self,
        ready: &mut Vec<Readiness>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let spec = timeout.map(|duration| libc::timespec {
            tv_sec: duration.as_secs() as _,
            tv_nsec: duration.subsec_nanos() as _,
        });
        let spec_ptr = spec
            .as_ref()
            .map_or(ptr::null(), |spec| spec as *const libc::timespec);

        let count = unsafe {
            kevent(
                self.kqueue.as_raw_fd(),
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                spec_ptr,
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
            let mut interest = match event.filter {
                EVFILT_READ => Interest::READ,
                EVFILT_WRITE => Interest::WRITE,
                _ => continue,
            };
            if event.flags & (EV_EOF | EV_ERROR) != 0 {
                interest = Interest::all();
            }

            ready.push(Readiness {
                fd: event.ident as RawFd,
                ready: interest,
            });
        }

        Ok(())
    }

    // Adds the filters that are newly wanted and deletes the ones dropped.
    fn apply(&self, fd: RawFd, previous: Interest, wanted: Interest) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);

        for (direction, filter) in [(Interest::READ, EVFILT_READ), (Interest::WRITE, EVFILT_WRITE)] {
            let had = previous.contains(direction);
            let wants = wanted.contains(direction);
            if wants && !had {
                changes.push(change(fd, filter, EV_ADD | EV_ENABLE));
            } else if had && !wants {
                changes.push(change(fd, filter, EV_DELETE));
            }
        }

        if changes.is_empty() {
            return Ok(());
        }

        let ret = unsafe {
            kevent(
                self.kqueue.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
