use crate::builder::Config;
use crate::io::sys;
use crate::reactor::event::{Interest, Readiness};
use crate::reactor::poller::Poller;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Key of an armed timer. Unique for the lifetime of the reactor.
pub(crate) type TimerKey = (Instant, u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IoWatcher {
    pub(crate) fid: u32,
    pub(crate) interest: Interest,
}

#[derive(Clone, Copy, Debug)]
struct ChildWatcher {
    fid: u32,
    status: Option<i32>,
}

/// Something the reactor observed during a turn.
///
/// Ownership is re-checked at dispatch time: a fiber resumed earlier in the
/// same turn may have disarmed a watcher that was still live when collected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wakeup {
    Io { fd: RawFd, ready: Interest },
    Timer { key: TimerKey, fid: u32 },
    Child { pid: libc::pid_t, fid: u32 },
}

/// Readiness, timer and child-exit watchers for one runtime.
pub(crate) struct Reactor {
    poller: Poller,
    io: HashMap<RawFd, IoWatcher>,
    timers: BTreeMap<TimerKey, u32>,
    next_timer_seq: u64,
    children: HashMap<libc::pid_t, ChildWatcher>,
    readiness: Vec<Readiness>,
    child_poll_interval: Duration,
}

impl Reactor {
    pub(crate) fn new(config: &Config) -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new(config.max_events)?,
            io: HashMap::new(),
            timers: BTreeMap::new(),
            next_timer_seq: 0,
            children: HashMap::new(),
            readiness: Vec::with_capacity(config.max_events),
            child_poll_interval: config.child_poll_interval,
        })
    }

    /// Arms `fd` for `interest` on behalf of `fid`.
    ///
    /// Nothing changes when the descriptor is already armed for exactly this
    /// fiber and set of directions.
    pub(crate) fn watch_io(&mut self, fd: RawFd, fid: u32, interest: Interest) -> io::Result<()> {
        let watcher = IoWatcher { fid, interest };

        match self.io.get(&fd) {
            Some(current) if *current == watcher => return Ok(()),
            Some(current) if current.interest == interest => {}
            Some(_) => self.poller.reregister(fd, interest)?,
            None => self.poller.register(fd, interest)?,
        }

        self.io.insert(fd, watcher);
        Ok(())
    }

    /// Disarms `fd` if its armed directions overlap `interest`.
    pub(crate) fn unwatch_io(&mut self, fd: RawFd, interest: Interest) {
        let Some(watcher) = self.io.get(&fd) else {
            return;
        };
        if !watcher.interest.intersects(interest) {
            return;
        }

        self.io.remove(&fd);
        if let Err(err) = self.poller.deregister(fd) {
            // The descriptor may already be closed; the kernel forgot it then.
            trace!(fd, error = %err, "deregister failed");
        }
    }

    pub(crate) fn io_watcher(&self, fd: RawFd) -> Option<IoWatcher> {
        self.io.get(&fd).copied()
    }

    pub(crate) fn arm_timer(&mut self, fid: u32, after: Duration) -> TimerKey {
        self.arm_deadline(fid, Instant::now() + after)
    }

    pub(crate) fn arm_deadline(&mut self, fid: u32, deadline: Instant) -> TimerKey {
        let key = (deadline, self.next_timer_seq);
        self.next_timer_seq += 1;
        self.timers.insert(key, fid);
        key
    }

    pub(crate) fn cancel_timer(&mut self, key: TimerKey) {
        self.timers.remove(&key);
    }

    pub(crate) fn timer_armed(&self, key: TimerKey) -> bool {
        self.timers.contains_key(&key)
    }

    pub(crate) fn watch_child(&mut self, pid: libc::pid_t, fid: u32) {
        self.children
            .entry(pid)
            .and_modify(|watcher| watcher.fid = fid)
            .or_insert(ChildWatcher { fid, status: None });
    }

    pub(crate) fn child_status(&self, pid: libc::pid_t) -> Option<i32> {
        self.children.get(&pid).and_then(|watcher| watcher.status)
    }

    pub(crate) fn unwatch_child(&mut self, pid: libc::pid_t) {
        self.children.remove(&pid);
    }

    /// True when no watcher of any kind is armed.
    pub(crate) fn is_idle(&self) -> bool {
        self.io.is_empty() && self.timers.is_empty() && self.children.is_empty()
    }

    /// Waits for at most `limit` (or the next deadline) and collects wakeups.
    pub(crate) fn turn(&mut self, limit: Option<Duration>) -> io::Result<Vec<Wakeup>> {
        let now = Instant::now();
        let mut timeout = self
            .timers
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(now));

        if self.children.values().any(|watcher| watcher.status.is_none()) {
            timeout = Some(timeout.map_or(self.child_poll_interval, |current| {
                current.min(self.child_poll_interval)
            }));
        }
        if let Some(limit) = limit {
            timeout = Some(timeout.map_or(limit, |current| current.min(limit)));
        }

        self.readiness.clear();
        self.poller.poll(&mut self.readiness, timeout)?;

        let mut wakeups: Vec<Wakeup> = self
            .readiness
            .iter()
            .map(|readiness| Wakeup::Io {
                fd: readiness.fd,
                ready: readiness.ready,
            })
            .collect();

        let now = Instant::now();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = *entry.key();
            let fid = entry.remove();
            wakeups.push(Wakeup::Timer { key, fid });
        }

        for (&pid, watcher) in self.children.iter_mut() {
            if watcher.status.is_some() {
                continue;
            }
            match sys::try_wait(pid) {
                Ok(Some(status)) => {
                    watcher.status = Some(status);
                    wakeups.push(Wakeup::Child {
                        pid,
                        fid: watcher.fid,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(pid, error = %err, "waitpid failed, reporting the child as lost");
                    watcher.status = Some(-1);
                    wakeups.push(Wakeup::Child {
                        pid,
                        fid: watcher.fid,
                    });
                }
            }
        }

        Ok(wakeups)
    }
}
