//! Single-threaded epoll event loop.
//!
//! Sources: SIGCHLD through a signalfd, one OOM eventfd per running
//! container, a periodic timer for log rotation and a deferred queue for
//! timed events (respawn delays). The daemon thread blocks in
//! [`EventLoop::wait`] and hands every event to the holder.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::debug;

use crate::error::Result;
use crate::ContainerId;

/// An event delivered to the holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A child exited; `status` is the raw wait status.
    Exit {
        /// Pid as seen by the supervisor.
        pid: Pid,
        /// Raw wait status.
        status: i32,
    },
    /// An OOM eventfd fired.
    Oom {
        /// Raw descriptor number of the eventfd.
        fd: i32,
    },
    /// Periodic sweep: rotate stdio logs, collect aged dead containers.
    RotateLogs,
    /// A scheduled respawn came due.
    Respawn(ContainerId),
    /// SIGTERM or SIGINT arrived; the daemon should shut down.
    Shutdown,
}

#[derive(Debug)]
struct Deferred {
    due: Instant,
    event: Event,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}
impl Eq for Deferred {}
impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Deferred {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due)
    }
}

/// The epoll loop and its fixed sources.
pub struct EventLoop {
    epoll: Epoll,
    signals: SignalFd,
    timer: TimerFd,
    deferred: Mutex<BinaryHeap<Reverse<Deferred>>>,
}

impl EventLoop {
    /// Build the loop: block the handled signals, arm the signalfd and the
    /// rotation timer.
    ///
    /// # Errors
    ///
    /// Returns an error if a descriptor cannot be created or registered.
    pub fn new(rotate_interval: Duration) -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGINT);
        mask.thread_block()?;

        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)?;
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK,
        )?;
        timer.set(
            Expiration::Interval(TimeSpec::from_duration(rotate_interval)),
            TimerSetTimeFlags::empty(),
        )?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(
            &signals,
            EpollEvent::new(EpollFlags::EPOLLIN, signals.as_raw_fd() as u64),
        )?;
        epoll.add(
            timer.as_fd(),
            EpollEvent::new(EpollFlags::EPOLLIN, timer.as_fd().as_raw_fd() as u64),
        )?;

        Ok(Self {
            epoll,
            signals,
            timer,
            deferred: Mutex::new(BinaryHeap::new()),
        })
    }

    /// Register a container's OOM eventfd.
    ///
    /// # Errors
    ///
    /// Returns the epoll error.
    pub fn add_oom(&self, fd: BorrowedFd<'_>) -> Result<()> {
        self.epoll
            .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, fd.as_raw_fd() as u64))?;
        Ok(())
    }

    /// Drop a container's OOM eventfd from the loop.
    pub fn remove_oom(&self, fd: BorrowedFd<'_>) {
        let _ = self.epoll.delete(fd);
    }

    /// Queue an event for delivery after `delay`.
    pub fn defer(&self, delay: Duration, event: Event) {
        debug!(?event, ?delay, "deferred event");
        self.deferred
            .lock()
            .expect("deferred queue poisoned")
            .push(Reverse(Deferred {
                due: Instant::now() + delay,
                event,
            }));
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deferred
            .lock()
            .expect("deferred queue poisoned")
            .peek()
            .map(|Reverse(d)| d.due)
    }

    fn pop_due(&self, now: Instant) -> Vec<Event> {
        let mut queue = self.deferred.lock().expect("deferred queue poisoned");
        let mut out = Vec::new();
        while queue.peek().is_some_and(|Reverse(d)| d.due <= now) {
            let Reverse(deferred) = queue.pop().expect("peeked entry vanished");
            out.push(deferred.event);
        }
        out
    }

    /// Block until something happens and translate it into events.
    ///
    /// # Errors
    ///
    /// Returns an error if the epoll wait fails.
    pub fn wait(&self) -> Result<Vec<Event>> {
        let timeout = match self.next_deadline() {
            Some(due) => {
                let ms = due.saturating_duration_since(Instant::now()).as_millis();
                EpollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
            }
            None => EpollTimeout::NONE,
        };

        let mut buffer = [EpollEvent::empty(); 32];
        let count = match self.epoll.wait(&mut buffer, timeout) {
            Ok(count) => count,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for item in &buffer[..count] {
            let fd = item.data() as i32;
            if fd == self.signals.as_raw_fd() {
                self.drain_signals(&mut events);
            } else if fd == self.timer.as_fd().as_raw_fd() {
                self.drain_timer();
                events.push(Event::RotateLogs);
            } else {
                events.push(Event::Oom { fd });
            }
        }
        events.extend(self.pop_due(Instant::now()));
        Ok(events)
    }

    fn drain_signals(&self, events: &mut Vec<Event>) {
        while let Ok(Some(info)) = self.signals.read_signal() {
            match info.ssi_signo as i32 {
                libc::SIGCHLD => self.reap_children(events),
                libc::SIGTERM | libc::SIGINT => events.push(Event::Shutdown),
                _ => {}
            }
        }
    }

    fn reap_children(&self, events: &mut Vec<Event>) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(status) => {
                    if let Some((pid, raw)) = raw_wait_status(&status) {
                        events.push(Event::Exit { pid, status: raw });
                    }
                }
            }
        }
    }

    fn drain_timer(&self) {
        let _ = self.timer.wait(); // non-blocking, just clears readiness
    }
}

/// Collapse a `WaitStatus` into the classic `wait(2)` integer encoding.
fn raw_wait_status(status: &WaitStatus) -> Option<(Pid, i32)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((*pid, code << 8)),
        WaitStatus::Signaled(pid, signal, _) => Some((*pid, *signal as i32)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_ordering() {
        let a = Reverse(Deferred {
            due: Instant::now(),
            event: Event::RotateLogs,
        });
        let b = Reverse(Deferred {
            due: Instant::now() + Duration::from_secs(5),
            event: Event::Respawn(ContainerId(3)),
        });
        let mut heap = BinaryHeap::new();
        heap.push(b);
        heap.push(a);
        // The earlier deadline pops first.
        let Reverse(first) = heap.pop().unwrap();
        assert_eq!(first.event, Event::RotateLogs);
    }

    #[test]
    fn test_raw_wait_status_encoding() {
        let exited = WaitStatus::Exited(Pid::from_raw(10), 3);
        assert_eq!(raw_wait_status(&exited), Some((Pid::from_raw(10), 3 << 8)));

        let signaled = WaitStatus::Signaled(Pid::from_raw(11), Signal::SIGKILL, false);
        assert_eq!(raw_wait_status(&signaled), Some((Pid::from_raw(11), 9)));

        assert_eq!(raw_wait_status(&WaitStatus::StillAlive), None);
    }
}
