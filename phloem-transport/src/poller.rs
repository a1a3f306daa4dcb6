//! Readiness polling with runtime-selectable backends
//!
//! One `Poller` serves all connections owned by a worker thread. On Linux the
//! backend is chosen at runtime between `epoll`, `poll`, and `select` (the
//! latter two rebuild their fd sets from the registration table on every
//! call); elsewhere `mio` provides the platform mechanism. Registrations are
//! keyed by caller-chosen tokens, which come back in [`IoEvent`]s.
//!
//! Error conditions (HUP/ERR) are reported as readable so the owning loop
//! observes the failure on its next read and tears the connection down.

use crate::{Error, Result};
use std::time::Duration;

#[cfg(target_os = "linux")]
use nix::poll::{PollFd, PollFlags, PollTimeout};
#[cfg(target_os = "linux")]
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
#[cfg(target_os = "linux")]
use nix::sys::select::{select, FdSet};
#[cfg(target_os = "linux")]
use nix::sys::time::TimeVal;
#[cfg(not(target_os = "linux"))]
use std::collections::HashMap;
use std::os::fd::RawFd;

/// Available polling backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerKind {
    /// Linux epoll, the default on Linux
    #[cfg(target_os = "linux")]
    Epoll,
    /// POSIX poll, no fd limit
    #[cfg(target_os = "linux")]
    Poll,
    /// POSIX select, ~1024 fd limit but microsecond timeouts
    #[cfg(target_os = "linux")]
    Select,
    /// mio (kqueue on macOS/BSD, IOCP on Windows)
    #[cfg(not(target_os = "linux"))]
    Mio,
}

impl Default for PollerKind {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        {
            PollerKind::Epoll
        }
        #[cfg(not(target_os = "linux"))]
        {
            PollerKind::Mio
        }
    }
}

impl std::fmt::Display for PollerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(target_os = "linux")]
            PollerKind::Epoll => write!(f, "epoll"),
            #[cfg(target_os = "linux")]
            PollerKind::Poll => write!(f, "poll"),
            #[cfg(target_os = "linux")]
            PollerKind::Select => write!(f, "select"),
            #[cfg(not(target_os = "linux"))]
            PollerKind::Mio => write!(f, "mio"),
        }
    }
}

impl std::str::FromStr for PollerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            #[cfg(target_os = "linux")]
            "epoll" => Ok(PollerKind::Epoll),
            #[cfg(target_os = "linux")]
            "poll" => Ok(PollerKind::Poll),
            #[cfg(target_os = "linux")]
            "select" => Ok(PollerKind::Select),
            #[cfg(not(target_os = "linux"))]
            "mio" => Ok(PollerKind::Mio),
            _ => Err(Error::Config(format!("unknown io backend: {s}"))),
        }
    }
}

/// Readiness interest for a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };
    pub const READ_WRITE: Interest = Interest { read: true, write: true };
}

/// One readiness notification
#[derive(Debug, Clone, Copy)]
pub struct IoEvent {
    pub token: usize,
    pub read: bool,
    pub write: bool,
}

/// Registration table entry
#[derive(Debug, Clone, Copy)]
struct Slot {
    token: usize,
    fd: RawFd,
    interest: Interest,
}

enum Engine {
    #[cfg(target_os = "linux")]
    Epoll { epoll: Epoll, events: Vec<EpollEvent> },
    #[cfg(target_os = "linux")]
    Poll,
    #[cfg(target_os = "linux")]
    Select,
    #[cfg(not(target_os = "linux"))]
    Mio { poll: mio::Poll, events: mio::Events, fds: HashMap<usize, RawFd> },
}

/// Token-keyed readiness poller
pub struct Poller {
    engine: Engine,
    #[cfg(target_os = "linux")]
    slots: Vec<Slot>,
}

impl Poller {
    #[cfg(target_os = "linux")]
    pub fn new(kind: PollerKind) -> Result<Self> {
        let engine = match kind {
            PollerKind::Epoll => Engine::Epoll {
                epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
                events: Vec::with_capacity(256),
            },
            PollerKind::Poll => Engine::Poll,
            PollerKind::Select => Engine::Select,
        };
        Ok(Self { engine, slots: Vec::new() })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new(kind: PollerKind) -> Result<Self> {
        let engine = match kind {
            PollerKind::Mio => Engine::Mio {
                poll: mio::Poll::new()?,
                events: mio::Events::with_capacity(256),
                fds: HashMap::new(),
            },
        };
        Ok(Self { engine })
    }

    pub fn kind(&self) -> PollerKind {
        match &self.engine {
            #[cfg(target_os = "linux")]
            Engine::Epoll { .. } => PollerKind::Epoll,
            #[cfg(target_os = "linux")]
            Engine::Poll => PollerKind::Poll,
            #[cfg(target_os = "linux")]
            Engine::Select => PollerKind::Select,
            #[cfg(not(target_os = "linux"))]
            Engine::Mio { .. } => PollerKind::Mio,
        }
    }

    /// Register a source under `token`
    #[cfg(target_os = "linux")]
    pub fn register<F: std::os::fd::AsRawFd>(
        &mut self,
        source: &F,
        token: usize,
        interest: Interest,
    ) -> Result<()> {
        let fd = source.as_raw_fd();
        if let Engine::Epoll { epoll, .. } = &self.engine {
            let event = EpollEvent::new(epoll_flags(interest), token as u64);
            epoll.add(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, event)?;
        }
        self.slots.push(Slot { token, fd, interest });
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn register<F: std::os::fd::AsRawFd>(
        &mut self,
        source: &F,
        token: usize,
        interest: Interest,
    ) -> Result<()> {
        let fd = source.as_raw_fd();
        let Engine::Mio { poll, fds, .. } = &mut self.engine;
        let mut src = mio::unix::SourceFd(&fd);
        poll.registry().register(&mut src, mio::Token(token), mio_interest(interest))?;
        fds.insert(token, fd);
        Ok(())
    }

    /// Change the interest mask for `token`
    #[cfg(target_os = "linux")]
    pub fn modify(&mut self, token: usize, interest: Interest) -> Result<()> {
        let Some(slot) = self.slots.iter_mut().find(|s| s.token == token) else {
            return Err(Error::Config(format!("modify of unregistered token {token}")));
        };
        slot.interest = interest;
        let fd = slot.fd;
        if let Engine::Epoll { epoll, .. } = &self.engine {
            let mut event = EpollEvent::new(epoll_flags(interest), token as u64);
            epoll.modify(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &mut event)?;
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn modify(&mut self, token: usize, interest: Interest) -> Result<()> {
        let Engine::Mio { poll, fds, .. } = &mut self.engine;
        let Some(&fd) = fds.get(&token) else {
            return Err(Error::Config(format!("modify of unregistered token {token}")));
        };
        let mut src = mio::unix::SourceFd(&fd);
        poll.registry().reregister(&mut src, mio::Token(token), mio_interest(interest))?;
        Ok(())
    }

    /// Remove the registration for `token`
    #[cfg(target_os = "linux")]
    pub fn deregister(&mut self, token: usize) -> Result<()> {
        let Some(idx) = self.slots.iter().position(|s| s.token == token) else {
            return Ok(());
        };
        let slot = self.slots.swap_remove(idx);
        if let Engine::Epoll { epoll, .. } = &self.engine {
            epoll.delete(unsafe { std::os::fd::BorrowedFd::borrow_raw(slot.fd) })?;
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn deregister(&mut self, token: usize) -> Result<()> {
        let Engine::Mio { poll, fds, .. } = &mut self.engine;
        if let Some(fd) = fds.remove(&token) {
            let mut src = mio::unix::SourceFd(&fd);
            poll.registry().deregister(&mut src)?;
        }
        Ok(())
    }

    /// Wait for readiness, at most `timeout` (None blocks indefinitely)
    #[cfg(target_os = "linux")]
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<IoEvent>> {
        match &mut self.engine {
            Engine::Epoll { epoll, events } => {
                events.clear();
                events.resize(256, EpollEvent::empty());
                let timeout_val = match timeout {
                    Some(d) => {
                        let ms = d.as_millis().min(u32::MAX as u128) as u32;
                        EpollTimeout::try_from(ms).unwrap_or(EpollTimeout::NONE)
                    }
                    None => EpollTimeout::NONE,
                };
                let n = epoll.wait(events, timeout_val)?;
                Ok(events[..n]
                    .iter()
                    .map(|e| {
                        let flags = e.events();
                        IoEvent {
                            token: e.data() as usize,
                            read: flags.intersects(
                                EpollFlags::EPOLLIN
                                    | EpollFlags::EPOLLHUP
                                    | EpollFlags::EPOLLERR
                                    | EpollFlags::EPOLLRDHUP,
                            ),
                            write: flags.contains(EpollFlags::EPOLLOUT),
                        }
                    })
                    .collect())
            }
            Engine::Poll => poll_wait(&self.slots, timeout),
            Engine::Select => select_wait(&self.slots, timeout),
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<IoEvent>> {
        let Engine::Mio { poll, events, .. } = &mut self.engine;
        events.clear();
        poll.poll(events, timeout)?;
        Ok(events
            .iter()
            .map(|e| IoEvent {
                token: e.token().0,
                read: e.is_readable() || e.is_read_closed() || e.is_error(),
                write: e.is_writable(),
            })
            .collect())
    }

    /// Number of registered sources
    #[cfg(target_os = "linux")]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(not(target_os = "linux"))]
    pub fn len(&self) -> usize {
        let Engine::Mio { fds, .. } = &self.engine;
        fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(target_os = "linux")]
fn epoll_flags(interest: Interest) -> EpollFlags {
    // Level-triggered so unread bytes keep the fd hot
    let mut flags = EpollFlags::empty();
    if interest.read {
        flags |= EpollFlags::EPOLLIN;
    }
    if interest.write {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

#[cfg(not(target_os = "linux"))]
fn mio_interest(interest: Interest) -> mio::Interest {
    match (interest.read, interest.write) {
        (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
        (false, true) => mio::Interest::WRITABLE,
        _ => mio::Interest::READABLE,
    }
}

#[cfg(target_os = "linux")]
fn poll_wait(slots: &[Slot], timeout: Option<Duration>) -> Result<Vec<IoEvent>> {
    if slots.is_empty() {
        if let Some(d) = timeout {
            std::thread::sleep(d);
        }
        return Ok(Vec::new());
    }

    let mut poll_fds: Vec<PollFd> = slots
        .iter()
        .map(|slot| {
            let mut flags = PollFlags::empty();
            if slot.interest.read {
                flags |= PollFlags::POLLIN;
            }
            if slot.interest.write {
                flags |= PollFlags::POLLOUT;
            }
            unsafe { PollFd::new(std::os::fd::BorrowedFd::borrow_raw(slot.fd), flags) }
        })
        .collect();

    let timeout_val = match timeout {
        Some(d) => PollTimeout::try_from(d).unwrap_or(PollTimeout::ZERO),
        None => PollTimeout::NONE,
    };
    nix::poll::poll(&mut poll_fds, timeout_val)?;

    Ok(poll_fds
        .iter()
        .zip(slots.iter())
        .filter_map(|(pfd, slot)| {
            let revents = pfd.revents()?;
            if revents.is_empty() {
                return None;
            }
            Some(IoEvent {
                token: slot.token,
                read: revents
                    .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR),
                write: revents.contains(PollFlags::POLLOUT),
            })
        })
        .collect())
}

#[cfg(target_os = "linux")]
fn select_wait(slots: &[Slot], timeout: Option<Duration>) -> Result<Vec<IoEvent>> {
    if slots.is_empty() {
        if let Some(d) = timeout {
            std::thread::sleep(d);
        }
        return Ok(Vec::new());
    }

    let mut read_fds = FdSet::new();
    let mut write_fds = FdSet::new();
    let mut max_fd: RawFd = 0;
    for slot in slots {
        if slot.interest.read {
            read_fds.insert(unsafe { std::os::fd::BorrowedFd::borrow_raw(slot.fd) });
        }
        if slot.interest.write {
            write_fds.insert(unsafe { std::os::fd::BorrowedFd::borrow_raw(slot.fd) });
        }
        max_fd = max_fd.max(slot.fd);
    }

    let mut timeout_val =
        timeout.map(|d| TimeVal::new(d.as_secs() as i64, d.subsec_micros() as i64));
    select(
        Some(max_fd + 1),
        Some(&mut read_fds),
        Some(&mut write_fds),
        None,
        timeout_val.as_mut(),
    )?;

    Ok(slots
        .iter()
        .filter_map(|slot| {
            let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(slot.fd) };
            let read = read_fds.contains(fd);
            let write = write_fds.contains(fd);
            if read || write {
                Some(IoEvent { token: slot.token, read, write })
            } else {
                None
            }
        })
        .collect())
}
