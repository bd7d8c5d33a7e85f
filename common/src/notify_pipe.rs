//! Cross-thread cancellation signal that can sit in a `poll(2)` set.
//!
//! A [`NotifyPipe`] is a non-blocking socket pair used as a self-pipe. Each
//! [`NotifyPipe::notify`] queues one byte; the read end is readable for as
//! long as at least one notification is pending, so a thread blocked in
//! [`NotifyPipe::wait_with`] wakes up whatever else it is waiting on.

use std::{
    io::{self, Read, Write},
    os::{
        fd::{AsFd, BorrowedFd},
        unix::net::UnixStream,
    },
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};

use crate::error::Result;

/// What ended a multiplexed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The cancellation signal fired. Takes priority over data readiness.
    Cancelled,
    /// The data source is readable (or hung up, or in error).
    Ready,
    TimedOut,
}

/// Self-signalling channel. Share it between threads behind an `Arc`.
#[derive(Debug)]
pub struct NotifyPipe {
    reader: UnixStream,
    writer: UnixStream,
}

impl NotifyPipe {
    pub fn new() -> Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    /// Signal every waiter. Never blocks.
    pub fn notify(&self) {
        match (&self.writer).write(&[1]) {
            Ok(_) => {}
            // The buffer is full of earlier notifications; nobody can miss this one.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!("Failed to write to notify pipe: {}", e),
        }
    }

    /// Consume one pending notification, if any.
    pub fn is_signalled(&self) -> bool {
        let mut byte = [0u8; 1];
        loop {
            match (&self.reader).read(&mut byte) {
                Ok(n) => return n == 1,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }

    /// Descriptor that becomes readable while a notification is pending.
    pub fn wait_handle(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    /// Block until notified or until `timeout` elapses (`None` waits forever).
    /// The pending notification is left in place.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let mut fds = [PollFd::new(self.wait_handle(), PollFlags::POLLIN)];
            match poll(&mut fds, poll_timeout(deadline)) {
                Ok(0) if deadline_passed(deadline) => return Ok(false),
                Ok(0) => continue,
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Block until `source` is readable, the signal fires, or `timeout` elapses.
    ///
    /// The signal is checked first so that a stop request wins over pending
    /// data. The pending notification is left in place.
    pub fn wait_with(&self, source: BorrowedFd<'_>, timeout: Option<Duration>) -> Result<Readiness> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let mut fds = [
                PollFd::new(self.wait_handle(), PollFlags::POLLIN),
                PollFd::new(source, PollFlags::POLLIN),
            ];
            match poll(&mut fds, poll_timeout(deadline)) {
                Ok(0) if deadline_passed(deadline) => return Ok(Readiness::TimedOut),
                Ok(0) => continue,
                Ok(_) => {
                    if is_readable(&fds[0]) {
                        return Ok(Readiness::Cancelled);
                    }
                    if is_readable(&fds[1]) {
                        return Ok(Readiness::Ready);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Wait for a single descriptor to become readable before `deadline`.
pub(crate) fn wait_readable(source: BorrowedFd<'_>, deadline: Instant) -> io::Result<bool> {
    loop {
        let mut fds = [PollFd::new(source, PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout(Some(deadline))) {
            Ok(0) if deadline_passed(Some(deadline)) => return Ok(false),
            Ok(0) => continue,
            Ok(_) => return Ok(is_readable(&fds[0])),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Hangups, errors and invalid descriptors count as readable: the next read
/// reports what went wrong.
fn is_readable(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|r| {
        r.intersects(
            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL,
        )
    })
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Milliseconds left until `deadline`, rounded up and capped at what a single
/// `poll` call accepts. Long waits simply loop.
fn poll_timeout(deadline: Option<Instant>) -> PollTimeout {
    let Some(deadline) = deadline else {
        return PollTimeout::NONE;
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    let millis = remaining.as_nanos().div_ceil(1_000_000);
    PollTimeout::from(u16::try_from(millis).unwrap_or(u16::MAX))
}
