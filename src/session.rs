//! Session and seat access
//!
//! The core never opens privileged device nodes itself; it asks a
//! [`Session`] for them and reacts to the seat being taken away and given
//! back. [`SeatSession`] goes through libseat, so the same binary runs under
//! seatd or logind, and VT switches arrive as seat events on the event loop:
//!
//! ```text
//! seat disabled ──► SessionEvent::Disabled ──► suspend
//! seat enabled  ──► SessionEvent::Enabled  ──► resume
//! ```
//!
//! libseat acknowledges a disable as soon as it is announced, so DRM master
//! may already be gone while the outputs are being suspended.

use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;

use log::{debug, info, warn};
use smithay::backend::session::libseat::{self, LibSeatSession, LibSeatSessionNotifier};
use smithay::backend::session::{Event, Session as _};
use smithay::reexports::rustix::fs::OFlags;
use thiserror::Error;

/// Seat state changes delivered to the device session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The seat is ours again; devices may be used
    Enabled,
    /// The seat was taken away; devices must be released
    Disabled,
}

impl From<Event> for SessionEvent {
    fn from(event: Event) -> Self {
        match event {
            Event::ActivateSession => SessionEvent::Enabled,
            Event::PauseSession => SessionEvent::Disabled,
        }
    }
}

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("libseat: {0}")]
    Seat(#[from] libseat::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Brokers access to privileged device nodes
#[cfg_attr(test, mockall::automock)]
pub trait Session {
    /// Opens a device node for reading and writing
    fn open_device(&mut self, path: &Path) -> Result<OwnedFd, SessionError>;

    /// Closes a device node obtained from [`open_device`](Session::open_device)
    fn close_device(&mut self, fd: OwnedFd) -> Result<(), SessionError>;
}

/// Session backed by libseat
pub struct SeatSession {
    inner: LibSeatSession,
}

impl SeatSession {
    /// Takes the seat
    ///
    /// The notifier is a calloop event source yielding the seat's
    /// enable/disable events.
    pub fn open() -> Result<(Self, LibSeatSessionNotifier), SessionError> {
        let (inner, notifier) = LibSeatSession::new()?;
        info!("🔒 Took seat {}", inner.seat());
        Ok((Self { inner }, notifier))
    }

    /// Name of the seat we run on
    pub fn seat(&self) -> String {
        self.inner.seat()
    }
}

impl Session for SeatSession {
    fn open_device(&mut self, path: &Path) -> Result<OwnedFd, SessionError> {
        let flags = OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK;
        let fd = self.inner.open(path, flags)?;
        debug!("opened {} through the seat", path.display());
        Ok(fd)
    }

    fn close_device(&mut self, fd: OwnedFd) -> Result<(), SessionError> {
        self.inner.close(fd)?;
        Ok(())
    }
}

/// Returns a device fd to the session that opened it
pub fn release_device<S: Session>(session: &mut S, path: &Path, fd: OwnedFd) {
    match session.close_device(fd) {
        Ok(()) => debug!("closed {}", path.display()),
        Err(err) => warn!("closing {} failed: {}", path.display(), err),
    }
}
