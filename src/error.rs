//! Error taxonomy for the scanout core
//!
//! Every failure the core can observe falls into one of four classes:
//!
//! - **Transient**: hardware contention such as a flip rejected with `EBUSY`
//!   or a buffer that could not be locked. The output keeps its
//!   `needs_repaint` flag and the next scheduler pass retries.
//! - **Resource exhaustion**: framebuffer registration failed. The buffer
//!   object that was just acquired is handed straight back to the allocator.
//! - **Configuration**: no connected display, no usable CRTC, too many
//!   outputs. Fatal during initialization.
//! - **Protocol**: a client broke the rules (commit without a buffer,
//!   flooding frame callbacks). Only that client is affected.

use std::io;

use thiserror::Error;

use crate::output::OutputId;
use crate::surface::SurfaceId;

/// Coarse classification used to decide how a failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry on the next scheduler pass
    Transient,
    /// Release what was acquired, log, retry later
    ResourceExhaustion,
    /// Abort initialization
    Configuration,
    /// Reject the offending client only
    Protocol,
}

/// Errors raised by a kernel mode-setting backend
#[derive(Debug, Error)]
pub enum KmsError {
    /// The kernel refused the request for now (`EBUSY`, `EAGAIN`, `EINTR`)
    #[error("device busy, try again on the next frame")]
    Busy,

    /// The swap mechanism had no buffer to hand out
    #[error("failed to lock front buffer: {0}")]
    BufferLock(String),

    /// `ADDFB`/`ADDFB2` failed
    #[error("failed to register framebuffer: {0}")]
    Framebuffer(#[source] io::Error),

    /// No connector reports a connected display with at least one mode
    #[error("no connected display found")]
    NoConnector,

    /// A connector has no CRTC it can be driven by
    #[error("no usable CRTC for connector {0}")]
    NoCrtc(u32),

    /// A connector is connected but advertises no modes
    #[error("connector {0} has no display modes")]
    NoMode(u32),

    /// The device node disappeared underneath us
    #[error("DRM device is gone")]
    DeviceGone,

    /// The device lacks a capability the core relies on
    #[error("unsupported by the device: {0}")]
    Unsupported(&'static str),

    /// Any other I/O failure talking to the device
    #[error("DRM I/O error: {0}")]
    Io(#[source] io::Error),
}

impl KmsError {
    /// Classify this error according to the error taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            KmsError::Busy | KmsError::BufferLock(_) | KmsError::DeviceGone | KmsError::Io(_) => {
                ErrorClass::Transient
            }
            KmsError::Framebuffer(_) => ErrorClass::ResourceExhaustion,
            KmsError::NoConnector
            | KmsError::NoCrtc(_)
            | KmsError::NoMode(_)
            | KmsError::Unsupported(_) => ErrorClass::Configuration,
        }
    }

    /// Returns true when the failure should simply be retried next frame
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<io::Error> for KmsError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EBUSY) | Some(libc::EAGAIN) | Some(libc::EINTR) => KmsError::Busy,
            Some(libc::ENODEV) => KmsError::DeviceGone,
            _ => KmsError::Io(err),
        }
    }
}

/// Errors raised by the renderer collaborator
#[derive(Debug, Error)]
pub enum RenderError {
    /// The output has no render target yet
    #[error("no render target for {0}")]
    NoTarget(OutputId),

    /// The client buffer could not be imported
    #[error("failed to import buffer for {surface}: {reason}")]
    Import { surface: SurfaceId, reason: String },

    /// Anything else the renderer wants to report
    #[error("render failure: {0}")]
    Other(String),
}

/// Errors raised by the compositor core
#[derive(Debug, Error)]
pub enum CompositorError {
    /// A kernel mode-setting failure
    #[error(transparent)]
    Kms(#[from] KmsError),

    /// A renderer failure
    #[error(transparent)]
    Render(#[from] RenderError),

    /// The configuration cannot be satisfied
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// More outputs than fit in the visibility bitmask
    #[error("too many outputs: at most {max} are supported")]
    TooManyOutputs { max: usize },

    /// Operation on an output that does not exist
    #[error("unknown output {0}")]
    UnknownOutput(OutputId),

    /// Operation on a surface that does not exist
    #[error("unknown surface {0}")]
    UnknownSurface(SurfaceId),

    /// A client violated the protocol
    #[error("protocol error on {surface}: {message}")]
    Protocol { surface: SurfaceId, message: String },

    /// The session is switched away; the device cannot be touched
    #[error("session is suspended")]
    Suspended,
}

impl CompositorError {
    /// Classify this error according to the error taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            CompositorError::Kms(err) => err.class(),
            CompositorError::Render(RenderError::Import { .. }) => ErrorClass::Protocol,
            CompositorError::Render(_) => ErrorClass::Transient,
            CompositorError::Configuration(_) | CompositorError::TooManyOutputs { .. } => {
                ErrorClass::Configuration
            }
            CompositorError::UnknownOutput(_) | CompositorError::Suspended => {
                ErrorClass::Transient
            }
            CompositorError::UnknownSurface(_) | CompositorError::Protocol { .. } => {
                ErrorClass::Protocol
            }
        }
    }

    /// Shorthand for building a protocol error
    pub fn protocol(surface: SurfaceId, message: impl Into<String>) -> Self {
        CompositorError::Protocol {
            surface,
            message: message.into(),
        }
    }
}

/// Result alias used throughout the core
pub type CompositorResult<T> = std::result::Result<T, CompositorError>;
