//! # KMS Compositor Library
//!
//! The scanout core of a Wayland display server running directly on kernel
//! mode-setting: it owns the buffers the display hardware scans out, drives
//! page flips in lock-step with vertical blanking, and tells clients when
//! their frame is actually on screen.
//!
//! ## Architecture
//!
//! - `scanout`: the KMS device interface, the four-slot scanout chain and the
//!   per-output controller (mode-set, page flip, flip completion)
//! - `device`: the device session controller (suspend/resume on VT switch,
//!   connector hotplug)
//! - `scheduler`: idle-coalesced repaint scheduling
//! - `renderer`: damage accumulation and the fixed-order render pass
//! - `pacing`: multi-output frame-callback pacing and flip statistics
//! - `compositor`: the single-threaded core tying it all together
//! - `session`: seat/VT access
//! - `backend`: the `drm` + udev + calloop implementation the binary runs
//! - `config`: configuration parsing and management
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kms_compositor::KmsConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = KmsConfig::default();
//!     kms_compositor::backend::run(&config)
//! }
//! ```

pub mod backend;
pub mod compositor;
pub mod config;
pub mod demo;
pub mod device;
pub mod error;
pub mod output;
pub mod pacing;
pub mod renderer;
pub mod scanout;
pub mod scheduler;
pub mod session;
pub mod surface;

// Re-export main types for easy access
pub use compositor::Compositor;
pub use config::KmsConfig;
pub use device::DeviceSession;
pub use error::{CompositorError, CompositorResult, ErrorClass, KmsError};
pub use output::{Output, OutputId, OutputMask};
pub use scanout::KmsBackend;
pub use surface::{Surface, SurfaceId};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
