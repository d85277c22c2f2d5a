//! Kernel mode-setting interface and scanout state
//!
//! This module defines the narrow interface the core needs from a KMS
//! device ([`KmsBackend`]) together with the plain data types that cross
//! it: connector and mode descriptions, framebuffer layouts and page-flip
//! completion events.
//!
//! - [`slots`]: the four-slot scanout chain owned by every output
//! - [`controller`]: the per-output device controller driving mode-sets
//!   and page flips against the chain

pub mod controller;
pub mod slots;

use std::time::Duration;

use crate::error::KmsError;
use crate::output::OutputId;

pub use controller::{OutputDevice, SubmitOutcome};
pub use slots::{ScanoutSlotChain, Slot, SlotRole};

/// `DRM_FORMAT_MOD_INVALID`: the buffer carries no explicit modifier
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// `DRM_FORMAT_XRGB8888`
pub const DRM_FORMAT_XRGB8888: u32 = fourcc(b'X', b'R', b'2', b'4');

/// Builds a little-endian fourcc code
pub const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | (b as u32) << 8 | (c as u32) << 16 | (d as u32) << 24
}

/// Kernel connector object id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectorId(pub u32);

/// Kernel CRTC object id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrtcId(pub u32);

/// Kernel framebuffer registration id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u32);

/// Handle of the backend-side surface an output renders into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeSurface(pub u32);

/// Identity of a buffer object, used to check slot invariants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// A display mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    pub width: u32,
    pub height: u32,
    refresh_mhz: u32,
    /// Advertised as the connector's preferred mode
    pub preferred: bool,
}

impl ModeInfo {
    pub fn new(width: u32, height: u32, refresh_mhz: u32, preferred: bool) -> Self {
        Self {
            width,
            height,
            refresh_mhz,
            preferred,
        }
    }

    /// Vertical refresh in millihertz
    pub fn refresh_mhz(&self) -> u32 {
        self.refresh_mhz
    }

    /// Duration of one refresh cycle
    pub fn refresh_interval(&self) -> Duration {
        if self.refresh_mhz == 0 {
            return Duration::from_micros(16_667);
        }
        Duration::from_nanos(1_000_000_000_000 / self.refresh_mhz as u64)
    }
}

/// A connector as reported by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: ConnectorId,
    pub name: String,
    pub connected: bool,
    pub modes: Vec<ModeInfo>,
    /// CRTCs able to drive this connector, in preference order
    pub possible_crtcs: Vec<CrtcId>,
}

impl ConnectorInfo {
    /// Whether an output should exist for this connector
    pub fn is_usable(&self) -> bool {
        self.connected && !self.modes.is_empty()
    }

    /// The preferred mode, falling back to the first advertised one
    pub fn preferred_mode(&self) -> Option<ModeInfo> {
        self.modes
            .iter()
            .find(|m| m.preferred)
            .or_else(|| self.modes.first())
            .copied()
    }
}

/// One plane of a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub handle: u32,
    pub pitch: u32,
    pub offset: u32,
}

/// Which framebuffer registration call to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPath {
    /// `ADDFB2` without modifiers
    Legacy,
    /// `ADDFB2` with `DRM_MODE_FB_MODIFIERS`
    Modifiers,
}

/// Everything the kernel needs to register a framebuffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferLayout {
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
    pub planes: Vec<PlaneLayout>,
    /// Format modifier reported by the buffer object, if any
    pub modifier: Option<u64>,
}

impl FramebufferLayout {
    /// The modifier-aware path is mandatory whenever the buffer reports a
    /// modifier other than `DRM_FORMAT_MOD_INVALID`.
    pub fn registration_path(&self) -> RegistrationPath {
        match self.modifier {
            Some(modifier) if modifier != DRM_FORMAT_MOD_INVALID => RegistrationPath::Modifiers,
            _ => RegistrationPath::Legacy,
        }
    }
}

/// A buffer object eligible for scanout
pub trait ScanoutBuffer {
    /// Identity used to assert that no buffer sits in two slots
    fn buffer_id(&self) -> BufferId;

    /// Layout used for framebuffer registration
    fn layout(&self) -> FramebufferLayout;
}

/// A page-flip completion delivered by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipEvent {
    pub output: OutputId,
    /// Kernel vblank sequence number
    pub frame: u32,
    /// Completion time on the monotonic clock
    pub timestamp: Duration,
}

impl FlipEvent {
    /// Decodes the `(frame, sec, usec, user_data)` tuple of a
    /// `DRM_EVENT_FLIP_COMPLETE` whose user data carries the output id.
    pub fn from_kernel(frame: u32, sec: u32, usec: u32, user_context: u64) -> Option<Self> {
        let output = OutputId::new(usize::try_from(user_context).ok()?).ok()?;
        Some(Self {
            output,
            frame,
            timestamp: Duration::from_secs(sec as u64) + Duration::from_micros(usec as u64),
        })
    }
}

/// The kernel/device operations the scanout core consumes
///
/// Implementations own the device file descriptor. All calls happen on the
/// event-loop thread.
pub trait KmsBackend {
    /// Buffer object type handed out by the swap mechanism
    type Buffer: ScanoutBuffer;

    /// Enumerates connectors and their current state
    fn connectors(&mut self) -> Result<Vec<ConnectorInfo>, KmsError>;

    /// Creates the swap mechanism an output renders into
    fn create_native_surface(
        &mut self,
        crtc: CrtcId,
        mode: &ModeInfo,
    ) -> Result<NativeSurface, KmsError>;

    /// Destroys a native surface; every buffer must have been released
    fn destroy_native_surface(&mut self, surface: NativeSurface);

    /// Takes the buffer object the last render pass completed
    fn lock_front_buffer(&mut self, surface: NativeSurface) -> Result<Self::Buffer, KmsError>;

    /// Returns a buffer object to its allocator
    fn release_buffer(&mut self, surface: NativeSurface, buffer: Self::Buffer);

    /// Registers a kernel framebuffer for a buffer object
    fn add_framebuffer(
        &mut self,
        buffer: &Self::Buffer,
        path: RegistrationPath,
    ) -> Result<FramebufferId, KmsError>;

    /// Drops a kernel framebuffer registration
    fn remove_framebuffer(&mut self, framebuffer: FramebufferId);

    /// Synchronous mode-set
    fn set_crtc(
        &mut self,
        crtc: CrtcId,
        framebuffer: FramebufferId,
        connector: ConnectorId,
        mode: &ModeInfo,
    ) -> Result<(), KmsError>;

    /// Turns a CRTC off
    fn disable_crtc(&mut self, crtc: CrtcId) -> Result<(), KmsError>;

    /// Queues an asynchronous flip whose completion carries `output`
    fn page_flip(
        &mut self,
        crtc: CrtcId,
        framebuffer: FramebufferId,
        output: OutputId,
    ) -> Result<(), KmsError>;

    /// Reads pending completion events without blocking
    fn read_events(&mut self) -> Result<Vec<FlipEvent>, KmsError>;

    /// Blocks up to `timeout` for at least one completion event
    fn wait_events(&mut self, timeout: Duration) -> Result<Vec<FlipEvent>, KmsError>;

    /// Gives up DRM master when the VT is released
    fn drop_master(&mut self) -> Result<(), KmsError>;

    /// Takes DRM master back when the VT is acquired
    fn acquire_master(&mut self) -> Result<(), KmsError>;
}
