//! Client surfaces as seen by the scanout core
//!
//! The protocol layer decodes client requests and hands the core a
//! [`Surface`] with its buffer attached and pending damage populated. The
//! core only cares about where the surface is, what changed, which outputs
//! show it and which frame callbacks are waiting on it.
//!
//! Damage has two phases. Requests accumulate into the surface's pending
//! region; a commit hands its extents over to the damage of every output
//! the surface is on. Output damage is the current phase: the render pass
//! consumes it and it is cleared once the frame is submitted.

use std::fmt;
use std::time::Duration;

use crate::error::{CompositorError, CompositorResult};
use crate::output::{OutputId, OutputMask};
use crate::renderer::damage::{Rect, Region};

/// Upper bound on outstanding frame callbacks per surface
pub const MAX_FRAME_CALLBACKS: usize = 16;

/// Identifier of a client surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u32);

impl SurfaceId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface-{}", self.0)
    }
}

/// Token of a client frame callback, owned by the protocol layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameCallback(pub u32);

/// Opaque handle of a client buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// A frame callback that is ready to be sent to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDone {
    pub surface: SurfaceId,
    pub callback: FrameCallback,
    /// Presentation time on the monotonic clock
    pub timestamp: Duration,
}

impl FrameDone {
    /// Timestamp in the millisecond format of `wl_callback.done`
    pub fn time_ms(&self) -> u32 {
        self.timestamp.as_millis() as u32
    }
}

/// One client-visible content source
#[derive(Debug)]
pub struct Surface {
    id: SurfaceId,
    x: i32,
    y: i32,
    width: u32,
    height: u32,

    pending_damage: Region,

    /// Outputs this surface currently intersects
    pub visible_on: OutputMask,
    /// Outputs that flipped since the last frame callback was requested
    pub presented_on: OutputMask,

    callbacks: Vec<FrameCallback>,
    needs_frame_done: bool,

    buffer: Option<BufferHandle>,
    geometry_changed: bool,
}

impl Surface {
    /// Creates a surface at `(x, y)` in the global space
    pub fn new(id: SurfaceId, x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            id,
            x,
            y,
            width,
            height,
            pending_damage: Region::new(),
            visible_on: OutputMask::EMPTY,
            presented_on: OutputMask::EMPTY,
            callbacks: Vec::new(),
            needs_frame_done: false,
            buffer: None,
            geometry_changed: true,
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Region covered by the surface in the global space
    pub fn geometry(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    /// Surface-local rectangle covering the whole surface
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// Moves or resizes the surface
    ///
    /// Both output masks are reset so visibility is re-evaluated on the
    /// next commit. Returns the previous global geometry when anything
    /// changed.
    pub fn set_geometry(&mut self, x: i32, y: i32, width: u32, height: u32) -> Option<Rect> {
        let old = self.geometry();
        if old == Rect::new(x, y, width, height) {
            return None;
        }

        self.x = x;
        self.y = y;
        self.width = width;
        self.height = height;
        self.visible_on.clear();
        self.presented_on.clear();
        self.geometry_changed = true;
        Some(old)
    }

    /// Attaches a client buffer
    pub fn attach(&mut self, buffer: BufferHandle) {
        self.buffer = Some(buffer);
    }

    /// Currently attached buffer
    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    /// Unions surface-local damage into the pending region
    pub fn add_damage(&mut self, rect: Rect) {
        if let Some(clipped) = rect.intersection(&self.bounds()) {
            self.pending_damage.union_rect(clipped);
        }
    }

    pub fn pending_damage(&self) -> &Region {
        &self.pending_damage
    }

    /// Latches pending state on commit
    ///
    /// Returns the surface-local box to propagate to outputs: the extents of
    /// the pending damage, or the full surface when the damage is empty but
    /// geometry or visibility changed.
    pub fn commit(&mut self) -> CompositorResult<Option<Rect>> {
        if self.buffer.is_none() {
            return Err(CompositorError::protocol(
                self.id,
                "commit without an attached buffer",
            ));
        }

        let damage = match self.pending_damage.extents() {
            Some(extents) => Some(extents),
            None if self.geometry_changed || self.visible_on.is_empty() => Some(self.bounds()),
            None => None,
        };
        self.pending_damage.clear();
        self.geometry_changed = false;
        Ok(damage)
    }

    /// Registers a frame callback token
    pub fn add_frame_callback(&mut self, callback: FrameCallback) -> CompositorResult<()> {
        if self.callbacks.len() >= MAX_FRAME_CALLBACKS {
            return Err(CompositorError::protocol(
                self.id,
                format!("more than {MAX_FRAME_CALLBACKS} outstanding frame callbacks"),
            ));
        }
        self.callbacks.push(callback);
        self.needs_frame_done = true;
        Ok(())
    }

    /// Whether a frame callback is waiting for a done notification
    pub fn needs_frame_done(&self) -> bool {
        self.needs_frame_done
    }

    /// Outstanding frame callbacks
    pub fn frame_callbacks(&self) -> &[FrameCallback] {
        &self.callbacks
    }

    /// Takes every outstanding callback and resets pacing state
    pub fn take_frame_callbacks(&mut self) -> Vec<FrameCallback> {
        self.needs_frame_done = false;
        self.presented_on.clear();
        std::mem::take(&mut self.callbacks)
    }

    /// Records that `output` completed a flip
    pub fn mark_presented(&mut self, output: OutputId) {
        self.presented_on.insert(output);
    }
}
