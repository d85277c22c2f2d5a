//! Outputs and output bitmasks
//!
//! An [`Output`] is one physical display sink: a connector driven by a CRTC
//! at a fixed mode. Each output carries a small integer id which doubles as
//! its bit index in [`OutputMask`], the compact set type surfaces use to
//! record which outputs they are visible on and which outputs have flipped
//! since their last frame callback.
//!
//! The mask is 32 bits wide, so at most [`MAX_OUTPUTS`] outputs can exist at
//! once. Allocating a 33rd output is a configuration error, never a silent
//! truncation.

use std::fmt;

use crate::error::{CompositorError, CompositorResult};
use crate::renderer::damage::{Rect, Region};
use crate::scanout::{ConnectorId, CrtcId, ModeInfo, NativeSurface};

/// Maximum number of simultaneously existing outputs (bit width of [`OutputMask`])
pub const MAX_OUTPUTS: usize = u32::BITS as usize;

/// Stable small-integer identifier of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(u8);

impl OutputId {
    /// Creates an output id from a bit index
    pub fn new(index: usize) -> CompositorResult<Self> {
        if index >= MAX_OUTPUTS {
            return Err(CompositorError::TooManyOutputs { max: MAX_OUTPUTS });
        }
        Ok(Self(index as u8))
    }

    /// Bit index of this output
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Single-bit mask for this output
    pub fn bit(self) -> u32 {
        1u32 << self.0
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output-{}", self.0)
    }
}

/// A set of outputs stored as one bit per output id
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OutputMask(u32);

impl OutputMask {
    /// The empty set
    pub const EMPTY: OutputMask = OutputMask(0);

    /// Builds a mask from raw bits
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits of the mask
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Adds an output to the set
    pub fn insert(&mut self, id: OutputId) {
        self.0 |= id.bit();
    }

    /// Removes an output from the set
    pub fn remove(&mut self, id: OutputId) {
        self.0 &= !id.bit();
    }

    /// Whether the output is in the set
    pub fn contains(self, id: OutputId) -> bool {
        self.0 & id.bit() != 0
    }

    /// Whether the set is empty
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Clears the set
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Whether every output of `other` is also in `self`
    pub fn covers(self, other: OutputMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Number of outputs in the set
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates the ids in the set in ascending order
    pub fn iter(self) -> impl Iterator<Item = OutputId> {
        (0..MAX_OUTPUTS)
            .filter(move |i| self.0 & (1u32 << i) != 0)
            .map(|i| OutputId(i as u8))
    }
}

impl FromIterator<OutputId> for OutputMask {
    fn from_iter<I: IntoIterator<Item = OutputId>>(iter: I) -> Self {
        let mut mask = OutputMask::EMPTY;
        for id in iter {
            mask.insert(id);
        }
        mask
    }
}

/// Hands out the lowest free output id and recycles released ones
#[derive(Debug, Default)]
pub struct OutputIdAllocator {
    used: OutputMask,
    limit: usize,
}

impl OutputIdAllocator {
    /// Creates an allocator that never hands out more than `limit` ids
    pub fn new(limit: usize) -> Self {
        Self {
            used: OutputMask::EMPTY,
            limit: limit.min(MAX_OUTPUTS),
        }
    }

    /// Allocates the lowest free id
    pub fn allocate(&mut self) -> CompositorResult<OutputId> {
        let index = (0..self.limit)
            .find(|i| self.used.0 & (1u32 << i) == 0)
            .ok_or(CompositorError::TooManyOutputs { max: self.limit })?;
        let id = OutputId::new(index)?;
        self.used.insert(id);
        Ok(id)
    }

    /// Returns an id to the pool
    pub fn release(&mut self, id: OutputId) {
        self.used.remove(id);
    }

    /// Ids currently in use
    pub fn in_use(&self) -> OutputMask {
        self.used
    }
}

/// Per-output scanout state machine
///
/// `Uninitialized → Bootstrapping → Steady ⇄ Suspended`. The
/// bootstrapping state covers the first synchronous mode-set of an output;
/// it is tracked per output so several outputs bootstrap independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// No frame has ever been shown
    Uninitialized,
    /// First synchronous mode-set in progress
    Bootstrapping,
    /// Asynchronous page-flip loop
    Steady,
    /// VT switched away; CRTC disabled
    Suspended,
}

/// One physical display sink
#[derive(Debug)]
pub struct Output {
    id: OutputId,
    name: String,
    connector: ConnectorId,
    crtc: CrtcId,
    mode: ModeInfo,
    x: i32,
    y: i32,
    native: NativeSurface,

    /// Output-local damage accumulated since the last render pass
    pub damage: Region,
    /// Something changed and a frame must be produced
    pub needs_repaint: bool,
    /// An asynchronous flip is outstanding
    pub repaint_in_flight: bool,
}

impl Output {
    /// Creates a new output placed at `(x, y)` in the global space
    pub fn new(
        id: OutputId,
        name: impl Into<String>,
        connector: ConnectorId,
        crtc: CrtcId,
        mode: ModeInfo,
        position: (i32, i32),
        native: NativeSurface,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            connector,
            crtc,
            mode,
            x: position.0,
            y: position.1,
            native,
            damage: Region::new(),
            needs_repaint: false,
            repaint_in_flight: false,
        }
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connector(&self) -> ConnectorId {
        self.connector
    }

    pub fn crtc(&self) -> CrtcId {
        self.crtc
    }

    pub fn mode(&self) -> &ModeInfo {
        &self.mode
    }

    /// Opaque handle of the native surface the renderer draws into
    pub fn native_surface(&self) -> NativeSurface {
        self.native
    }

    /// Refresh rate in millihertz
    pub fn refresh_mhz(&self) -> u32 {
        self.mode.refresh_mhz()
    }

    /// Geometry in the global compositor space
    pub fn geometry(&self) -> Rect {
        Rect::new(self.x, self.y, self.mode.width, self.mode.height)
    }

    /// Output-local rectangle covering the whole output
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.mode.width, self.mode.height)
    }

    /// Moves the output in the global space
    pub fn set_position(&mut self, x: i32, y: i32) {
        self.x = x;
        self.y = y;
    }

    /// Adds damage given in global coordinates, clipped to this output
    pub fn add_global_damage(&mut self, rect: Rect) {
        if let Some(clipped) = rect.intersection(&self.geometry()) {
            self.damage
                .union_rect(clipped.to_screen_coords(-self.x, -self.y));
        }
    }

    /// Marks the entire output as damaged
    pub fn damage_all(&mut self) {
        self.damage.union_rect(self.bounds());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(i: usize) -> OutputId {
        OutputId::new(i).unwrap()
    }

    #[test]
    fn test_output_id_limit() {
        assert!(OutputId::new(31).is_ok());
        assert!(matches!(
            OutputId::new(32),
            Err(CompositorError::TooManyOutputs { max: 32 })
        ));
    }

    #[test]
    fn test_mask_covers() {
        let visible: OutputMask = [id(0), id(1)].into_iter().collect();
        let mut presented = OutputMask::EMPTY;

        presented.insert(id(0));
        assert!(!presented.covers(visible));

        presented.insert(id(1));
        assert!(presented.covers(visible));

        presented.insert(id(5));
        assert!(presented.covers(visible));
        assert_eq!(presented.len(), 3);
    }

    #[test]
    fn test_mask_iter_ascending() {
        let mask: OutputMask = [id(7), id(2), id(31)].into_iter().collect();
        let ids: Vec<usize> = mask.iter().map(OutputId::index).collect();
        assert_eq!(ids, vec![2, 7, 31]);
    }

    #[test]
    fn test_allocator_recycles_lowest_id() {
        let mut alloc = OutputIdAllocator::new(MAX_OUTPUTS);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));

        alloc.release(a);
        assert_eq!(alloc.allocate().unwrap().index(), 0);
    }

    #[test]
    fn test_allocator_refuses_past_limit() {
        let mut alloc = OutputIdAllocator::new(2);
        alloc.allocate().unwrap();
        alloc.allocate().unwrap();
        assert!(matches!(
            alloc.allocate(),
            Err(CompositorError::TooManyOutputs { max: 2 })
        ));
    }

    #[test]
    fn test_global_damage_is_clipped_and_localized() {
        let mut output = Output::new(
            id(1),
            "HDMI-A-1",
            ConnectorId(10),
            CrtcId(20),
            ModeInfo::new(800, 600, 60_000, true),
            (1000, 0),
            NativeSurface(1),
        );

        output.add_global_damage(Rect::new(900, 10, 200, 20));
        assert_eq!(output.damage.extents(), Some(Rect::new(0, 10, 100, 20)));

        output.damage.clear();
        output.add_global_damage(Rect::new(0, 0, 50, 50));
        assert!(output.damage.is_empty());
    }
}
