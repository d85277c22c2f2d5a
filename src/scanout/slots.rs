//! Four-slot scanout chain
//!
//! Every output owns one [`ScanoutSlotChain`]: four buffer-object /
//! framebuffer pairs named *pending*, *current*, *previous* and *older*.
//!
//! ```text
//!   render ──► pending ──flip──► current ──► previous ──► older ──► allocator
//! ```
//!
//! The slots live in a fixed arena indexed through a rotating base, so a
//! completed flip is a single index rotation: *pending* becomes *current*,
//! *current* becomes *previous*, *previous* becomes *older*, and the old
//! *older* pair is handed back to the caller for release. Keeping *older*
//! one frame longer than strictly needed tolerates kernels that still touch
//! the prior-previous buffer briefly after a flip.

use crate::scanout::{FramebufferId, ScanoutBuffer};

const SLOT_COUNT: usize = 4;

/// Role of a slot in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    /// Submitted, waiting for the kernel to flip to it
    Pending = 0,
    /// On screen
    Current = 1,
    /// Shown one frame ago
    Previous = 2,
    /// Shown two frames ago; released on the next rotation
    Older = 3,
}

impl SlotRole {
    pub const ALL: [SlotRole; SLOT_COUNT] = [
        SlotRole::Pending,
        SlotRole::Current,
        SlotRole::Previous,
        SlotRole::Older,
    ];
}

/// A kernel framebuffer registration plus the buffer object backing it
#[derive(Debug)]
pub struct Slot<T> {
    pub framebuffer: FramebufferId,
    pub buffer: T,
}

impl<T> Slot<T> {
    pub fn new(framebuffer: FramebufferId, buffer: T) -> Self {
        Self {
            framebuffer,
            buffer,
        }
    }
}

/// Fixed-depth ring of scanout slots
#[derive(Debug)]
pub struct ScanoutSlotChain<T> {
    slots: [Option<Slot<T>>; SLOT_COUNT],
    base: usize,
}

impl<T> Default for ScanoutSlotChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ScanoutSlotChain<T> {
    /// Creates an empty chain
    pub fn new() -> Self {
        Self {
            slots: [None, None, None, None],
            base: 0,
        }
    }

    fn index(&self, role: SlotRole) -> usize {
        (self.base + role as usize) % SLOT_COUNT
    }

    /// The slot currently playing `role`
    pub fn get(&self, role: SlotRole) -> Option<&Slot<T>> {
        self.slots[self.index(role)].as_ref()
    }

    pub fn pending(&self) -> Option<&Slot<T>> {
        self.get(SlotRole::Pending)
    }

    pub fn current(&self) -> Option<&Slot<T>> {
        self.get(SlotRole::Current)
    }

    /// Whether a submission is waiting in the pending slot
    pub fn has_pending(&self) -> bool {
        self.pending().is_some()
    }

    /// Number of occupied slots
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    /// Fills the pending slot
    ///
    /// Only one slot may go from empty to occupied per submission, so an
    /// occupied pending slot hands the new pair straight back.
    pub fn set_pending(&mut self, slot: Slot<T>) -> Result<(), Slot<T>> {
        let index = self.index(SlotRole::Pending);
        if self.slots[index].is_some() {
            return Err(slot);
        }
        self.slots[index] = Some(slot);
        Ok(())
    }

    /// Empties the pending slot without rotating
    pub fn take_pending(&mut self) -> Option<Slot<T>> {
        let index = self.index(SlotRole::Pending);
        self.slots[index].take()
    }

    /// Rotates the chain after the pending buffer reached the screen
    ///
    /// Returns the pair that fell off the *older* end and must be released.
    /// Without a pending slot there is nothing to promote and the chain is
    /// left untouched.
    pub fn promote(&mut self) -> Option<Slot<T>> {
        if !self.has_pending() {
            return None;
        }

        let older = self.index(SlotRole::Older);
        let released = self.slots[older].take();
        // pending -> current -> previous -> older; the emptied older index
        // becomes the new pending slot.
        self.base = (self.base + SLOT_COUNT - 1) % SLOT_COUNT;
        debug_assert!(self.slots[self.index(SlotRole::Pending)].is_none());
        released
    }

    /// Takes the slots the kernel no longer scans out
    ///
    /// Only *previous* and *older* are returned; *current* is kept so a
    /// resumed CRTC can be re-enabled with it and *pending* belongs to an
    /// outstanding flip.
    pub fn take_idle(&mut self) -> Vec<Slot<T>> {
        [SlotRole::Older, SlotRole::Previous]
            .into_iter()
            .filter_map(|role| {
                let index = self.index(role);
                self.slots[index].take()
            })
            .collect()
    }

    /// Empties every slot, oldest first
    pub fn take_all(&mut self) -> Vec<Slot<T>> {
        SlotRole::ALL
            .into_iter()
            .rev()
            .filter_map(|role| {
                let index = self.index(role);
                self.slots[index].take()
            })
            .collect()
    }

    /// Occupied slots with their roles
    pub fn iter(&self) -> impl Iterator<Item = (SlotRole, &Slot<T>)> {
        SlotRole::ALL
            .into_iter()
            .filter_map(move |role| self.get(role).map(|slot| (role, slot)))
    }
}

impl<T: ScanoutBuffer> ScanoutSlotChain<T> {
    /// Whether a buffer object currently sits in any slot
    pub fn contains_buffer(&self, buffer: &T) -> bool {
        let id = buffer.buffer_id();
        self.iter().any(|(_, slot)| slot.buffer.buffer_id() == id)
    }

    /// No buffer object and no framebuffer is referenced by two slots
    pub fn is_consistent(&self) -> bool {
        let slots: Vec<&Slot<T>> = self.iter().map(|(_, slot)| slot).collect();
        slots.iter().enumerate().all(|(i, a)| {
            slots[i + 1..].iter().all(|b| {
                a.buffer.buffer_id() != b.buffer.buffer_id() && a.framebuffer != b.framebuffer
            })
        })
    }
}
