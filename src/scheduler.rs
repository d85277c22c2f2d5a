//! Idle-coalesced repaint scheduling
//!
//! Damage can arrive many times between two frames. The scheduler turns all
//! of it into a single render pass per output: the first
//! [`schedule_repaint`](RepaintScheduler::schedule_repaint) arms a deferred
//! trigger, every later call until that trigger runs is a no-op.
//!
//! The trigger itself is abstracted behind [`IdleTrigger`]. The binary backs
//! it with a calloop idle callback, which runs once before the event loop
//! next blocks; tests back it with a plain queue.

use std::collections::VecDeque;

use log::trace;

use crate::output::{Output, OutputId, OutputMask};

/// Deferred callback that eventually runs the repaint handler for an output
pub trait IdleTrigger {
    /// Arranges for the repaint handler of `output` to run once
    fn arm(&mut self, output: OutputId);
}

/// Queue-backed trigger, drained by whoever owns the loop
impl IdleTrigger for VecDeque<OutputId> {
    fn arm(&mut self, output: OutputId) {
        self.push_back(output);
    }
}

/// Tracks which outputs have a repaint armed
#[derive(Debug, Default)]
pub struct RepaintScheduler {
    armed: OutputMask,
    scheduled: u64,
}

impl RepaintScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `output` dirty and arms its trigger unless one is armed already
    ///
    /// Returns true when a trigger was armed by this call.
    pub fn schedule_repaint(&mut self, output: &mut Output, trigger: &mut dyn IdleTrigger) -> bool {
        output.needs_repaint = true;

        let id = output.id();
        if self.armed.contains(id) {
            trace!("{}: repaint already armed", id);
            return false;
        }

        self.armed.insert(id);
        self.scheduled += 1;
        trigger.arm(id);
        trace!("{}: repaint armed", id);
        true
    }

    /// Clears the armed flag; called first thing by the repaint handler
    ///
    /// Returns whether the output was armed.
    pub fn disarm(&mut self, output: OutputId) -> bool {
        let was_armed = self.armed.contains(output);
        self.armed.remove(output);
        was_armed
    }

    /// Whether a repaint is armed for `output`
    pub fn is_armed(&self, output: OutputId) -> bool {
        self.armed.contains(output)
    }

    /// Outputs with an armed repaint
    pub fn armed(&self) -> OutputMask {
        self.armed
    }

    /// Number of triggers armed since creation
    pub fn scheduled(&self) -> u64 {
        self.scheduled
    }
}
