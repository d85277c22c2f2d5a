//! Frame-callback pacing and flip statistics
//!
//! Clients throttle their rendering on `wl_surface.frame` callbacks. A
//! callback may only fire once the frame it belongs to is actually on
//! screen, which for a surface spanning several outputs means *every* output
//! showing it has completed a flip since the callback was requested.
//!
//! # Rules
//!
//! - [`FrameCallbackPacer::on_flip_complete`] sets the output's bit in the
//!   presented-on mask of every surface waiting for a done event, and fires
//!   the callbacks of those whose presented-on mask now covers their
//!   visible-on mask.
//! - [`FrameCallbackPacer::on_all_flips_flushed`] fires everything. It is
//!   used at resume where no per-output event stream exists yet.
//! - A surface that is visible nowhere is not covered by any flip. It
//!   waits until a commit places it on an output again, or for a flush.
//!
//! [`FlipStats`] keeps per-output flip timing: submit-to-flip latency and
//! missed vblanks, following the frame statistics of the renderer.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::CompositorResult;
use crate::output::OutputId;
use crate::surface::{FrameCallback, FrameDone, Surface};

/// Number of flips kept for latency averaging
const FLIP_HISTORY_SIZE: usize = 120;

/// A flip landing later than this many refresh intervals after submission
/// missed at least one vblank
const MISSED_FLIP_THRESHOLD: f64 = 1.5;

/// Releases client frame callbacks once every output showing a surface
/// has flipped
#[derive(Debug, Default)]
pub struct FrameCallbackPacer {
    outstanding: usize,
}

impl FrameCallbackPacer {
    /// Creates a pacer with nothing outstanding
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a frame callback on `surface`
    pub fn on_surface_frame_request(
        &mut self,
        surface: &mut Surface,
        callback: FrameCallback,
    ) -> CompositorResult<()> {
        surface.add_frame_callback(callback)?;
        self.outstanding += 1;
        trace!("{} requested frame callback {}", surface.id(), callback.0);
        Ok(())
    }

    /// Whether at least one callback is waiting for a done event
    pub fn has_outstanding(&self) -> bool {
        self.outstanding > 0
    }

    /// Number of callbacks waiting for a done event
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Handles a completed flip on `output`
    pub fn on_flip_complete<'a, I>(
        &mut self,
        surfaces: I,
        output: OutputId,
        timestamp: Duration,
    ) -> Vec<FrameDone>
    where
        I: IntoIterator<Item = &'a mut Surface>,
    {
        let mut done = Vec::new();

        for surface in surfaces {
            if !surface.needs_frame_done() {
                continue;
            }
            if surface.visible_on.is_empty() {
                trace!("{} is visible nowhere, not released by {}", surface.id(), output);
                continue;
            }

            surface.mark_presented(output);
            if surface.presented_on.covers(surface.visible_on) {
                self.fire(surface, timestamp, &mut done);
            } else {
                trace!(
                    "{} presented on {:#x}, still waiting for {:#x}",
                    surface.id(),
                    surface.presented_on.bits(),
                    surface.visible_on.bits()
                );
            }
        }

        if !done.is_empty() {
            debug!("{}: released {} frame callbacks", output, done.len());
        }
        done
    }

    /// Fires every outstanding callback regardless of presentation state
    pub fn on_all_flips_flushed<'a, I>(&mut self, surfaces: I, timestamp: Duration) -> Vec<FrameDone>
    where
        I: IntoIterator<Item = &'a mut Surface>,
    {
        let mut done = Vec::new();
        for surface in surfaces {
            if surface.needs_frame_done() {
                self.fire(surface, timestamp, &mut done);
            }
        }

        debug!("flushed {} frame callbacks", done.len());
        done
    }

    /// Drops the callbacks of a surface that is going away without firing
    pub fn forget_surface(&mut self, surface: &mut Surface) {
        let dropped = surface.take_frame_callbacks().len();
        self.release(dropped);
    }

    fn fire(&mut self, surface: &mut Surface, timestamp: Duration, done: &mut Vec<FrameDone>) {
        let callbacks = surface.take_frame_callbacks();
        self.release(callbacks.len());

        let id = surface.id();
        done.extend(callbacks.into_iter().map(|callback| FrameDone {
            surface: id,
            callback,
            timestamp,
        }));
    }

    fn release(&mut self, count: usize) {
        if count > self.outstanding {
            warn!(
                "frame callback accounting underflow ({} > {})",
                count, self.outstanding
            );
        }
        self.outstanding = self.outstanding.saturating_sub(count);
    }
}

/// Flip timing for one output
#[derive(Debug, Clone)]
pub struct FlipStats {
    /// Completed flips
    pub flips: u64,
    /// Flips that landed more than one and a half refresh cycles after
    /// their submission
    pub missed: u64,
    /// Timestamp of the last completed flip
    pub last_flip: Option<Duration>,
    /// Time between the last two completed flips
    pub last_interval: Duration,
    /// Submit-to-flip latency of the last flip
    pub last_latency: Duration,
    /// Average submit-to-flip latency over recent flips
    pub avg_latency: Duration,
    history: VecDeque<Duration>,
}

impl Default for FlipStats {
    fn default() -> Self {
        Self {
            flips: 0,
            missed: 0,
            last_flip: None,
            last_interval: Duration::ZERO,
            last_latency: Duration::ZERO,
            avg_latency: Duration::ZERO,
            history: VecDeque::with_capacity(FLIP_HISTORY_SIZE),
        }
    }
}

impl FlipStats {
    /// Records a flip submitted at `submitted` that completed at `completed`
    pub fn record(&mut self, submitted: Duration, completed: Duration, refresh: Duration) {
        let latency = completed.saturating_sub(submitted);

        if let Some(last) = self.last_flip {
            self.last_interval = completed.saturating_sub(last);
        }
        self.last_flip = Some(completed);
        self.last_latency = latency;
        self.flips += 1;

        if latency.as_secs_f64() > refresh.as_secs_f64() * MISSED_FLIP_THRESHOLD {
            self.missed += 1;
            debug!(
                "flip missed its vblank: latency {:?} (refresh {:?})",
                latency, refresh
            );
        }

        self.history.push_back(latency);
        if self.history.len() > FLIP_HISTORY_SIZE {
            self.history.pop_front();
        }
        let total: Duration = self.history.iter().sum();
        self.avg_latency = total / self.history.len() as u32;
    }

    /// Percentage of flips that missed their vblank
    pub fn miss_rate(&self) -> f32 {
        if self.flips == 0 {
            return 0.0;
        }
        (self.missed as f32 / self.flips as f32) * 100.0
    }
}
