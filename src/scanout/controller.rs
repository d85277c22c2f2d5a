//! Output device controller
//!
//! [`OutputDevice`] wraps one connector/CRTC pair together with its
//! [`ScanoutSlotChain`] and drives the per-output scanout state machine:
//!
//! ```text
//! Uninitialized ──► Bootstrapping ──► Steady ◄──► Suspended
//!                  (sync mode-set)   (async flips)
//! ```
//!
//! A frame submission locks the buffer the renderer just finished, registers
//! it as a kernel framebuffer and then either mode-sets synchronously (first
//! frame, or after a geometry change) or queues an asynchronous page flip.
//! Every failure path hands the freshly acquired buffer object straight back
//! to the allocator and leaves `needs_repaint` set, so the next scheduler
//! pass simply retries.

use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::error::{ErrorClass, KmsError};
use crate::output::{Output, OutputId, OutputState};
use crate::pacing::FlipStats;
use crate::scanout::slots::{ScanoutSlotChain, Slot};
use crate::scanout::{FlipEvent, FramebufferId, KmsBackend, ScanoutBuffer};

/// How a successful submission reached the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// An asynchronous flip is queued; a [`FlipEvent`] will follow
    Flipped,
    /// A synchronous mode-set shows the frame already
    Modeset,
    /// Like [`SubmitOutcome::Modeset`], and the output just left
    /// `Bootstrapping`
    Bootstrapped,
}

impl SubmitOutcome {
    /// Whether the frame is on screen without a completion event
    pub fn is_synchronous(self) -> bool {
        !matches!(self, SubmitOutcome::Flipped)
    }
}

/// One output plus the scanout resources it exclusively owns
#[derive(Debug)]
pub struct OutputDevice<T> {
    output: Output,
    slots: ScanoutSlotChain<T>,
    state: OutputState,
    needs_modeset: bool,
    submitted_at: Duration,
    stats: FlipStats,
}

impl<T: ScanoutBuffer> OutputDevice<T> {
    /// Wraps a freshly created output; its first frame will mode-set
    pub fn new(output: Output) -> Self {
        Self {
            output,
            slots: ScanoutSlotChain::new(),
            state: OutputState::Uninitialized,
            needs_modeset: true,
            submitted_at: Duration::ZERO,
            stats: FlipStats::default(),
        }
    }

    pub fn id(&self) -> OutputId {
        self.output.id()
    }

    pub fn output(&self) -> &Output {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut Output {
        &mut self.output
    }

    pub fn state(&self) -> OutputState {
        self.state
    }

    pub fn slots(&self) -> &ScanoutSlotChain<T> {
        &self.slots
    }

    pub fn stats(&self) -> &FlipStats {
        &self.stats
    }

    /// Whether an asynchronous flip is outstanding
    pub fn flip_pending(&self) -> bool {
        self.output.repaint_in_flight
    }

    pub fn needs_modeset(&self) -> bool {
        self.needs_modeset
    }

    /// Forces the next submission through a synchronous mode-set
    pub fn request_modeset(&mut self) {
        self.needs_modeset = true;
    }

    /// Puts the frame the renderer just finished on screen
    ///
    /// The caller must not submit while [`flip_pending`](Self::flip_pending)
    /// is set; doing so is refused with [`KmsError::Busy`] without touching
    /// any state.
    pub fn submit_frame<B>(&mut self, backend: &mut B, now: Duration) -> Result<SubmitOutcome, KmsError>
    where
        B: KmsBackend<Buffer = T>,
    {
        if self.state == OutputState::Suspended {
            return Err(KmsError::Busy);
        }
        if self.output.repaint_in_flight || self.slots.has_pending() {
            warn!("{}: frame submitted while a flip is outstanding", self.id());
            return Err(KmsError::Busy);
        }

        let native = self.output.native_surface();
        let buffer = match backend.lock_front_buffer(native) {
            Ok(buffer) => buffer,
            Err(err) => {
                self.output.needs_repaint = true;
                return Err(err);
            }
        };

        let path = buffer.layout().registration_path();
        let framebuffer = match backend.add_framebuffer(&buffer, path) {
            Ok(fb) => fb,
            Err(err) => {
                error!("{}: framebuffer registration failed: {}", self.id(), err);
                backend.release_buffer(native, buffer);
                self.output.needs_repaint = true;
                return Err(err);
            }
        };
        trace!("{}: registered framebuffer {:?} ({:?})", self.id(), framebuffer, path);

        if self.needs_modeset {
            return self.modeset(backend, framebuffer, buffer);
        }

        if let Err(err) = backend.page_flip(self.output.crtc(), framebuffer, self.id()) {
            self.discard(backend, Slot::new(framebuffer, buffer));
            self.output.needs_repaint = true;
            return Err(err);
        }

        if let Err(slot) = self.slots.set_pending(Slot::new(framebuffer, buffer)) {
            // Unreachable: the pending slot was checked empty above.
            self.discard(backend, slot);
            return Err(KmsError::Busy);
        }
        self.output.repaint_in_flight = true;
        self.submitted_at = now;
        debug_assert!(self.slots.is_consistent());
        Ok(SubmitOutcome::Flipped)
    }

    fn modeset<B>(
        &mut self,
        backend: &mut B,
        framebuffer: FramebufferId,
        buffer: T,
    ) -> Result<SubmitOutcome, KmsError>
    where
        B: KmsBackend<Buffer = T>,
    {
        if self.state == OutputState::Uninitialized {
            self.state = OutputState::Bootstrapping;
            debug!("{}: bootstrapping", self.id());
        }

        let mode = *self.output.mode();
        if let Err(err) = backend.set_crtc(
            self.output.crtc(),
            framebuffer,
            self.output.connector(),
            &mode,
        ) {
            error!("{}: mode-set failed: {}", self.id(), err);
            self.discard(backend, Slot::new(framebuffer, buffer));
            self.output.needs_repaint = true;
            return Err(err);
        }

        if let Err(slot) = self.slots.set_pending(Slot::new(framebuffer, buffer)) {
            self.discard(backend, slot);
            return Err(KmsError::Busy);
        }
        if let Some(released) = self.slots.promote() {
            self.discard(backend, released);
        }
        self.needs_modeset = false;

        let outcome = if self.state == OutputState::Bootstrapping {
            info!(
                "🖥️ {} ({}) is live at {}x{}@{}mHz",
                self.id(),
                self.output.name(),
                mode.width,
                mode.height,
                mode.refresh_mhz()
            );
            SubmitOutcome::Bootstrapped
        } else {
            debug!("{}: mode-set to {}x{}", self.id(), mode.width, mode.height);
            SubmitOutcome::Modeset
        };
        self.state = OutputState::Steady;
        Ok(outcome)
    }

    /// Rotates the slot chain after the kernel flipped to the pending buffer
    ///
    /// Returns false for a completion this output was not waiting for.
    pub fn on_flip_complete<B>(&mut self, backend: &mut B, event: &FlipEvent) -> bool
    where
        B: KmsBackend<Buffer = T>,
    {
        if !self.output.repaint_in_flight {
            warn!("{}: unexpected flip completion (frame {})", self.id(), event.frame);
            return false;
        }

        if let Some(released) = self.slots.promote() {
            self.discard(backend, released);
        }
        self.output.repaint_in_flight = false;
        self.stats.record(
            self.submitted_at,
            event.timestamp,
            self.output.mode().refresh_interval(),
        );
        trace!(
            "{}: flip complete, frame {} at {:?}",
            self.id(),
            event.frame,
            event.timestamp
        );
        debug_assert!(self.slots.is_consistent());
        true
    }

    /// Disables the CRTC once outstanding flips have been drained
    ///
    /// A flip that never completed is considered done once the CRTC is off,
    /// since the kernel no longer scans anything out. The *current* slot is
    /// kept so [`resume`](Self::resume) can show it again.
    ///
    /// If the CRTC cannot be disabled while a flip is outstanding, the chain
    /// is left as it is: the kernel may still scan out either the *current*
    /// or the *pending* buffer. The output stays flagged and the chain
    /// rotates when the completion finally arrives.
    pub fn suspend<B>(&mut self, backend: &mut B) -> Result<(), KmsError>
    where
        B: KmsBackend<Buffer = T>,
    {
        if self.state == OutputState::Suspended {
            return Ok(());
        }

        self.output.needs_repaint = false;
        self.state = OutputState::Suspended;
        let result = backend.disable_crtc(self.output.crtc());

        if self.output.repaint_in_flight {
            if let Err(err) = &result {
                error!(
                    "{}: CRTC still live with a flip outstanding ({}), keeping its buffers",
                    self.id(),
                    err
                );
                return result;
            }
            warn!("{}: flip still outstanding at suspend, forcing completion", self.id());
            if let Some(released) = self.slots.promote() {
                self.discard(backend, released);
            }
            self.output.repaint_in_flight = false;
        }
        for slot in self.slots.take_idle() {
            self.discard(backend, slot);
        }

        debug!("{}: suspended", self.id());
        result
    }

    /// Re-enables the CRTC with the buffer still held in the *current* slot
    ///
    /// The whole output is damaged and marked for repaint. Without a current
    /// buffer, or if the mode-set fails, the next frame goes through a full
    /// mode-set instead.
    pub fn resume<B>(&mut self, backend: &mut B) -> Result<(), KmsError>
    where
        B: KmsBackend<Buffer = T>,
    {
        if self.state != OutputState::Suspended {
            return Ok(());
        }

        let mut result = Ok(());
        match self.slots.current().map(|slot| slot.framebuffer) {
            Some(framebuffer) => {
                let mode = *self.output.mode();
                result = backend.set_crtc(
                    self.output.crtc(),
                    framebuffer,
                    self.output.connector(),
                    &mode,
                );
                if result.is_err() {
                    self.needs_modeset = true;
                }
                self.state = OutputState::Steady;
            }
            None => {
                self.needs_modeset = true;
                self.state = OutputState::Uninitialized;
            }
        }

        self.output.damage_all();
        self.output.needs_repaint = true;
        debug!("{}: resumed ({:?})", self.id(), self.state);
        result
    }

    /// Releases every scanout resource before the output is destroyed
    ///
    /// When the CRTC stays live with a flip outstanding nothing is released
    /// and the device is handed back; the caller retries after the
    /// completion arrives.
    pub fn teardown<B>(mut self, backend: &mut B) -> Result<(), Self>
    where
        B: KmsBackend<Buffer = T>,
    {
        if let Err(err) = backend.disable_crtc(self.output.crtc()) {
            if self.output.repaint_in_flight {
                error!(
                    "{}: CRTC still live with a flip outstanding ({}), deferring teardown",
                    self.id(),
                    err
                );
                return Err(self);
            }
            debug!("{}: disabling CRTC on teardown: {}", self.id(), err);
        }
        for slot in self.slots.take_all() {
            self.discard(backend, slot);
        }
        backend.destroy_native_surface(self.output.native_surface());
        info!("🔌 {} ({}) removed", self.id(), self.output.name());
        Ok(())
    }

    fn discard<B>(&self, backend: &mut B, slot: Slot<T>)
    where
        B: KmsBackend<Buffer = T>,
    {
        backend.remove_framebuffer(slot.framebuffer);
        backend.release_buffer(self.output.native_surface(), slot.buffer);
    }
}

/// Logs a failed submission according to its class
pub fn log_submit_error(output: OutputId, err: &KmsError) {
    match err.class() {
        ErrorClass::Transient => warn!("{}: frame skipped: {}", output, err),
        ErrorClass::ResourceExhaustion => error!("{}: frame dropped: {}", output, err),
        ErrorClass::Configuration | ErrorClass::Protocol => {
            error!("{}: submission failed: {}", output, err)
        }
    }
}
