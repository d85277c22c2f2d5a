//! Device session controller
//!
//! [`DeviceSession`] owns the KMS backend (and through it the privileged
//! device file descriptor) plus every [`OutputDevice`] created on it. It is
//! the only place that arbitrates VT switches:
//!
//! - [`suspend_all`](DeviceSession::suspend_all) stops new submissions,
//!   blocks until in-flight flips complete (bounded by a timeout), disables
//!   every CRTC and drops DRM master.
//! - [`resume_all`](DeviceSession::resume_all) takes master back and
//!   re-enables every CRTC with the buffer still held in its *current* slot.
//!
//! Both are idempotent. Connector hotplug is handled by
//! [`rescan`](DeviceSession::rescan), which diffs the backend's connector
//! list against the known outputs. An unplugged output whose CRTC cannot be
//! switched off while a flip is outstanding is retired rather than
//! destroyed: it keeps its buffers and its id until that flip completes.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::error::{CompositorError, CompositorResult, KmsError};
use crate::output::{Output, OutputId, OutputIdAllocator};
use crate::scanout::{
    ConnectorInfo, CrtcId, FlipEvent, KmsBackend, OutputDevice, SubmitOutcome,
};

/// Outputs created and destroyed by a rescan
#[derive(Debug, Default)]
pub struct HotplugChanges {
    pub added: Vec<OutputId>,
    pub removed: Vec<OutputId>,
    /// Flips that completed while removed outputs were drained
    pub completed: Vec<FlipEvent>,
}

impl HotplugChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// What the caller has to redo after a resume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeReport {
    /// The kernel event source was removed at suspend and must be
    /// registered with the event loop again
    pub reregister_event_source: bool,
}

/// Owner of the graphics device and all of its outputs
pub struct DeviceSession<B: KmsBackend> {
    backend: B,
    outputs: BTreeMap<OutputId, OutputDevice<B::Buffer>>,
    retired: BTreeMap<OutputId, OutputDevice<B::Buffer>>,
    ids: OutputIdAllocator,
    suspended: bool,
    event_source_active: bool,
    drain_timeout: Duration,
}

impl<B: KmsBackend> DeviceSession<B> {
    /// Wraps an opened backend
    ///
    /// At most `max_outputs` outputs are created; `drain_timeout` bounds the
    /// blocking wait for outstanding flips at suspend.
    pub fn new(backend: B, max_outputs: usize, drain_timeout: Duration) -> Self {
        Self {
            backend,
            outputs: BTreeMap::new(),
            retired: BTreeMap::new(),
            ids: OutputIdAllocator::new(max_outputs),
            suspended: false,
            event_source_active: true,
            drain_timeout,
        }
    }

    /// Creates an output for every connected connector
    ///
    /// Finding no usable display at all is fatal.
    pub fn init(&mut self) -> CompositorResult<Vec<OutputId>> {
        let changes = self.rescan()?;
        if self.outputs.is_empty() {
            return Err(KmsError::NoConnector.into());
        }

        info!("🖥️ Device initialized with {} output(s)", self.outputs.len());
        Ok(changes.added)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Gives the backend back once every output is gone
    pub fn into_backend(self) -> B {
        if !self.outputs.is_empty() || !self.retired.is_empty() {
            warn!(
                "releasing the device with {} live and {} retired output(s)",
                self.outputs.len(),
                self.retired.len()
            );
        }
        self.backend
    }

    /// Whether `id` was unplugged but still waits for a flip to complete
    pub fn is_retired(&self, id: OutputId) -> bool {
        self.retired.contains_key(&id)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Whether the kernel event source should currently be polled
    pub fn event_source_active(&self) -> bool {
        self.event_source_active
    }

    pub fn output(&self, id: OutputId) -> Option<&OutputDevice<B::Buffer>> {
        self.outputs.get(&id)
    }

    pub fn output_mut(&mut self, id: OutputId) -> Option<&mut OutputDevice<B::Buffer>> {
        self.outputs.get_mut(&id)
    }

    /// Outputs in id order
    pub fn outputs(&self) -> impl Iterator<Item = &OutputDevice<B::Buffer>> {
        self.outputs.values()
    }

    pub fn outputs_mut(&mut self) -> impl Iterator<Item = &mut OutputDevice<B::Buffer>> {
        self.outputs.values_mut()
    }

    pub fn output_ids(&self) -> Vec<OutputId> {
        self.outputs.keys().copied().collect()
    }

    /// Hands the finished frame of `id` to its output controller
    pub fn submit_frame(&mut self, id: OutputId, now: Duration) -> CompositorResult<SubmitOutcome> {
        if self.suspended {
            return Err(CompositorError::Suspended);
        }
        let device = self
            .outputs
            .get_mut(&id)
            .ok_or(CompositorError::UnknownOutput(id))?;
        Ok(device.submit_frame(&mut self.backend, now)?)
    }

    /// Applies a flip completion to its output
    ///
    /// Returns false when nobody was waiting for it. A completion for a
    /// retired output finishes its teardown and is not reported either.
    pub fn complete_flip(&mut self, event: &FlipEvent) -> bool {
        if let Some(device) = self.outputs.get_mut(&event.output) {
            return device.on_flip_complete(&mut self.backend, event);
        }

        match self.retired.remove(&event.output) {
            Some(mut device) => {
                device.on_flip_complete(&mut self.backend, event);
                self.retire(event.output, device);
            }
            None => debug!("flip completion for vanished {}", event.output),
        }
        false
    }

    /// Reads and applies every pending kernel event without blocking
    ///
    /// Returns the completions that were applied.
    pub fn dispatch_events(&mut self) -> CompositorResult<Vec<FlipEvent>> {
        let events = self.backend.read_events()?;
        Ok(events
            .into_iter()
            .filter(|event| self.complete_flip(event))
            .collect())
    }

    /// Blocks until no output matching `filter` has a flip in flight
    fn drain_flips<F>(&mut self, filter: F) -> Vec<FlipEvent>
    where
        F: Fn(&OutputDevice<B::Buffer>) -> bool,
    {
        let deadline = Instant::now() + self.drain_timeout;
        let mut completed = Vec::new();

        while self
            .outputs
            .values()
            .any(|device| filter(device) && device.flip_pending())
        {
            let now = Instant::now();
            if now >= deadline {
                warn!("timed out draining page flips after {:?}", self.drain_timeout);
                break;
            }

            match self.backend.wait_events(deadline - now) {
                Ok(events) if events.is_empty() => {
                    warn!("no flip completion within {:?}", self.drain_timeout);
                    break;
                }
                Ok(events) => {
                    for event in events {
                        if self.complete_flip(&event) {
                            completed.push(event);
                        }
                    }
                }
                Err(err) => {
                    warn!("waiting for flip completions failed: {}", err);
                    break;
                }
            }
        }

        completed
    }

    /// Stops scanout on every output (VT released)
    ///
    /// Returns the flip completions observed while draining; the caller still
    /// owes them to the frame-callback pacer.
    pub fn suspend_all(&mut self) -> CompositorResult<Vec<FlipEvent>> {
        if self.suspended {
            debug!("suspend requested while already suspended");
            return Ok(Vec::new());
        }

        info!("⏸️ Suspending {} output(s)", self.outputs.len());
        for device in self.outputs.values_mut() {
            device.output_mut().needs_repaint = false;
        }

        let completed = self.drain_flips(|_| true);

        for device in self.outputs.values_mut() {
            if let Err(err) = device.suspend(&mut self.backend) {
                warn!("{}: disabling CRTC failed: {}", device.id(), err);
            }
        }
        if let Err(err) = self.backend.drop_master() {
            warn!("dropping DRM master failed: {}", err);
        }

        self.suspended = true;
        self.event_source_active = false;
        Ok(completed)
    }

    /// Restarts scanout on every output (VT acquired)
    pub fn resume_all(&mut self) -> CompositorResult<ResumeReport> {
        if !self.suspended {
            debug!("resume requested while not suspended");
            return Ok(ResumeReport {
                reregister_event_source: false,
            });
        }

        self.backend.acquire_master()?;

        for device in self.outputs.values_mut() {
            if let Err(err) = device.resume(&mut self.backend) {
                warn!(
                    "{}: re-enabling CRTC failed ({}), next frame will mode-set",
                    device.id(),
                    err
                );
            }
        }

        self.suspended = false;
        let reregister = !self.event_source_active;
        self.event_source_active = true;
        info!("▶️ Resumed {} output(s)", self.outputs.len());
        Ok(ResumeReport {
            reregister_event_source: reregister,
        })
    }

    /// Synchronizes outputs with the connectors the backend reports
    pub fn rescan(&mut self) -> CompositorResult<HotplugChanges> {
        let connectors = self.backend.connectors()?;
        let mut changes = HotplugChanges::default();

        let gone: Vec<OutputId> = self
            .outputs
            .values()
            .filter(|device| {
                !connectors
                    .iter()
                    .any(|c| c.id == device.output().connector() && c.is_usable())
            })
            .map(|device| device.id())
            .collect();
        for id in gone {
            changes.completed.extend(self.remove_output(id));
            changes.removed.push(id);
        }

        for connector in connectors.iter().filter(|c| c.is_usable()) {
            let known = self
                .outputs
                .values()
                .any(|device| device.output().connector() == connector.id);
            if known {
                continue;
            }

            match self.add_output(connector) {
                Ok(id) => changes.added.push(id),
                Err(CompositorError::Kms(err @ KmsError::NoCrtc(_))) => {
                    warn!("{}: {}", connector.name, err);
                }
                Err(err) => return Err(err),
            }
        }

        if !changes.is_empty() {
            self.relayout();
        }
        Ok(changes)
    }

    fn add_output(&mut self, connector: &ConnectorInfo) -> CompositorResult<OutputId> {
        let used: Vec<CrtcId> = self
            .outputs
            .values()
            .chain(self.retired.values())
            .map(|d| d.output().crtc())
            .collect();
        let crtc = connector
            .possible_crtcs
            .iter()
            .copied()
            .find(|crtc| !used.contains(crtc))
            .ok_or(KmsError::NoCrtc(connector.id.0))?;
        let mode = connector
            .preferred_mode()
            .ok_or(KmsError::NoMode(connector.id.0))?;

        let id = self.ids.allocate().map_err(|err| {
            error!("{}: {}", connector.name, err);
            err
        })?;
        let native = match self.backend.create_native_surface(crtc, &mode) {
            Ok(native) => native,
            Err(err) => {
                self.ids.release(id);
                return Err(err.into());
            }
        };

        let mut output = Output::new(
            id,
            connector.name.clone(),
            connector.id,
            crtc,
            mode,
            (self.next_x(), 0),
            native,
        );
        output.damage_all();
        output.needs_repaint = true;
        self.outputs.insert(id, OutputDevice::new(output));

        info!(
            "🔌 {} ({}) connected: {}x{} on CRTC {}",
            id, connector.name, mode.width, mode.height, crtc.0
        );
        Ok(id)
    }

    /// Destroys an output after its in-flight flip, if any, completed
    fn remove_output(&mut self, id: OutputId) -> Vec<FlipEvent> {
        let completed = self.drain_flips(|device| device.id() == id);
        if let Some(device) = self.outputs.remove(&id) {
            self.retire(id, device);
        }
        completed
    }

    /// Tears an output down, or parks it until its CRTC is idle
    fn retire(&mut self, id: OutputId, device: OutputDevice<B::Buffer>) {
        match device.teardown(&mut self.backend) {
            Ok(()) => self.ids.release(id),
            Err(device) => {
                warn!("{}: retired with a flip outstanding", id);
                self.retired.insert(id, device);
            }
        }
    }

    /// Right edge of the output row
    fn next_x(&self) -> i32 {
        self.outputs
            .values()
            .map(|d| d.output().geometry().right())
            .max()
            .unwrap_or(0)
    }

    /// Packs outputs left to right in id order
    fn relayout(&mut self) {
        let mut x = 0;
        for device in self.outputs.values_mut() {
            let output = device.output_mut();
            if output.geometry().x != x {
                debug!("{} moved to x={}", output.id(), x);
                output.set_position(x, 0);
                output.damage_all();
                output.needs_repaint = true;
            }
            x += output.mode().width as i32;
        }
    }

    /// Releases every output; used at shutdown and on device removal
    pub fn remove_all(&mut self) -> Vec<FlipEvent> {
        let mut completed = Vec::new();
        for id in self.output_ids() {
            completed.extend(self.remove_output(id));
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanout::{ConnectorId, ModeInfo};

    fn connector(id: u32, connected: bool, crtcs: &[u32]) -> ConnectorInfo {
        ConnectorInfo {
            id: ConnectorId(id),
            name: format!("DP-{id}"),
            connected,
            modes: vec![ModeInfo::new(1024, 768, 60_000, true)],
            possible_crtcs: crtcs.iter().map(|&c| CrtcId(c)).collect(),
        }
    }

    #[test]
    fn test_hotplug_changes_empty() {
        let changes = HotplugChanges::default();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_connector_usability() {
        assert!(connector(1, true, &[1]).is_usable());
        assert!(!connector(1, false, &[1]).is_usable());

        let mut no_modes = connector(1, true, &[1]);
        no_modes.modes.clear();
        assert!(!no_modes.is_usable());
    }
}
