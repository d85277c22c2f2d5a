//! Core compositor state
//!
//! [`Compositor`] ties the scanout components together on a single thread:
//! the [`DeviceSession`] with its outputs, the [`Renderer`], the
//! [`RepaintScheduler`] and the [`FrameCallbackPacer`]. Everything happens
//! on dispatch callbacks of one event loop; nothing here is `Send`.
//!
//! The protocol layer drives it through the surface entry points
//! ([`create_surface`](Compositor::create_surface),
//! [`attach_buffer`](Compositor::attach_buffer),
//! [`damage_surface`](Compositor::damage_surface),
//! [`commit`](Compositor::commit),
//! [`request_frame`](Compositor::request_frame),
//! [`destroy_surface`](Compositor::destroy_surface)) and collects released
//! frame callbacks with [`drain_frame_done`](Compositor::drain_frame_done).
//! The event loop calls [`run_repaint`](Compositor::run_repaint) from the
//! idle trigger and [`dispatch_kernel_events`](Compositor::dispatch_kernel_events)
//! when the DRM fd is readable.

use std::time::Duration;

use log::{debug, info, trace, warn};
use rustix::time::{clock_gettime, ClockId};

use crate::device::{DeviceSession, HotplugChanges, ResumeReport};
use crate::error::{CompositorError, CompositorResult};
use crate::output::{OutputId, OutputMask};
use crate::pacing::FrameCallbackPacer;
use crate::renderer::damage::Rect;
use crate::renderer::{render_output, RenderOptions, Renderer};
use crate::scanout::controller::log_submit_error;
use crate::scanout::{FlipEvent, KmsBackend, SubmitOutcome};
use crate::scheduler::{IdleTrigger, RepaintScheduler};
use crate::surface::{BufferHandle, FrameCallback, FrameDone, Surface, SurfaceId};

/// Current time on `CLOCK_MONOTONIC`, the clock DRM flip events use
pub fn monotonic_now() -> Duration {
    let ts = clock_gettime(ClockId::Monotonic);
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// The single-threaded scanout core
pub struct Compositor<B: KmsBackend, R: Renderer, I: IdleTrigger> {
    device: DeviceSession<B>,
    renderer: R,
    trigger: I,
    scheduler: RepaintScheduler,
    pacer: FrameCallbackPacer,
    /// Stacking order, bottom first
    surfaces: Vec<Surface>,
    next_surface: u32,
    frame_done: Vec<FrameDone>,
    options: RenderOptions,
}

impl<B: KmsBackend, R: Renderer, I: IdleTrigger> Compositor<B, R, I> {
    /// Creates the core around an opened device
    pub fn new(device: DeviceSession<B>, renderer: R, trigger: I, options: RenderOptions) -> Self {
        Self {
            device,
            renderer,
            trigger,
            scheduler: RepaintScheduler::new(),
            pacer: FrameCallbackPacer::new(),
            surfaces: Vec::new(),
            next_surface: 0,
            frame_done: Vec::new(),
            options,
        }
    }

    /// Detects outputs and schedules their first (bootstrap) frame
    pub fn init(&mut self) -> CompositorResult<Vec<OutputId>> {
        let outputs = self.device.init()?;
        for &id in &outputs {
            self.schedule_repaint(id)?;
        }
        Ok(outputs)
    }

    pub fn device(&self) -> &DeviceSession<B> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut DeviceSession<B> {
        &mut self.device
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    pub fn trigger_mut(&mut self) -> &mut I {
        &mut self.trigger
    }

    pub fn scheduler(&self) -> &RepaintScheduler {
        &self.scheduler
    }

    pub fn pacer(&self) -> &FrameCallbackPacer {
        &self.pacer
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Surfaces in stacking order, bottom first
    pub fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.iter().find(|s| s.id() == id)
    }

    fn surface_index(&self, id: SurfaceId) -> CompositorResult<usize> {
        self.surfaces
            .iter()
            .position(|s| s.id() == id)
            .ok_or(CompositorError::UnknownSurface(id))
    }

    /// Takes the frame callbacks released since the last call
    pub fn drain_frame_done(&mut self) -> Vec<FrameDone> {
        std::mem::take(&mut self.frame_done)
    }

    /// Requests a frame for `output`; repeated calls coalesce
    pub fn schedule_repaint(&mut self, output: OutputId) -> CompositorResult<()> {
        let device = self
            .device
            .output_mut(output)
            .ok_or(CompositorError::UnknownOutput(output))?;
        self.scheduler
            .schedule_repaint(device.output_mut(), &mut self.trigger);
        Ok(())
    }

    fn schedule_mask(&mut self, outputs: OutputMask) {
        for id in outputs.iter() {
            if let Some(device) = self.device.output_mut(id) {
                self.scheduler
                    .schedule_repaint(device.output_mut(), &mut self.trigger);
            }
        }
    }

    /// Damages a global-space rectangle on `outputs` and schedules them
    fn damage_outputs(&mut self, outputs: OutputMask, rect: Rect) {
        for id in outputs.iter() {
            if let Some(device) = self.device.output_mut(id) {
                device.output_mut().add_global_damage(rect);
            }
        }
        self.schedule_mask(outputs);
    }

    /// Outputs whose geometry intersects `rect`
    fn outputs_intersecting(&self, rect: &Rect) -> OutputMask {
        self.device
            .outputs()
            .filter(|d| d.output().geometry().intersects(rect))
            .map(|d| d.id())
            .collect()
    }

    /// Idle-trigger handler: renders and submits one frame for `output`
    ///
    /// Failures leave `needs_repaint` set without re-arming; the next commit
    /// or flip completion arms again.
    pub fn run_repaint(&mut self, output: OutputId) {
        self.scheduler.disarm(output);

        if self.device.is_suspended() {
            trace!("{}: repaint skipped, session suspended", output);
            return;
        }
        let Some(device) = self.device.output(output) else {
            return;
        };
        if !device.output().needs_repaint {
            return;
        }
        if device.flip_pending() {
            trace!("{}: flip in flight, repaint deferred to completion", output);
            return;
        }

        if let Err(err) = render_output(
            &mut self.renderer,
            device.output(),
            &self.surfaces,
            &self.options,
        ) {
            warn!("{}: render pass failed: {}", output, err);
            return;
        }

        let now = monotonic_now();
        match self.device.submit_frame(output, now) {
            Ok(outcome) => self.frame_submitted(output, outcome, now),
            Err(CompositorError::Kms(err)) => log_submit_error(output, &err),
            Err(err) => warn!("{}: frame not submitted: {}", output, err),
        }
    }

    fn frame_submitted(&mut self, id: OutputId, outcome: SubmitOutcome, now: Duration) {
        if let Some(device) = self.device.output_mut(id) {
            let output = device.output_mut();
            output.needs_repaint = false;
            output.damage.clear();
        }

        if outcome.is_synchronous() {
            // No completion event follows a synchronous mode-set.
            let done = self.pacer.on_flip_complete(self.surfaces.iter_mut(), id, now);
            self.frame_done.extend(done);
        }
    }

    /// Reads kernel events and handles every flip completion
    pub fn dispatch_kernel_events(&mut self) -> CompositorResult<usize> {
        let events = self.device.dispatch_events()?;
        for event in &events {
            self.handle_flip(event);
        }
        Ok(events.len())
    }

    /// Paces frame callbacks after a flip the device already applied
    pub fn handle_flip(&mut self, event: &FlipEvent) {
        let done = self
            .pacer
            .on_flip_complete(self.surfaces.iter_mut(), event.output, event.timestamp);
        self.frame_done.extend(done);

        let dirty = self.device.output(event.output).is_some_and(|d| {
            d.output().needs_repaint || !d.output().damage.is_empty()
        });
        if dirty {
            let _ = self.schedule_repaint(event.output);
        }
    }

    /// VT released: drain, disable every CRTC, drop master
    pub fn suspend(&mut self) -> CompositorResult<()> {
        let completed = self.device.suspend_all()?;
        for event in &completed {
            let done = self
                .pacer
                .on_flip_complete(self.surfaces.iter_mut(), event.output, event.timestamp);
            self.frame_done.extend(done);
        }
        Ok(())
    }

    /// VT acquired: re-enable scanout, then release every waiting callback
    pub fn resume(&mut self) -> CompositorResult<ResumeReport> {
        let was_suspended = self.device.is_suspended();
        let report = self.device.resume_all()?;
        if !was_suspended {
            return Ok(report);
        }

        // CRTCs are live again before any client hears about a frame.
        let done = self
            .pacer
            .on_all_flips_flushed(self.surfaces.iter_mut(), monotonic_now());
        self.frame_done.extend(done);

        for id in self.device.output_ids() {
            self.schedule_repaint(id)?;
        }
        Ok(report)
    }

    /// Re-reads connectors after a udev change event
    pub fn handle_hotplug(&mut self) -> CompositorResult<HotplugChanges> {
        let changes = match self.device.rescan() {
            Ok(changes) => changes,
            Err(err) => {
                self.schedule_dirty_outputs();
                return Err(err);
            }
        };

        for event in &changes.completed {
            let done = self
                .pacer
                .on_flip_complete(self.surfaces.iter_mut(), event.output, event.timestamp);
            self.frame_done.extend(done);
        }
        for &id in &changes.removed {
            self.scheduler.disarm(id);
            for surface in self.surfaces.iter_mut() {
                surface.visible_on.remove(id);
                surface.presented_on.remove(id);
            }
        }

        if !changes.is_empty() {
            self.update_visibility();
            info!(
                "Hotplug: {} output(s) added, {} removed",
                changes.added.len(),
                changes.removed.len()
            );
        }
        self.schedule_dirty_outputs();
        Ok(changes)
    }

    /// The graphics device went away: every output is destroyed
    pub fn handle_device_removed(&mut self) -> Vec<OutputId> {
        let removed = self.device.output_ids();
        let completed = self.device.remove_all();
        for event in &completed {
            let done = self
                .pacer
                .on_flip_complete(self.surfaces.iter_mut(), event.output, event.timestamp);
            self.frame_done.extend(done);
        }

        for &id in &removed {
            self.scheduler.disarm(id);
        }
        for surface in self.surfaces.iter_mut() {
            surface.visible_on.clear();
            surface.presented_on.clear();
        }
        warn!("graphics device removed, {} output(s) destroyed", removed.len());
        removed
    }

    /// Bounding box of every output in the global space
    pub fn global_bounds(&self) -> Option<Rect> {
        self.device
            .outputs()
            .map(|d| d.output().geometry())
            .reduce(|acc, rect| acc.bounding(&rect))
    }

    fn schedule_dirty_outputs(&mut self) {
        let dirty: OutputMask = self
            .device
            .outputs()
            .filter(|d| d.output().needs_repaint)
            .map(|d| d.id())
            .collect();
        self.schedule_mask(dirty);
    }

    /// Recomputes every mapped surface's visible-on mask
    fn update_visibility(&mut self) {
        let outputs: Vec<(OutputId, Rect)> = self
            .device
            .outputs()
            .map(|d| (d.id(), d.output().geometry()))
            .collect();

        for surface in self.surfaces.iter_mut().filter(|s| s.buffer().is_some()) {
            let geometry = surface.geometry();
            surface.visible_on = outputs
                .iter()
                .filter(|(_, g)| g.intersects(&geometry))
                .map(|(id, _)| *id)
                .collect();
        }
    }

    /// Suspends and releases every scanout resource
    pub fn shutdown(&mut self) {
        for device in self.device.outputs() {
            let stats = device.stats();
            info!(
                "📊 {}: {} flips, {:.1}% missed, avg latency {:?}",
                device.id(),
                stats.flips,
                stats.miss_rate(),
                stats.avg_latency
            );
        }

        if let Err(err) = self.suspend() {
            warn!("suspend at shutdown failed: {}", err);
        }
        self.device.remove_all();
        for surface in self.surfaces.iter_mut() {
            self.pacer.forget_surface(surface);
        }
    }

    /// Gives up the device after [`shutdown`](Self::shutdown)
    pub fn into_device(self) -> DeviceSession<B> {
        self.device
    }

    /// Creates a surface at `(x, y)` in the global space
    pub fn create_surface(&mut self, x: i32, y: i32, width: u32, height: u32) -> SurfaceId {
        self.next_surface += 1;
        let id = SurfaceId::new(self.next_surface);
        self.surfaces.push(Surface::new(id, x, y, width, height));
        debug!("{} created at {},{} ({}x{})", id, x, y, width, height);
        id
    }

    /// Attaches and imports a client buffer
    pub fn attach_buffer(&mut self, id: SurfaceId, buffer: BufferHandle) -> CompositorResult<()> {
        let index = self.surface_index(id)?;
        self.renderer.import_buffer(id, buffer)?;
        self.surfaces[index].attach(buffer);
        Ok(())
    }

    /// Unions surface-local damage into the surface's pending region
    pub fn damage_surface(&mut self, id: SurfaceId, rect: Rect) -> CompositorResult<()> {
        let index = self.surface_index(id)?;
        self.surfaces[index].add_damage(rect);
        Ok(())
    }

    /// Moves or resizes a surface, damaging the area it leaves
    pub fn set_surface_geometry(
        &mut self,
        id: SurfaceId,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> CompositorResult<()> {
        let index = self.surface_index(id)?;
        let visible = self.surfaces[index].visible_on;
        if let Some(old) = self.surfaces[index].set_geometry(x, y, width, height) {
            self.damage_outputs(visible, old);
        }
        Ok(())
    }

    /// Latches the surface's pending state
    ///
    /// The committed damage lands on every output the surface intersects,
    /// offset by its position, and those outputs are scheduled. A surface
    /// waiting for a frame callback schedules every output it is visible on
    /// so the callback can fire. One that is visible nowhere keeps its
    /// callbacks until a later commit places it on an output.
    pub fn commit(&mut self, id: SurfaceId) -> CompositorResult<()> {
        let index = self.surface_index(id)?;
        let damage = self.surfaces[index].commit()?;

        let geometry = self.surfaces[index].geometry();
        let visible = self.outputs_intersecting(&geometry);
        let surface = &mut self.surfaces[index];
        if surface.visible_on != visible {
            trace!(
                "{} visible on {:#x} (was {:#x})",
                id,
                visible.bits(),
                surface.visible_on.bits()
            );
            surface.visible_on = visible;
        }
        let wants_frame = surface.needs_frame_done();

        if let Some(local) = damage {
            let global = local.to_screen_coords(geometry.x, geometry.y);
            self.damage_outputs(visible, global);
        }
        if wants_frame {
            self.schedule_mask(visible);
        }
        Ok(())
    }

    /// Registers a frame callback on a surface
    pub fn request_frame(&mut self, id: SurfaceId, callback: FrameCallback) -> CompositorResult<()> {
        let index = self.surface_index(id)?;
        self.pacer
            .on_surface_frame_request(&mut self.surfaces[index], callback)
    }

    /// Tears a surface down
    ///
    /// The protocol layer unmaps the surface first. Its last region is
    /// damaged on every output it was visible on and its outstanding
    /// callbacks are dropped.
    pub fn destroy_surface(&mut self, id: SurfaceId) -> CompositorResult<()> {
        let index = self.surface_index(id)?;
        let mut surface = self.surfaces.remove(index);

        self.pacer.forget_surface(&mut surface);
        self.renderer.destroy_surface_texture(id);
        self.damage_outputs(surface.visible_on, surface.geometry());
        debug!("{} destroyed", id);
        Ok(())
    }
}
