//! Shared fixtures for the integration tests
//!
//! [`FakeKms`] stands in for the kernel: it hands out numbered buffers,
//! remembers every framebuffer, mode-set and flip, and only completes a flip
//! when the test says so. It refuses to remove a framebuffer that a CRTC is
//! scanning out or that a queued flip still references. [`RecordingRenderer`] records every frame it is
//! asked to draw.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use kms_compositor::error::{KmsError, RenderError};
use kms_compositor::output::{Output, OutputId};
use kms_compositor::renderer::damage::Rect;
use kms_compositor::renderer::{Color, RenderOptions, Renderer};
use kms_compositor::scanout::{
    BufferId, ConnectorId, ConnectorInfo, CrtcId, FlipEvent, FramebufferId, FramebufferLayout,
    KmsBackend, ModeInfo, NativeSurface, RegistrationPath, ScanoutBuffer, DRM_FORMAT_XRGB8888,
};
use kms_compositor::surface::{BufferHandle, Surface, SurfaceId};
use kms_compositor::{Compositor, DeviceSession};

#[derive(Debug, PartialEq, Eq)]
pub struct FakeBuffer {
    pub id: u64,
    pub surface: NativeSurface,
}

impl ScanoutBuffer for FakeBuffer {
    fn buffer_id(&self) -> BufferId {
        BufferId(self.id)
    }

    fn layout(&self) -> FramebufferLayout {
        FramebufferLayout {
            width: 1000,
            height: 1000,
            fourcc: DRM_FORMAT_XRGB8888,
            planes: Vec::new(),
            modifier: None,
        }
    }
}

/// Scriptable stand-in for a DRM device
#[derive(Debug, Default)]
pub struct FakeKms {
    pub connectors: Vec<ConnectorInfo>,

    next_buffer: u64,
    next_framebuffer: u32,
    next_surface: u32,

    /// Buffers currently held by the core
    pub locked: BTreeSet<u64>,
    /// Buffers handed back, in order
    pub released: Vec<u64>,
    /// Framebuffers currently registered
    pub framebuffers: BTreeSet<u32>,
    pub native_surfaces: BTreeSet<u32>,

    /// Every synchronous mode-set as `(crtc, framebuffer)`
    pub modesets: Vec<(CrtcId, FramebufferId)>,
    /// Every queued page flip as `(crtc, framebuffer, output)`
    pub flips: Vec<(CrtcId, FramebufferId, OutputId)>,
    pub disabled: Vec<CrtcId>,
    /// Framebuffer each live CRTC is scanning out
    pub scanning: BTreeMap<CrtcId, u32>,

    in_flight: Vec<(OutputId, CrtcId, u32)>,
    events: VecDeque<FlipEvent>,
    frame: u32,

    /// Fail the next page flips with `EBUSY`
    pub busy_flips: usize,
    /// Fail the next framebuffer registrations
    pub failing_framebuffers: usize,
    /// Fail the next CRTC disables with `EACCES`
    pub failing_disables: usize,
    /// Complete in-flight flips when the core blocks on them
    pub complete_on_wait: bool,
    /// Timestamp used for flips completed while waiting
    pub wait_timestamp: Duration,

    pub master: bool,
    pub master_drops: usize,
}

impl FakeKms {
    pub fn with_connectors(connectors: Vec<ConnectorInfo>) -> Self {
        Self {
            connectors,
            master: true,
            complete_on_wait: true,
            ..Self::default()
        }
    }

    /// Whether a flip is queued for `output`
    pub fn flip_in_flight(&self, output: OutputId) -> bool {
        self.in_flight.iter().any(|(id, _, _)| *id == output)
    }

    /// The kernel finished the flip queued for `output` at `timestamp`
    pub fn complete(&mut self, output: OutputId, timestamp: Duration) {
        let index = self
            .in_flight
            .iter()
            .position(|(id, _, _)| *id == output)
            .expect("no flip in flight for output");
        let (_, crtc, framebuffer) = self.in_flight.remove(index);
        self.scanning.insert(crtc, framebuffer);
        self.frame += 1;
        self.events.push_back(FlipEvent {
            output,
            frame: self.frame,
            timestamp,
        });
    }

    /// Connects or disconnects a connector
    pub fn set_connected(&mut self, connector: u32, connected: bool) {
        for info in self.connectors.iter_mut() {
            if info.id == ConnectorId(connector) {
                info.connected = connected;
            }
        }
    }
}

impl KmsBackend for FakeKms {
    type Buffer = FakeBuffer;

    fn connectors(&mut self) -> Result<Vec<ConnectorInfo>, KmsError> {
        Ok(self.connectors.clone())
    }

    fn create_native_surface(&mut self, _: CrtcId, _: &ModeInfo) -> Result<NativeSurface, KmsError> {
        self.next_surface += 1;
        self.native_surfaces.insert(self.next_surface);
        Ok(NativeSurface(self.next_surface))
    }

    fn destroy_native_surface(&mut self, surface: NativeSurface) {
        self.native_surfaces.remove(&surface.0);
    }

    fn lock_front_buffer(&mut self, surface: NativeSurface) -> Result<FakeBuffer, KmsError> {
        self.next_buffer += 1;
        self.locked.insert(self.next_buffer);
        Ok(FakeBuffer {
            id: self.next_buffer,
            surface,
        })
    }

    fn release_buffer(&mut self, _: NativeSurface, buffer: FakeBuffer) {
        assert!(self.locked.remove(&buffer.id), "buffer released twice");
        self.released.push(buffer.id);
    }

    fn add_framebuffer(
        &mut self,
        _: &FakeBuffer,
        path: RegistrationPath,
    ) -> Result<FramebufferId, KmsError> {
        assert_eq!(path, RegistrationPath::Legacy);
        if self.failing_framebuffers > 0 {
            self.failing_framebuffers -= 1;
            return Err(KmsError::Framebuffer(std::io::Error::from_raw_os_error(
                libc::ENOMEM,
            )));
        }
        self.next_framebuffer += 1;
        self.framebuffers.insert(self.next_framebuffer);
        Ok(FramebufferId(self.next_framebuffer))
    }

    fn remove_framebuffer(&mut self, framebuffer: FramebufferId) {
        assert!(
            !self.in_flight.iter().any(|(_, _, fb)| *fb == framebuffer.0),
            "framebuffer removed while a queued flip references it"
        );
        assert!(
            !self.scanning.values().any(|fb| *fb == framebuffer.0),
            "framebuffer removed while a CRTC scans it out"
        );
        assert!(
            self.framebuffers.remove(&framebuffer.0),
            "framebuffer removed twice"
        );
    }

    fn set_crtc(
        &mut self,
        crtc: CrtcId,
        framebuffer: FramebufferId,
        _: ConnectorId,
        _: &ModeInfo,
    ) -> Result<(), KmsError> {
        self.modesets.push((crtc, framebuffer));
        self.scanning.insert(crtc, framebuffer.0);
        Ok(())
    }

    fn disable_crtc(&mut self, crtc: CrtcId) -> Result<(), KmsError> {
        if self.failing_disables > 0 {
            self.failing_disables -= 1;
            return Err(KmsError::from(std::io::Error::from_raw_os_error(
                libc::EACCES,
            )));
        }
        self.disabled.push(crtc);
        self.scanning.remove(&crtc);
        // A switched-off CRTC never completes what was queued on it.
        self.in_flight.retain(|(_, queued, _)| *queued != crtc);
        Ok(())
    }

    fn page_flip(
        &mut self,
        crtc: CrtcId,
        framebuffer: FramebufferId,
        output: OutputId,
    ) -> Result<(), KmsError> {
        if self.busy_flips > 0 {
            self.busy_flips -= 1;
            return Err(KmsError::from(std::io::Error::from_raw_os_error(libc::EBUSY)));
        }
        assert!(!self.flip_in_flight(output), "two flips in flight");
        self.flips.push((crtc, framebuffer, output));
        self.in_flight.push((output, crtc, framebuffer.0));
        Ok(())
    }

    fn read_events(&mut self) -> Result<Vec<FlipEvent>, KmsError> {
        Ok(self.events.drain(..).collect())
    }

    fn wait_events(&mut self, _: Duration) -> Result<Vec<FlipEvent>, KmsError> {
        if self.events.is_empty() && self.complete_on_wait {
            let outputs: Vec<OutputId> = self.in_flight.iter().map(|(id, _, _)| *id).collect();
            for output in outputs {
                self.complete(output, self.wait_timestamp);
            }
        }
        self.read_events()
    }

    fn drop_master(&mut self) -> Result<(), KmsError> {
        self.master = false;
        self.master_drops += 1;
        Ok(())
    }

    fn acquire_master(&mut self) -> Result<(), KmsError> {
        self.master = true;
        Ok(())
    }
}

/// One frame as seen by the renderer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFrame {
    pub output: OutputId,
    pub boxes: Vec<Rect>,
    pub surfaces: Vec<(SurfaceId, i32, i32)>,
}

#[derive(Debug, Default)]
pub struct RecordingRenderer {
    pub frames: Vec<RenderedFrame>,
    pub imported: Vec<(SurfaceId, BufferHandle)>,
    pub destroyed: Vec<SurfaceId>,
    current: Option<RenderedFrame>,
}

impl RecordingRenderer {
    pub fn frames_for(&self, output: OutputId) -> Vec<&RenderedFrame> {
        self.frames.iter().filter(|f| f.output == output).collect()
    }
}

impl Renderer for RecordingRenderer {
    fn begin_frame(&mut self, output: &Output) -> Result<(), RenderError> {
        self.current = Some(RenderedFrame {
            output: output.id(),
            boxes: Vec::new(),
            surfaces: Vec::new(),
        });
        Ok(())
    }

    fn stencil_damage_pass(&mut self) {}

    fn draw_rect(&mut self, _: Rect, _: Color) {}

    fn begin_scene(&mut self) {}

    fn draw_surface(&mut self, surface: &Surface, x: i32, y: i32) {
        if let Some(frame) = self.current.as_mut() {
            frame.surfaces.push((surface.id(), x, y));
        }
    }

    fn end_scene(&mut self) {}

    fn end_frame(&mut self, output: &Output, damage: &[Rect]) -> Result<(), RenderError> {
        let mut frame = self.current.take().ok_or(RenderError::NoTarget(output.id()))?;
        frame.boxes = damage.to_vec();
        self.frames.push(frame);
        Ok(())
    }

    fn import_buffer(&mut self, surface: SurfaceId, buffer: BufferHandle) -> Result<(), RenderError> {
        self.imported.push((surface, buffer));
        Ok(())
    }

    fn destroy_surface_texture(&mut self, surface: SurfaceId) {
        self.destroyed.push(surface);
    }
}

pub type TestCompositor = Compositor<FakeKms, RecordingRenderer, VecDeque<OutputId>>;

/// A connected 1000x1000@60Hz connector driven by CRTC `100 + id`
pub fn connector(id: u32) -> ConnectorInfo {
    ConnectorInfo {
        id: ConnectorId(id),
        name: format!("DP-{id}"),
        connected: true,
        modes: vec![ModeInfo::new(1000, 1000, 60_000, true)],
        possible_crtcs: vec![CrtcId(100 + id)],
    }
}

pub fn output(index: usize) -> OutputId {
    OutputId::new(index).unwrap()
}

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Builds a compositor over `count` side-by-side outputs, without running
/// any frame yet
pub fn compositor(count: u32) -> TestCompositor {
    let backend = FakeKms::with_connectors((1..=count).map(connector).collect());
    let device = DeviceSession::new(backend, 8, ms(100));
    let mut compositor = Compositor::new(
        device,
        RecordingRenderer::default(),
        VecDeque::new(),
        RenderOptions::default(),
    );
    compositor.init().unwrap();
    compositor
}

/// Runs every armed repaint, like the event loop going idle
pub fn run_idle(compositor: &mut TestCompositor) -> usize {
    let mut ran = 0;
    while let Some(id) = compositor.trigger_mut().pop_front() {
        compositor.run_repaint(id);
        ran += 1;
    }
    ran
}

/// Builds a compositor whose outputs already finished their bootstrap
/// mode-set
pub fn bootstrapped(count: u32) -> TestCompositor {
    let mut compositor = compositor(count);
    run_idle(&mut compositor);
    compositor.drain_frame_done();
    compositor
}

/// Completes the flip of `output` and hands the completion to the core
pub fn flip(compositor: &mut TestCompositor, output: OutputId, timestamp: Duration) {
    compositor
        .device_mut()
        .backend_mut()
        .complete(output, timestamp);
    compositor.dispatch_kernel_events().unwrap();
}

/// Creates a mapped surface with a committed buffer
pub fn mapped_surface(compositor: &mut TestCompositor, x: i32, y: i32, w: u32, h: u32) -> SurfaceId {
    let id = compositor.create_surface(x, y, w, h);
    compositor.attach_buffer(id, BufferHandle(0xff)).unwrap();
    compositor.commit(id).unwrap();
    id
}
