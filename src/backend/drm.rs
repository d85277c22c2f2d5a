//! DRM device backend
//!
//! [`DrmCard`] implements [`KmsBackend`] on top of the `drm` crate using
//! legacy mode-setting and dumb buffers. Every output gets a small swapchain
//! of dumb buffers; locking the front buffer copies the output's
//! [`Canvas`](crate::renderer::software::Canvas) into a free one.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::{Duration, Instant};

use drm::buffer::{Buffer as _, DrmFourcc};
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{
    self, connector, crtc, framebuffer, Device as ControlDevice, ModeTypeFlags, PageFlipFlags,
    RawResourceHandle,
};
use drm::{Device, DriverCapability};
use log::{debug, info, trace, warn};
use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::Errno;

use crate::error::KmsError;
use crate::output::OutputId;
use crate::renderer::software::{Canvas, CanvasStore};
use crate::scanout::{
    BufferId, ConnectorId, ConnectorInfo, CrtcId, FlipEvent, FramebufferId, FramebufferLayout,
    KmsBackend, ModeInfo, NativeSurface, PlaneLayout, RegistrationPath, ScanoutBuffer,
    DRM_FORMAT_XRGB8888,
};

/// Dumb buffers allocated per output: one per scanout slot
const SWAPCHAIN_DEPTH: usize = 4;

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

/// A dumb buffer holding one finished frame
#[derive(Debug)]
pub struct DumbScanout {
    buffer: DumbBuffer,
}

impl ScanoutBuffer for DumbScanout {
    fn buffer_id(&self) -> BufferId {
        BufferId(u64::from(u32::from(self.buffer.handle())))
    }

    fn layout(&self) -> FramebufferLayout {
        let (width, height) = self.buffer.size();
        FramebufferLayout {
            width,
            height,
            fourcc: DRM_FORMAT_XRGB8888,
            planes: vec![PlaneLayout {
                handle: u32::from(self.buffer.handle()),
                pitch: self.buffer.pitch(),
                offset: 0,
            }],
            // Dumb buffers are always linear and carry no modifier.
            modifier: None,
        }
    }
}

struct Swapchain {
    width: u32,
    height: u32,
    free: Vec<DumbBuffer>,
    allocated: usize,
}

/// An opened DRM device node
pub struct DrmCard {
    card: Card,
    canvases: CanvasStore,
    swapchains: HashMap<NativeSurface, Swapchain>,
    next_surface: u32,
    modes: HashMap<ConnectorId, Vec<(ModeInfo, control::Mode)>>,
    flip_owners: HashMap<CrtcId, OutputId>,
}

fn object<T: From<RawResourceHandle>>(raw: u32) -> Result<T, KmsError> {
    control::from_u32(raw).ok_or_else(|| {
        KmsError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid DRM object id {raw}"),
        ))
    })
}

fn mode_info(mode: &control::Mode) -> ModeInfo {
    let (width, height) = mode.size();
    ModeInfo::new(
        u32::from(width),
        u32::from(height),
        mode.vrefresh() * 1000,
        mode.mode_type().contains(ModeTypeFlags::PREFERRED),
    )
}

/// Blocks until `fd` is readable or `timeout` passes
fn wait_readable<Fd: AsFd>(fd: &Fd, timeout: Duration) -> Result<bool, KmsError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = remaining.as_millis().min(i32::MAX as u128) as i32;
        let mut fds = [PollFd::new(fd, PollFlags::IN)];
        match poll(&mut fds, millis) {
            Ok(ready) => return Ok(ready > 0),
            Err(Errno::INTR) => continue,
            Err(err) => return Err(KmsError::Io(err.into())),
        }
    }
}

/// Copies an `XRGB8888` canvas into a mapped buffer with the given pitch
fn blit(canvas: &Canvas, pitch: usize, dst: &mut [u8]) {
    let width = canvas.width() as usize;
    if width == 0 {
        return;
    }

    let row_bytes = width * 4;
    for (y, row) in canvas.pixels().chunks_exact(width).enumerate() {
        let start = y * pitch;
        let Some(dst_row) = dst.get_mut(start..start + row_bytes) else {
            break;
        };
        for (px, out) in row.iter().zip(dst_row.chunks_exact_mut(4)) {
            out.copy_from_slice(&px.to_le_bytes());
        }
    }
}

impl DrmCard {
    /// Wraps an opened, non-blocking DRM device node
    pub fn new(fd: OwnedFd, canvases: CanvasStore) -> Result<Self, KmsError> {
        let card = Card(File::from(fd));
        if card.get_driver_capability(DriverCapability::DumbBuffer)? == 0 {
            return Err(KmsError::Unsupported("dumb buffers"));
        }

        if let Ok(driver) = card.get_driver() {
            info!(
                "🎮 DRM driver {} ({})",
                driver.name().to_string_lossy(),
                driver.description().to_string_lossy()
            );
        }

        Ok(Self {
            card,
            canvases,
            swapchains: HashMap::new(),
            next_surface: 0,
            modes: HashMap::new(),
            flip_owners: HashMap::new(),
        })
    }

    /// The device fd, for registering with an event loop
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.card.as_fd()
    }

    /// Gives the device fd back so the session that opened it can close it
    ///
    /// Any dumb buffers still allocated go away with the fd.
    pub fn into_fd(self) -> OwnedFd {
        if !self.swapchains.is_empty() {
            warn!("closing the device with {} swapchain(s) left", self.swapchains.len());
        }
        OwnedFd::from(self.card.0)
    }

    fn drm_mode(&self, connector: ConnectorId, mode: &ModeInfo) -> Result<control::Mode, KmsError> {
        self.modes
            .get(&connector)
            .and_then(|modes| modes.iter().find(|(info, _)| info == mode))
            .map(|(_, mode)| *mode)
            .ok_or(KmsError::NoMode(connector.0))
    }

    fn destroy_dumb(&self, buffer: DumbBuffer) {
        if let Err(err) = self.card.destroy_dumb_buffer(buffer) {
            warn!("destroying dumb buffer failed: {}", err);
        }
    }
}

impl KmsBackend for DrmCard {
    type Buffer = DumbScanout;

    fn connectors(&mut self) -> Result<Vec<ConnectorInfo>, KmsError> {
        let resources = self.card.resource_handles()?;
        let mut connectors = Vec::new();

        for &handle in resources.connectors() {
            let info = match self.card.get_connector(handle, true) {
                Ok(info) => info,
                Err(err) => {
                    warn!("probing connector {:?} failed: {}", handle, err);
                    continue;
                }
            };

            let mut possible_crtcs = Vec::new();
            for &encoder in info.encoders() {
                let Ok(encoder) = self.card.get_encoder(encoder) else {
                    continue;
                };
                for crtc in resources.filter_crtcs(encoder.possible_crtcs()) {
                    let id = CrtcId(u32::from(crtc));
                    if !possible_crtcs.contains(&id) {
                        possible_crtcs.push(id);
                    }
                }
            }

            let id = ConnectorId(u32::from(handle));
            let modes: Vec<(ModeInfo, control::Mode)> =
                info.modes().iter().map(|m| (mode_info(m), *m)).collect();
            connectors.push(ConnectorInfo {
                id,
                name: format!("{:?}-{}", info.interface(), info.interface_id()),
                connected: info.state() == connector::State::Connected,
                modes: modes.iter().map(|(info, _)| *info).collect(),
                possible_crtcs,
            });
            self.modes.insert(id, modes);
        }

        trace!("{} connector(s) reported", connectors.len());
        Ok(connectors)
    }

    fn create_native_surface(
        &mut self,
        crtc: CrtcId,
        mode: &ModeInfo,
    ) -> Result<NativeSurface, KmsError> {
        self.next_surface += 1;
        let native = NativeSurface(self.next_surface);

        self.canvases
            .borrow_mut()
            .insert(native, Canvas::new(mode.width, mode.height));
        self.swapchains.insert(
            native,
            Swapchain {
                width: mode.width,
                height: mode.height,
                free: Vec::new(),
                allocated: 0,
            },
        );
        debug!(
            "native surface {} for CRTC {} ({}x{})",
            native.0, crtc.0, mode.width, mode.height
        );
        Ok(native)
    }

    fn destroy_native_surface(&mut self, surface: NativeSurface) {
        self.canvases.borrow_mut().remove(&surface);
        let Some(swapchain) = self.swapchains.remove(&surface) else {
            return;
        };
        if swapchain.free.len() != swapchain.allocated {
            warn!(
                "native surface {} destroyed with {} buffer(s) still locked",
                surface.0,
                swapchain.allocated - swapchain.free.len()
            );
        }
        for buffer in swapchain.free {
            self.destroy_dumb(buffer);
        }
    }

    fn lock_front_buffer(&mut self, surface: NativeSurface) -> Result<DumbScanout, KmsError> {
        let swapchain = self
            .swapchains
            .get_mut(&surface)
            .ok_or_else(|| KmsError::BufferLock(format!("unknown native surface {}", surface.0)))?;

        let mut buffer = match swapchain.free.pop() {
            Some(buffer) => buffer,
            None if swapchain.allocated < SWAPCHAIN_DEPTH => {
                let buffer = self.card.create_dumb_buffer(
                    (swapchain.width, swapchain.height),
                    DrmFourcc::Xrgb8888,
                    32,
                )?;
                swapchain.allocated += 1;
                buffer
            }
            None => {
                return Err(KmsError::BufferLock(
                    "every scanout buffer is in use".to_string(),
                ))
            }
        };

        let pitch = buffer.pitch() as usize;
        let copied = match self.card.map_dumb_buffer(&mut buffer) {
            Ok(mut mapping) => {
                if let Some(canvas) = self.canvases.borrow().get(&surface) {
                    blit(canvas, pitch, &mut mapping);
                }
                Ok(())
            }
            Err(err) => Err(err),
        };
        if let Err(err) = copied {
            swapchain.free.push(buffer);
            return Err(KmsError::BufferLock(err.to_string()));
        }

        Ok(DumbScanout { buffer })
    }

    fn release_buffer(&mut self, surface: NativeSurface, buffer: DumbScanout) {
        match self.swapchains.get_mut(&surface) {
            Some(swapchain) => swapchain.free.push(buffer.buffer),
            None => self.destroy_dumb(buffer.buffer),
        }
    }

    fn add_framebuffer(
        &mut self,
        buffer: &DumbScanout,
        path: RegistrationPath,
    ) -> Result<FramebufferId, KmsError> {
        if path == RegistrationPath::Modifiers {
            return Err(KmsError::Unsupported("framebuffer modifiers"));
        }

        let handle = self
            .card
            .add_framebuffer(&buffer.buffer, 24, 32)
            .map_err(KmsError::Framebuffer)?;
        Ok(FramebufferId(u32::from(handle)))
    }

    fn remove_framebuffer(&mut self, framebuffer: FramebufferId) {
        let handle = match object::<framebuffer::Handle>(framebuffer.0) {
            Ok(handle) => handle,
            Err(err) => {
                warn!("{}", err);
                return;
            }
        };
        if let Err(err) = self.card.destroy_framebuffer(handle) {
            warn!("removing framebuffer {} failed: {}", framebuffer.0, err);
        }
    }

    fn set_crtc(
        &mut self,
        crtc: CrtcId,
        framebuffer: FramebufferId,
        connector: ConnectorId,
        mode: &ModeInfo,
    ) -> Result<(), KmsError> {
        let mode = self.drm_mode(connector, mode)?;
        let crtc_handle: crtc::Handle = object(crtc.0)?;
        let fb_handle: framebuffer::Handle = object(framebuffer.0)?;
        let connector_handle: connector::Handle = object(connector.0)?;

        self.card.set_crtc(
            crtc_handle,
            Some(fb_handle),
            (0, 0),
            &[connector_handle],
            Some(mode),
        )?;
        Ok(())
    }

    fn disable_crtc(&mut self, crtc: CrtcId) -> Result<(), KmsError> {
        let handle: crtc::Handle = object(crtc.0)?;
        self.card.set_crtc(handle, None, (0, 0), &[], None)?;
        self.flip_owners.remove(&crtc);
        Ok(())
    }

    fn page_flip(
        &mut self,
        crtc: CrtcId,
        framebuffer: FramebufferId,
        output: OutputId,
    ) -> Result<(), KmsError> {
        let crtc_handle: crtc::Handle = object(crtc.0)?;
        let fb_handle: framebuffer::Handle = object(framebuffer.0)?;

        // The kernel tags the completion with the CRTC; remember who asked.
        self.card
            .page_flip(crtc_handle, fb_handle, PageFlipFlags::EVENT, None)?;
        self.flip_owners.insert(crtc, output);
        Ok(())
    }

    fn read_events(&mut self) -> Result<Vec<FlipEvent>, KmsError> {
        let events: Vec<control::Event> = match self.card.receive_events() {
            Ok(events) => events.collect(),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut flips = Vec::new();
        for event in events {
            let control::Event::PageFlip(flip) = event else {
                continue;
            };
            let crtc = CrtcId(u32::from(flip.crtc));
            match self.flip_owners.remove(&crtc) {
                Some(output) => flips.push(FlipEvent {
                    output,
                    frame: flip.frame,
                    timestamp: flip.duration,
                }),
                None => debug!("flip completion on unowned CRTC {}", crtc.0),
            }
        }
        Ok(flips)
    }

    fn wait_events(&mut self, timeout: Duration) -> Result<Vec<FlipEvent>, KmsError> {
        if wait_readable(&self.card, timeout)? {
            self.read_events()
        } else {
            Ok(Vec::new())
        }
    }

    fn drop_master(&mut self) -> Result<(), KmsError> {
        self.card.release_master_lock()?;
        debug!("released DRM master");
        Ok(())
    }

    fn acquire_master(&mut self) -> Result<(), KmsError> {
        self.card.acquire_master_lock()?;
        debug!("acquired DRM master");
        Ok(())
    }
}
