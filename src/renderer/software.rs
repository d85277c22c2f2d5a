//! CPU renderer drawing into shared `XRGB8888` canvases
//!
//! Every output's native surface is a [`Canvas`] in a [`CanvasStore`]
//! shared with the KMS backend: the renderer fills rectangles into the
//! canvas, and the backend copies the finished canvas into a scanout buffer
//! when the frame is submitted.
//!
//! Surfaces are drawn as solid rectangles whose color comes from the low 24
//! bits of the attached buffer handle; pixel-level composition of client
//! content is out of scope.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, trace};

use crate::error::RenderError;
use crate::output::Output;
use crate::renderer::damage::Rect;
use crate::renderer::{Color, Renderer};
use crate::scanout::NativeSurface;
use crate::surface::{BufferHandle, Surface, SurfaceId};

/// Canvases keyed by the native surface they back
pub type CanvasStore = Rc<RefCell<HashMap<NativeSurface, Canvas>>>;

/// Creates an empty, shareable canvas store
pub fn canvas_store() -> CanvasStore {
    Rc::new(RefCell::new(HashMap::new()))
}

/// A CPU-side frame in `XRGB8888`
#[derive(Debug, Clone)]
pub struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
    frames: u64,
}

impl Canvas {
    /// Creates a black canvas
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize],
            frames: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row-major pixel data
    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    /// Number of frames finished into this canvas
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// Paints `rect` clipped to the canvas and to `clip`
    fn fill(&mut self, rect: Rect, color: Color, clip: &[Rect]) {
        let Some(rect) = rect.intersection(&self.bounds()) else {
            return;
        };

        for clip_rect in clip {
            let Some(area) = rect.intersection(clip_rect) else {
                continue;
            };
            for y in area.y..area.bottom() {
                let row = y as usize * self.width as usize;
                for x in area.x..area.right() {
                    let px = &mut self.pixels[row + x as usize];
                    *px = if color.a == 0xff {
                        color.to_xrgb8888()
                    } else {
                        color.blend_over(*px)
                    };
                }
            }
        }
    }
}

/// Solid-color software renderer
#[derive(Debug)]
pub struct SoftwareRenderer {
    canvases: CanvasStore,
    target: Option<NativeSurface>,
    clip: Vec<Rect>,
    stenciling: bool,
    textures: HashMap<SurfaceId, Color>,
}

impl SoftwareRenderer {
    /// Creates a renderer drawing into the canvases of `canvases`
    pub fn new(canvases: CanvasStore) -> Self {
        Self {
            canvases,
            target: None,
            clip: Vec::new(),
            stenciling: false,
            textures: HashMap::new(),
        }
    }

    /// Color used for a surface, if its buffer was imported
    pub fn texture(&self, surface: SurfaceId) -> Option<Color> {
        self.textures.get(&surface).copied()
    }

    fn fill(&mut self, rect: Rect, color: Color) {
        let Some(target) = self.target else {
            return;
        };
        if let Some(canvas) = self.canvases.borrow_mut().get_mut(&target) {
            canvas.fill(rect, color, &self.clip);
        }
    }
}

impl Renderer for SoftwareRenderer {
    fn begin_frame(&mut self, output: &Output) -> Result<(), RenderError> {
        let native = output.native_surface();
        if !self.canvases.borrow().contains_key(&native) {
            return Err(RenderError::NoTarget(output.id()));
        }
        self.target = Some(native);
        self.clip.clear();
        Ok(())
    }

    fn stencil_damage_pass(&mut self) {
        self.stenciling = true;
    }

    fn draw_rect(&mut self, rect: Rect, color: Color) {
        if self.stenciling {
            self.clip.push(rect);
        }
        self.fill(rect, color);
    }

    fn begin_scene(&mut self) {
        self.stenciling = false;
    }

    fn draw_surface(&mut self, surface: &Surface, x: i32, y: i32) {
        let Some(color) = self.texture(surface.id()) else {
            trace!("{} has no texture, skipped", surface.id());
            return;
        };
        let (width, height) = surface.size();
        self.fill(Rect::new(x, y, width, height), color);
    }

    fn end_scene(&mut self) {}

    fn end_frame(&mut self, output: &Output, damage: &[Rect]) -> Result<(), RenderError> {
        let target = self.target.take().ok_or(RenderError::NoTarget(output.id()))?;
        if let Some(canvas) = self.canvases.borrow_mut().get_mut(&target) {
            canvas.frames += 1;
        }
        self.clip.clear();
        trace!("{}: frame finished, {} damage boxes", output.id(), damage.len());
        Ok(())
    }

    fn import_buffer(&mut self, surface: SurfaceId, buffer: BufferHandle) -> Result<(), RenderError> {
        let rgb = buffer.0 & 0x00ff_ffff;
        let color = Color::rgb((rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8);
        self.textures.insert(surface, color);
        Ok(())
    }

    fn destroy_surface_texture(&mut self, surface: SurfaceId) {
        if self.textures.remove(&surface).is_some() {
            debug!("{}: texture destroyed", surface);
        }
    }
}
