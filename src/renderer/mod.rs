//! Renderer collaborator and the per-output render pass
//!
//! The core never touches pixels itself. It drives a [`Renderer`] through a
//! fixed sequence for every frame of an output:
//!
//! 1. `begin_frame(output)`
//! 2. damage stencil pass: `stencil_damage_pass()` followed by one
//!    `draw_rect` per merged damage box, filled with the background color
//! 3. composite pass: `begin_scene()`, `draw_surface` for every surface that
//!    intersects the damage, back-to-front, then `end_scene()`
//! 4. `end_frame(output, boxes)` with the same merged boxes, so the
//!    renderer can present partially
//!
//! [`render_output`] implements that sequence. [`software::SoftwareRenderer`]
//! is the CPU implementation the binary uses.

pub mod damage;
pub mod software;

use std::fmt;

use log::trace;

use crate::error::RenderError;
use crate::output::Output;
use crate::surface::{BufferHandle, Surface, SurfaceId};
use damage::Rect;

/// An 8-bit RGBA color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 0xff }
    }

    /// Parses `#RRGGBB` or `#RRGGBBAA`
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#')?;
        if !matches!(digits.len(), 6 | 8) || !digits.is_ascii() {
            return None;
        }

        let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).ok();
        Some(Self {
            r: channel(0)?,
            g: channel(2)?,
            b: channel(4)?,
            a: if digits.len() == 8 { channel(6)? } else { 0xff },
        })
    }

    /// Packs the color as a `DRM_FORMAT_XRGB8888` pixel
    pub fn to_xrgb8888(self) -> u32 {
        u32::from(self.r) << 16 | u32::from(self.g) << 8 | u32::from(self.b)
    }

    /// Alpha-blends `self` over an `XRGB8888` pixel
    pub fn blend_over(self, dst: u32) -> u32 {
        let alpha = u32::from(self.a);
        let mix = |src: u8, shift: u32| {
            let d = (dst >> shift) & 0xff;
            ((u32::from(src) * alpha + d * (255 - alpha)) / 255) << shift
        };
        mix(self.r, 16) | mix(self.g, 8) | mix(self.b, 0)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}{:02X}", self.r, self.g, self.b, self.a)
    }
}

/// Drawing operations the core consumes
#[cfg_attr(test, mockall::automock)]
pub trait Renderer {
    /// Makes the output's native surface the current target
    fn begin_frame(&mut self, output: &Output) -> Result<(), RenderError>;

    /// Switches to stenciling; following `draw_rect` calls mark damage
    fn stencil_damage_pass(&mut self);

    /// Fills a rectangle in output-local coordinates
    fn draw_rect(&mut self, rect: Rect, color: Color);

    fn begin_scene(&mut self);

    /// Draws a surface with its top-left corner at output-local `(x, y)`
    fn draw_surface(&mut self, surface: &Surface, x: i32, y: i32);

    fn end_scene(&mut self);

    /// Finishes the frame; `damage` lists the boxes that changed
    fn end_frame(&mut self, output: &Output, damage: &[Rect]) -> Result<(), RenderError>;

    /// Imports a client buffer as the surface's texture
    fn import_buffer(&mut self, surface: SurfaceId, buffer: BufferHandle) -> Result<(), RenderError>;

    /// Drops whatever the renderer holds for a surface
    fn destroy_surface_texture(&mut self, surface: SurfaceId);
}

/// Per-frame rendering parameters
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Fill color of damaged areas not covered by a surface
    pub background: Color,
    /// Translucent overlay drawn over every damage box, for debugging
    pub damage_tint: Option<Color>,
    /// Damage box budget, capped at [`damage::MAX_RENDER_BOXES`]
    pub max_damage_boxes: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            background: Color::BLACK,
            damage_tint: None,
            max_damage_boxes: damage::MAX_RENDER_BOXES,
        }
    }
}

/// Runs one render pass for `output`
///
/// `surfaces` are in stacking order, bottom first. Returns the merged damage
/// boxes handed to the renderer.
pub fn render_output<R: Renderer + ?Sized>(
    renderer: &mut R,
    output: &Output,
    surfaces: &[Surface],
    options: &RenderOptions,
) -> Result<Vec<Rect>, RenderError> {
    let boxes = output.damage.merge_for_render(options.max_damage_boxes);
    let origin = output.geometry();

    renderer.begin_frame(output)?;

    renderer.stencil_damage_pass();
    for rect in &boxes {
        renderer.draw_rect(*rect, options.background);
    }

    renderer.begin_scene();
    let mut drawn = 0;
    for surface in surfaces {
        if surface.buffer().is_none() || !surface.visible_on.contains(output.id()) {
            continue;
        }

        let local = surface.geometry().to_screen_coords(-origin.x, -origin.y);
        if boxes.iter().any(|rect| rect.intersects(&local)) {
            renderer.draw_surface(surface, local.x, local.y);
            drawn += 1;
        }
    }
    if let Some(tint) = options.damage_tint {
        for rect in &boxes {
            renderer.draw_rect(*rect, tint);
        }
    }
    renderer.end_scene();

    renderer.end_frame(output, &boxes)?;
    trace!(
        "{}: rendered {} surfaces into {} damage boxes",
        output.id(),
        drawn,
        boxes.len()
    );
    Ok(boxes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputId;
    use crate::scanout::{ConnectorId, CrtcId, ModeInfo, NativeSurface};
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn output() -> Output {
        let mut output = Output::new(
            OutputId::new(0).unwrap(),
            "eDP-1",
            ConnectorId(1),
            CrtcId(1),
            ModeInfo::new(1000, 1000, 60_000, true),
            (1000, 0),
            NativeSurface(1),
        );
        output.add_global_damage(Rect::new(1100, 100, 50, 50));
        output
    }

    fn surface(raw: u32, x: i32, y: i32, visible: bool) -> Surface {
        let mut s = Surface::new(SurfaceId::new(raw), x, y, 100, 100);
        s.attach(BufferHandle(raw as u64));
        if visible {
            s.visible_on.insert(OutputId::new(0).unwrap());
        }
        s
    }

    #[test]
    fn test_color_from_hex() {
        assert_eq!(Color::from_hex("#102030"), Some(Color::rgb(0x10, 0x20, 0x30)));
        assert_eq!(
            Color::from_hex("#10203080").map(|c| c.a),
            Some(0x80)
        );
        assert_eq!(Color::from_hex("102030"), None);
        assert_eq!(Color::from_hex("#12345"), None);
        assert_eq!(Color::rgb(1, 2, 3).to_xrgb8888(), 0x0001_0203);
    }

    #[test]
    fn test_blend_over() {
        let half_white = Color { r: 255, g: 255, b: 255, a: 128 };
        let px = half_white.blend_over(0);
        assert_eq!(px >> 16 & 0xff, 128);
        assert_eq!(Color::rgb(9, 9, 9).blend_over(0x00ff_ffff), 0x0009_0909);
    }

    #[test]
    fn test_render_pass_call_order() {
        let out = output();
        let surfaces = vec![
            surface(1, 1050, 50, true),
            surface(2, 1500, 500, true),
            surface(3, 1100, 100, false),
        ];

        let mut renderer = MockRenderer::new();
        let mut seq = Sequence::new();
        renderer
            .expect_begin_frame()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        renderer
            .expect_stencil_damage_pass()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        renderer
            .expect_draw_rect()
            .with(eq(Rect::new(100, 100, 50, 50)), eq(Color::BLACK))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        renderer
            .expect_begin_scene()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        renderer
            .expect_draw_surface()
            .withf(|s, x, y| s.id() == SurfaceId::new(1) && *x == 50 && *y == 50)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        renderer
            .expect_end_scene()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        renderer
            .expect_end_frame()
            .withf(|_, boxes| boxes.to_vec() == vec![Rect::new(100, 100, 50, 50)])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let boxes = render_output(&mut renderer, &out, &surfaces, &RenderOptions::default()).unwrap();
        assert_eq!(boxes, vec![Rect::new(100, 100, 50, 50)]);
    }

    #[test]
    fn test_begin_frame_failure_aborts_pass() {
        let out = output();
        let mut renderer = MockRenderer::new();
        renderer
            .expect_begin_frame()
            .returning(|o| Err(RenderError::NoTarget(o.id())));
        renderer.expect_stencil_damage_pass().never();
        renderer.expect_end_frame().never();

        let err = render_output(&mut renderer, &out, &[], &RenderOptions::default()).unwrap_err();
        assert!(matches!(err, RenderError::NoTarget(_)));
    }

    #[test]
    fn test_damage_tint_draws_after_surfaces() {
        let out = output();
        let tint = Color { r: 255, g: 0, b: 0, a: 64 };
        let options = RenderOptions {
            damage_tint: Some(tint),
            ..RenderOptions::default()
        };

        let mut renderer = MockRenderer::new();
        let mut seq = Sequence::new();
        renderer.expect_begin_frame().returning(|_| Ok(()));
        renderer.expect_stencil_damage_pass().return_const(());
        renderer
            .expect_draw_rect()
            .with(eq(Rect::new(100, 100, 50, 50)), eq(Color::BLACK))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        renderer
            .expect_begin_scene()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        renderer
            .expect_draw_rect()
            .with(eq(Rect::new(100, 100, 50, 50)), eq(tint))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        renderer
            .expect_end_scene()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        renderer.expect_end_frame().returning(|_, _| Ok(()));

        render_output(&mut renderer, &out, &[], &options).unwrap();
    }
}
