//! Built-in demo client
//!
//! Stands in for real Wayland clients when none are connected: a handful of
//! solid-color surfaces bounce across the output row. Each surface behaves
//! like a well-mannered client and only commits a new frame after the frame
//! callback for the previous one fired, so the demo runs exactly as fast as
//! the slowest output showing it.

use std::collections::HashSet;

use log::{debug, info};

use crate::compositor::Compositor;
use crate::error::CompositorResult;
use crate::renderer::damage::Rect;
use crate::renderer::Renderer;
use crate::scanout::KmsBackend;
use crate::scheduler::IdleTrigger;
use crate::surface::{BufferHandle, FrameCallback, FrameDone, SurfaceId};

const PALETTE: [u64; 5] = [0x89B4FA, 0xF38BA8, 0xA6E3A1, 0xF9E2AF, 0xCBA6F7];

/// Pixels moved per committed frame
const SPEED: i32 = 6;

#[derive(Debug)]
struct DemoSurface {
    id: SurfaceId,
    velocity: (i32, i32),
}

/// Animated surfaces paced by frame callbacks
#[derive(Debug, Default)]
pub struct DemoClient {
    surfaces: Vec<DemoSurface>,
    waiting: HashSet<SurfaceId>,
    next_callback: u32,
    commits: u64,
}

impl DemoClient {
    /// Creates `count` surfaces spread over the outputs
    pub fn spawn<B, R, I>(compositor: &mut Compositor<B, R, I>, count: u32) -> CompositorResult<Self>
    where
        B: KmsBackend,
        R: Renderer,
        I: IdleTrigger,
    {
        let mut client = Self::default();
        let Some(bounds) = compositor.global_bounds() else {
            return Ok(client);
        };

        let width = (bounds.width / 4).max(1);
        let height = (bounds.height / 4).max(1);
        for i in 0..count {
            let step = i as i32 * 37;
            let x = bounds.x + step % (bounds.width as i32 - width as i32).max(1);
            let y = bounds.y + step % (bounds.height as i32 - height as i32).max(1);
            let id = compositor.create_surface(x, y, width, height);

            let color = PALETTE[i as usize % PALETTE.len()];
            compositor.attach_buffer(id, BufferHandle(color))?;
            compositor.damage_surface(id, Rect::new(0, 0, width, height))?;

            let direction = if i % 2 == 0 { 1 } else { -1 };
            client.surfaces.push(DemoSurface {
                id,
                velocity: (SPEED * direction, SPEED / 2 + i as i32 % 3),
            });
            client.present(compositor, id)?;
        }

        info!("🎭 Demo client started with {} surface(s)", count);
        Ok(client)
    }

    /// Number of surfaces owned by the demo
    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    /// Surfaces still waiting for their frame callback
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Total number of commits made
    pub fn commits(&self) -> u64 {
        self.commits
    }

    /// Feeds released frame callbacks back to the demo
    pub fn frame_done(&mut self, done: &[FrameDone]) {
        for event in done {
            self.waiting.remove(&event.surface);
        }
    }

    /// Advances every surface whose previous frame has been shown
    ///
    /// Returns the number of surfaces that committed a new frame.
    pub fn tick<B, R, I>(&mut self, compositor: &mut Compositor<B, R, I>) -> CompositorResult<usize>
    where
        B: KmsBackend,
        R: Renderer,
        I: IdleTrigger,
    {
        let Some(bounds) = compositor.global_bounds() else {
            return Ok(0);
        };

        let mut committed = 0;
        for index in 0..self.surfaces.len() {
            let id = self.surfaces[index].id;
            if self.waiting.contains(&id) {
                continue;
            }
            let Some(surface) = compositor.surface(id) else {
                continue;
            };

            let geometry = surface.geometry();
            let velocity = &mut self.surfaces[index].velocity;
            let (x, y) = bounce(geometry, bounds, velocity);
            compositor.set_surface_geometry(id, x, y, geometry.width, geometry.height)?;
            compositor.damage_surface(id, Rect::new(0, 0, geometry.width, geometry.height))?;
            self.present(compositor, id)?;
            committed += 1;
        }
        Ok(committed)
    }

    /// Destroys every demo surface
    pub fn destroy<B, R, I>(self, compositor: &mut Compositor<B, R, I>)
    where
        B: KmsBackend,
        R: Renderer,
        I: IdleTrigger,
    {
        for surface in &self.surfaces {
            let _ = compositor.destroy_surface(surface.id);
        }
        debug!("demo client stopped after {} commits", self.commits);
    }

    fn present<B, R, I>(&mut self, compositor: &mut Compositor<B, R, I>, id: SurfaceId) -> CompositorResult<()>
    where
        B: KmsBackend,
        R: Renderer,
        I: IdleTrigger,
    {
        self.next_callback += 1;
        compositor.request_frame(id, FrameCallback(self.next_callback))?;
        compositor.commit(id)?;
        self.waiting.insert(id);
        self.commits += 1;
        Ok(())
    }
}

/// Moves `rect` by `velocity`, reflecting off the edges of `bounds`
fn bounce(rect: Rect, bounds: Rect, velocity: &mut (i32, i32)) -> (i32, i32) {
    let max_x = (bounds.right() - rect.width as i32).max(bounds.x);
    let max_y = (bounds.bottom() - rect.height as i32).max(bounds.y);

    let mut x = rect.x + velocity.0;
    let mut y = rect.y + velocity.1;
    if x < bounds.x || x > max_x {
        velocity.0 = -velocity.0;
        x = x.clamp(bounds.x, max_x);
    }
    if y < bounds.y || y > max_y {
        velocity.1 = -velocity.1;
        y = y.clamp(bounds.y, max_y);
    }
    (x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounce_reflects_at_edges() {
        let bounds = Rect::new(0, 0, 100, 100);
        let mut velocity = (10, 0);

        let (x, _) = bounce(Rect::new(85, 0, 10, 10), bounds, &mut velocity);
        assert_eq!(x, 90);
        assert_eq!(velocity.0, -10);

        let (x, _) = bounce(Rect::new(5, 0, 10, 10), bounds, &mut velocity);
        assert_eq!(x, 0);
        assert_eq!(velocity.0, 10);
    }

    #[test]
    fn test_bounce_inside_bounds_keeps_direction() {
        let mut velocity = (3, -2);
        let (x, y) = bounce(
            Rect::new(50, 50, 10, 10),
            Rect::new(0, 0, 200, 200),
            &mut velocity,
        );
        assert_eq!((x, y), (53, 48));
        assert_eq!(velocity, (3, -2));
    }
}
