//! Damage tracking for efficient scanout rendering
//!
//! This module provides the rectangle and region primitives behind the
//! damage accumulator: surfaces collect client damage into a [`Region`],
//! commits fold it into every intersecting output's region, and each render
//! pass asks the output region for a bounded list of boxes to redraw.
//!
//! # Overview
//!
//! A [`Region`] is a set of non-overlapping rectangles. Adding a rectangle
//! only inserts the parts not already covered, so the region never counts a
//! pixel twice. When a region fragments into more than
//! [`MAX_REGION_RECTS`] pieces it collapses to its bounding box.
//!
//! [`Region::merge_for_render`] hands the renderer at most
//! [`MAX_RENDER_BOXES`] boxes. If the region has more pieces than that, it
//! returns exactly one box equal to the region's extents, trading some
//! over-redraw for a constant-size damage list.
//!
//! # Example
//!
//! ```
//! use kms_compositor::renderer::damage::{Rect, Region};
//!
//! let mut region = Region::new();
//! region.union_rect(Rect::new(10, 10, 50, 50));
//! region.union_rect(Rect::new(30, 30, 50, 50));
//!
//! let boxes = region.merge_for_render(4);
//! assert!(boxes.len() <= 4);
//! assert_eq!(region.extents(), Some(Rect::new(10, 10, 70, 70)));
//! ```

/// Maximum number of boxes handed to the renderer per pass
pub const MAX_RENDER_BOXES: usize = 4;

/// Number of pieces after which a region collapses to its extents
pub const MAX_REGION_RECTS: usize = 64;

/// Represents an axis-aligned rectangle in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    /// X coordinate (pixels)
    pub x: i32,
    /// Y coordinate (pixels)
    pub y: i32,
    /// Width (pixels)
    pub width: u32,
    /// Height (pixels)
    pub height: u32,
}

impl Rect {
    /// Creates a new rectangle
    ///
    /// # Example
    ///
    /// ```
    /// use kms_compositor::renderer::damage::Rect;
    ///
    /// let rect = Rect::new(100, 100, 200, 150);
    /// assert_eq!(rect.area(), 30000);
    /// ```
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Creates a rectangle from two corners
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        let x = x1.min(x2);
        let y = y1.min(y2);
        let width = (x1.max(x2) - x) as u32;
        let height = (y1.max(y2) - y) as u32;

        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Exclusive right edge
    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    /// Returns the area of this rectangle in pixels
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// A rectangle with zero width or height covers nothing
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Checks if this rectangle shares any pixel with another
    pub fn intersects(&self, other: &Rect) -> bool {
        !(self.is_empty()
            || other.is_empty()
            || self.right() <= other.x
            || other.right() <= self.x
            || self.bottom() <= other.y
            || other.bottom() <= self.y)
    }

    /// Smallest rectangle containing both
    pub fn bounding(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::from_corners(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Computes the intersection of two rectangles
    ///
    /// Returns `None` if they don't share any pixel.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        if !self.intersects(other) {
            return None;
        }

        Some(Rect::from_corners(
            self.x.max(other.x),
            self.y.max(other.y),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        ))
    }

    /// Translates this rectangle by an offset
    ///
    /// Used to move surface-local damage to the global space (surface
    /// position) and global damage to output-local space (negated output
    /// position).
    pub fn to_screen_coords(&self, dx: i32, dy: i32) -> Rect {
        Rect {
            x: self.x + dx,
            y: self.y + dy,
            width: self.width,
            height: self.height,
        }
    }

    /// Checks if this rectangle contains a point
    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Checks if this rectangle completely contains another
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Removes `other` from this rectangle
    ///
    /// Returns up to four non-overlapping pieces: full-width bands above and
    /// below the overlap, then the left and right remainders beside it.
    pub fn subtract(&self, other: &Rect) -> Vec<Rect> {
        let Some(overlap) = self.intersection(other) else {
            return vec![*self];
        };

        let mut pieces = Vec::with_capacity(4);
        if overlap.y > self.y {
            pieces.push(Rect::new(
                self.x,
                self.y,
                self.width,
                (overlap.y - self.y) as u32,
            ));
        }
        if overlap.bottom() < self.bottom() {
            pieces.push(Rect::new(
                self.x,
                overlap.bottom(),
                self.width,
                (self.bottom() - overlap.bottom()) as u32,
            ));
        }
        if overlap.x > self.x {
            pieces.push(Rect::new(
                self.x,
                overlap.y,
                (overlap.x - self.x) as u32,
                overlap.height,
            ));
        }
        if overlap.right() < self.right() {
            pieces.push(Rect::new(
                overlap.right(),
                overlap.y,
                (self.right() - overlap.right()) as u32,
                overlap.height,
            ));
        }
        pieces
    }
}

/// A set of pixels stored as non-overlapping rectangles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    /// Creates an empty region
    pub fn new() -> Self {
        Self { rects: Vec::new() }
    }

    /// Creates a region covering a single rectangle
    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Self::new();
        region.union_rect(rect);
        region
    }

    /// Whether the region covers nothing
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Removes everything from the region
    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// The non-overlapping rectangles making up this region
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Adds a rectangle to the region
    ///
    /// Only the parts of `rect` not already covered are stored.
    pub fn union_rect(&mut self, rect: Rect) {
        if rect.is_empty() || self.rects.iter().any(|r| r.contains_rect(&rect)) {
            return;
        }

        // Anything the new rectangle swallows is redundant
        self.rects.retain(|r| !rect.contains_rect(r));

        let mut pieces = vec![rect];
        for existing in &self.rects {
            pieces = pieces
                .iter()
                .flat_map(|piece| piece.subtract(existing))
                .collect();
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);

        if self.rects.len() > MAX_REGION_RECTS {
            self.collapse();
        }
    }

    /// Adds every rectangle of another region
    pub fn union(&mut self, other: &Region) {
        for rect in &other.rects {
            self.union_rect(*rect);
        }
    }

    /// Bounding box of the whole region
    pub fn extents(&self) -> Option<Rect> {
        let mut iter = self.rects.iter();
        let first = *iter.next()?;
        Some(iter.fold(first, |acc, r| acc.bounding(r)))
    }

    /// Replaces the region by its bounding box
    pub fn collapse(&mut self) {
        if let Some(extents) = self.extents() {
            self.rects.clear();
            self.rects.push(extents);
        }
    }

    /// Total number of covered pixels
    pub fn area(&self) -> u64 {
        self.rects.iter().map(Rect::area).sum()
    }

    /// Checks if any rectangle of the region contains the point
    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.rects.iter().any(|r| r.contains_point(x, y))
    }

    /// Whether the region overlaps the rectangle
    pub fn intersects(&self, rect: &Rect) -> bool {
        self.rects.iter().any(|r| r.intersects(rect))
    }

    /// Moves every rectangle by an offset
    pub fn translate(&mut self, dx: i32, dy: i32) {
        for rect in &mut self.rects {
            *rect = rect.to_screen_coords(dx, dy);
        }
    }

    /// The part of this region inside `clip`
    pub fn intersect_rect(&self, clip: &Rect) -> Region {
        Region {
            rects: self
                .rects
                .iter()
                .filter_map(|r| r.intersection(clip))
                .collect(),
        }
    }

    /// Returns the boxes the renderer should redraw
    ///
    /// At most `max_boxes` (itself capped at [`MAX_RENDER_BOXES`]) boxes are
    /// returned. When the region has more pieces than that, the result is a
    /// single box equal to the region's extents.
    pub fn merge_for_render(&self, max_boxes: usize) -> Vec<Rect> {
        let budget = max_boxes.clamp(1, MAX_RENDER_BOXES);
        if self.rects.len() <= budget {
            return self.rects.clone();
        }
        self.extents().into_iter().collect()
    }
}
