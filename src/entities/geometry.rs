//! Integer 2D geometry for layout and pixel probing.
//!
//! `Point` is a `glam::IVec2`. `Rect` uses half-open edges: `left..right`,
//! `top..bottom` with `right = x + width`. Y grows downwards (screen space).

use serde::{Deserialize, Serialize};

pub type Point = glam::IVec2;

/// Width/height pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

impl Size {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Component-wise minimum
    pub fn min(self, other: Size) -> Size {
        Size::new(self.width.min(other.width), self.height.min(other.height))
    }
}

/// Axis-aligned rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle of `size` whose center is `center`
    pub fn centered(size: Size, center: Point) -> Self {
        let mut r = Self::new(0, 0, size.width, size.height);
        r.move_center(center);
        r
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn left(&self) -> i32 {
        self.x
    }

    pub fn top(&self) -> i32 {
        self.y
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn top_left(&self) -> Point {
        Point::new(self.x, self.y)
    }

    /// Center, rounded towards the top-left for odd sizes
    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2, self.y + self.height / 2)
    }

    pub fn move_center(&mut self, c: Point) {
        self.x = c.x - self.width / 2;
        self.y = c.y - self.height / 2;
    }

    pub fn move_left(&mut self, left: i32) {
        self.x = left;
    }

    pub fn move_right(&mut self, right: i32) {
        self.x = right - self.width;
    }

    pub fn move_top(&mut self, top: i32) {
        self.y = top;
    }

    pub fn move_bottom(&mut self, bottom: i32) {
        self.y = bottom - self.height;
    }

    pub fn translate(&mut self, offset: Point) {
        self.x += offset.x;
        self.y += offset.y;
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.left() && p.x < self.right() && p.y >= self.top() && p.y < self.bottom()
    }

    /// Smallest rectangle covering both. Empty rectangles are ignored.
    pub fn united(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let left = self.left().min(other.left());
        let top = self.top().min(other.top());
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(left, top, right - left, bottom - top)
    }
}
