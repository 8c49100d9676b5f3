//! Drawing surface abstraction.
//!
//! Items draw relative to the painter's current origin: a frame is drawn
//! centred on the origin, containers move the origin with `translate` and undo
//! it afterwards. Two implementations:
//! - [`RecordingPainter`]: records operations, used by tests and `probe`
//! - [`CanvasPainter`]: CPU rasteriser into an `image::RgbaImage`

use std::path::Path;

use image::{Rgba, RgbaImage};
use log::{debug, trace};

use super::frame::Frame;
use super::geometry::{Point, Rect, Size};

/// Minimal painter interface used by items.
pub trait Painter {
    /// Move the origin by `offset`
    fn translate(&mut self, offset: Point);

    /// Current origin in surface coordinates
    fn origin(&self) -> Point;

    /// Draw `frame` centred on the origin, scaled by `zoom`
    fn draw_frame(&mut self, frame: &Frame, zoom: f64);

    /// Draw a text placeholder centred on the origin
    fn draw_text(&mut self, text: &str, zoom: f64);
}

/// One recorded painter call, in surface coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum PaintOp {
    Frame { center: Point, size: Size, zoom: f64 },
    Text { center: Point, text: String },
}

/// Painter that only records what was drawn.
#[derive(Debug, Default)]
pub struct RecordingPainter {
    origin: Point,
    pub ops: Vec<PaintOp>,
}

impl RecordingPainter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<(Point, Size)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                PaintOp::Frame { center, size, .. } => Some((*center, *size)),
                _ => None,
            })
            .collect()
    }

    pub fn texts(&self) -> Vec<&str> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                PaintOp::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Painter for RecordingPainter {
    fn translate(&mut self, offset: Point) {
        self.origin += offset;
    }

    fn origin(&self) -> Point {
        self.origin
    }

    fn draw_frame(&mut self, frame: &Frame, zoom: f64) {
        self.ops.push(PaintOp::Frame {
            center: self.origin,
            size: frame.size(),
            zoom,
        });
    }

    fn draw_text(&mut self, text: &str, _zoom: f64) {
        self.ops.push(PaintOp::Text {
            center: self.origin,
            text: text.to_string(),
        });
    }
}

/// Raster painter. The surface origin starts at the canvas centre.
pub struct CanvasPainter {
    canvas: RgbaImage,
    origin: Point,
    texts: Vec<String>,
}

const TEXT_BOX: Rgba<u8> = Rgba([48, 48, 48, 255]);
const TEXT_BORDER: Rgba<u8> = Rgba([200, 200, 200, 255]);

impl CanvasPainter {
    pub fn new(width: u32, height: u32, background: [u8; 4]) -> Self {
        let canvas = RgbaImage::from_pixel(width, height, Rgba(background));
        Self {
            canvas,
            origin: Point::new(width as i32 / 2, height as i32 / 2),
            texts: Vec::new(),
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.canvas
    }

    pub fn into_image(self) -> RgbaImage {
        self.canvas
    }

    /// Texts drawn so far (the canvas only shows a box for them)
    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    pub fn save_png(&self, path: &Path) -> anyhow::Result<()> {
        self.canvas.save_with_format(path, image::ImageFormat::Png)?;
        debug!("Canvas saved to {}", path.display());
        Ok(())
    }

    fn canvas_rect(&self) -> Rect {
        Rect::new(0, 0, self.canvas.width() as i32, self.canvas.height() as i32)
    }

    fn fill_rect(&mut self, rect: Rect, color: Rgba<u8>) {
        let bounds = self.canvas_rect();
        for y in rect.top().max(0)..rect.bottom().min(bounds.bottom()) {
            for x in rect.left().max(0)..rect.right().min(bounds.right()) {
                self.canvas.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}

impl Painter for CanvasPainter {
    fn translate(&mut self, offset: Point) {
        self.origin += offset;
    }

    fn origin(&self) -> Point {
        self.origin
    }

    fn draw_frame(&mut self, frame: &Frame, zoom: f64) {
        let zoom = if zoom > 0.0 { zoom } else { 1.0 };
        let src = frame.to_rgba8();
        let (fw, fh) = (frame.width(), frame.height());
        let dst_size = Size::new(
            (fw as f64 * zoom).round() as i32,
            (fh as f64 * zoom).round() as i32,
        );
        let dst = Rect::centered(dst_size, self.origin);
        let bounds = self.canvas_rect();
        trace!("draw_frame {:?} at {:?}", dst_size, dst.top_left());

        // Nearest neighbour
        for y in dst.top().max(0)..dst.bottom().min(bounds.bottom()) {
            let sy = (((y - dst.top()) as f64 / zoom) as usize).min(fh.saturating_sub(1));
            for x in dst.left().max(0)..dst.right().min(bounds.right()) {
                let sx = (((x - dst.left()) as f64 / zoom) as usize).min(fw.saturating_sub(1));
                let i = (sy * fw + sx) * 4;
                let px = Rgba([src[i], src[i + 1], src[i + 2], src[i + 3]]);
                self.canvas.put_pixel(x as u32, y as u32, px);
            }
        }
    }

    fn draw_text(&mut self, text: &str, zoom: f64) {
        let zoom = if zoom > 0.0 { zoom } else { 1.0 };
        // No font rasteriser: a framed box sized from the text length
        let w = ((text.chars().count().max(1) * 8) as f64 * zoom) as i32;
        let h = (16.0 * zoom) as i32;
        let outer = Rect::centered(Size::new(w + 4, h + 4), self.origin);
        let inner = Rect::centered(Size::new(w, h), self.origin);
        self.fill_rect(outer, TEXT_BORDER);
        self.fill_rect(inner, TEXT_BOX);
        self.texts.push(text.to_string());
    }
}
