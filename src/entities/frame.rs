//! Decoded frames with multi-format pixel buffers (U8, F32)
//!
//! - `PixelBuffer::U8`: RGBA 8-bit, what frame sources deliver
//! - `PixelBuffer::F32`: RGBA float, signed values produced by the difference
//!
//! A `Frame` is immutable once built and cheap to clone (shared buffer), so a
//! frame handed to the cache or a buffer slot is always complete.

use std::sync::Arc;

use thiserror::Error;

use super::geometry::{Point, Size};
use super::values::ValuePair;

/// Pixel buffer format
#[derive(Debug, Clone)]
pub enum PixelBuffer {
    U8(Vec<u8>),   // 8-bit per channel RGBA
    F32(Vec<f32>), // float per channel RGBA, may be negative
}

/// Pixel format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    RgbaF32,
}

#[derive(Debug)]
struct FrameData {
    buffer: PixelBuffer,
    width: usize,
    height: usize,
}

/// Single decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    data: Arc<FrameData>,
}

/// Frame loading errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(String),
    #[error("Glob error: {0}")]
    Glob(String),
    #[error("Frame {idx} outside source range {start}..={end}")]
    OutOfRange { idx: i32, start: i32, end: i32 },
    #[error("Size mismatch: expected {expected:?}, got {actual:?}")]
    SizeMismatch { expected: Size, actual: Size },
    #[error("Source error: {0}")]
    Source(String),
}

impl Frame {
    /// Build an RGBA8 frame. Buffer length must be `width * height * 4`.
    pub fn from_u8_buffer(buffer: Vec<u8>, width: usize, height: usize) -> Self {
        assert_eq!(buffer.len(), width * height * 4, "RGBA8 buffer size mismatch");
        Self {
            data: Arc::new(FrameData {
                buffer: PixelBuffer::U8(buffer),
                width,
                height,
            }),
        }
    }

    /// Build an RGBA float frame. Buffer length must be `width * height * 4`.
    pub fn from_f32_buffer(buffer: Vec<f32>, width: usize, height: usize) -> Self {
        assert_eq!(buffer.len(), width * height * 4, "RGBA f32 buffer size mismatch");
        Self {
            data: Arc::new(FrameData {
                buffer: PixelBuffer::F32(buffer),
                width,
                height,
            }),
        }
    }

    /// Solid colour frame
    pub fn solid(width: usize, height: usize, rgba: [u8; 4]) -> Self {
        let mut buf = vec![0u8; width * height * 4];
        for px in buf.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
        Self::from_u8_buffer(buf, width, height)
    }

    /// Memory size in bytes
    pub fn mem(&self) -> usize {
        match &self.data.buffer {
            PixelBuffer::U8(vec) => vec.len(),
            PixelBuffer::F32(vec) => vec.len() * 4,
        }
    }

    pub fn pixel_format(&self) -> PixelFormat {
        match &self.data.buffer {
            PixelBuffer::U8(_) => PixelFormat::Rgba8,
            PixelBuffer::F32(_) => PixelFormat::RgbaF32,
        }
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.data.buffer
    }

    pub fn width(&self) -> usize {
        self.data.width
    }

    pub fn height(&self) -> usize {
        self.data.height
    }

    pub fn size(&self) -> Size {
        Size::new(self.data.width as i32, self.data.height as i32)
    }

    /// RGBA at (x, y) as floats, None outside the frame
    pub fn pixel(&self, pos: Point) -> Option<[f32; 4]> {
        if pos.x < 0 || pos.y < 0 {
            return None;
        }
        let (x, y) = (pos.x as usize, pos.y as usize);
        if x >= self.data.width || y >= self.data.height {
            return None;
        }
        let i = (y * self.data.width + x) * 4;
        Some(match &self.data.buffer {
            PixelBuffer::U8(v) => [v[i] as f32, v[i + 1] as f32, v[i + 2] as f32, v[i + 3] as f32],
            PixelBuffer::F32(v) => [v[i], v[i + 1], v[i + 2], v[i + 3]],
        })
    }

    /// Labeled R/G/B values at a position (empty outside the frame)
    pub fn pixel_values(&self, pos: Point) -> Vec<ValuePair> {
        let Some(px) = self.pixel(pos) else {
            return Vec::new();
        };
        ["R", "G", "B"]
            .iter()
            .zip(px.iter())
            .map(|(name, v)| ValuePair::new(*name, format_value(*v)))
            .collect()
    }

    /// Convert to display RGBA8. Float values are shown as |v| clamped to 0..255.
    pub fn to_rgba8(&self) -> Vec<u8> {
        match &self.data.buffer {
            PixelBuffer::U8(v) => v.clone(),
            PixelBuffer::F32(v) => v
                .chunks_exact(4)
                .flat_map(|px| {
                    [
                        px[0].abs().min(255.0) as u8,
                        px[1].abs().min(255.0) as u8,
                        px[2].abs().min(255.0) as u8,
                        255,
                    ]
                })
                .collect(),
        }
    }
}

fn format_value(v: f32) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{:.3}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_mem() {
        let f = Frame::solid(8, 4, [1, 2, 3, 255]);
        assert_eq!(f.mem(), 8 * 4 * 4);
        assert_eq!(f.pixel_format(), PixelFormat::Rgba8);

        let d = Frame::from_f32_buffer(vec![0.0; 8 * 4 * 4], 8, 4);
        assert_eq!(d.mem(), 8 * 4 * 4 * 4);
        assert_eq!(d.pixel_format(), PixelFormat::RgbaF32);
    }

    #[test]
    fn test_pixel_access() {
        let f = Frame::solid(2, 2, [10, 20, 30, 255]);
        assert_eq!(f.pixel(Point::new(1, 1)), Some([10.0, 20.0, 30.0, 255.0]));
        assert_eq!(f.pixel(Point::new(2, 0)), None);
        assert_eq!(f.pixel(Point::new(-1, 0)), None);

        let values = f.pixel_values(Point::new(0, 0));
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].name, "R");
        assert_eq!(values[0].value, "10");
    }

    #[test]
    fn test_float_display_conversion() {
        let d = Frame::from_f32_buffer(vec![-12.0, 300.0, 0.5, 0.0], 1, 1);
        assert_eq!(d.to_rgba8(), vec![12, 255, 0, 255]);
        assert_eq!(d.pixel_values(Point::new(0, 0))[0].value, "-12");
    }

    #[test]
    #[should_panic]
    fn test_bad_buffer_size_panics() {
        let _ = Frame::from_u8_buffer(vec![0; 3], 1, 1);
    }
}
