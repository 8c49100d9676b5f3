//! Synthetic test pattern.
//!
//! Deterministic per `(x, y, frame, seed)` so two sources with the same seed
//! produce identical frames and a difference of them is zero everywhere.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use log::trace;
use rayon::prelude::*;

use crate::entities::frame::{Frame, FrameError};
use crate::entities::geometry::Size;
use crate::entities::source::{FrameSource, SourceSpec};

#[derive(Debug)]
pub struct PatternSource {
    size: Size,
    frames: i32,
    seed: u32,
    fps: Option<f64>,
    /// Bumped by `touch()`, mixed into the pattern so a reload shows new data
    generation: AtomicU32,
    changed: AtomicBool,
    /// Every read fails while set
    failing: AtomicBool,
    reads: AtomicUsize,
}

impl PatternSource {
    pub fn new(size: Size, frames: i32, seed: u32) -> Self {
        Self {
            size,
            frames: frames.max(0),
            seed,
            fps: None,
            generation: AtomicU32::new(0),
            changed: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    /// Simulate the backing data changing on disk
    pub fn touch(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
        self.changed.store(true, Ordering::Release);
    }

    /// Simulate unreadable data: reads fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Number of `read_frame` calls served so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Expected RGBA at a pixel, without building a frame
    pub fn sample(&self, x: i32, y: i32, frame: i32) -> [u8; 4] {
        let g = self.generation.load(Ordering::Relaxed);
        pattern_pixel(x, y, frame, self.seed.wrapping_add(g.wrapping_mul(31)))
    }
}

fn pattern_pixel(x: i32, y: i32, frame: i32, seed: u32) -> [u8; 4] {
    let s = seed as i32;
    [
        (x + frame * 3 + s).rem_euclid(256) as u8,
        (y + frame * 5 + s * 7).rem_euclid(256) as u8,
        ((x ^ y) + frame + s * 13).rem_euclid(256) as u8,
        255,
    ]
}

impl FrameSource for PatternSource {
    fn spec(&self) -> SourceSpec {
        SourceSpec::Pattern {
            width: self.size.width,
            height: self.size.height,
            frames: self.frames,
            seed: self.seed,
            fps: self.fps,
        }
    }

    fn describe(&self) -> String {
        format!("Pattern (seed {})", self.seed)
    }

    fn frame_size(&self) -> Size {
        self.size
    }

    fn frame_range(&self) -> (i32, i32) {
        if self.frames == 0 { (-1, -1) } else { (0, self.frames - 1) }
    }

    fn frame_rate(&self) -> Option<f64> {
        self.fps
    }

    fn read_frame(&self, idx: i32) -> Result<Frame, FrameError> {
        if idx < 0 || idx >= self.frames {
            return Err(FrameError::OutOfRange {
                idx,
                start: 0,
                end: self.frames - 1,
            });
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(FrameError::Source(format!("pattern {} unreadable", self.seed)));
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        trace!("PatternSource read frame {}", idx);

        let w = self.size.width.max(0) as usize;
        let h = self.size.height.max(0) as usize;
        let seed = self
            .seed
            .wrapping_add(self.generation.load(Ordering::Relaxed).wrapping_mul(31));
        let mut buf = vec![0u8; w * h * 4];
        if w > 0 {
            buf.par_chunks_mut(w * 4).enumerate().for_each(|(y, row)| {
                for (x, px) in row.chunks_exact_mut(4).enumerate() {
                    px.copy_from_slice(&pattern_pixel(x as i32, y as i32, idx, seed));
                }
            });
        }
        Ok(Frame::from_u8_buffer(buf, w, h))
    }

    fn is_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }

    fn reload(&self) -> Result<(), FrameError> {
        self.changed.store(false, Ordering::Release);
        Ok(())
    }
}
