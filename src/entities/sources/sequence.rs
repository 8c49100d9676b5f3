//! Image sequence source.
//!
//! The mask is either a single file or a path with `*` standing for the frame
//! number (`/shots/a.*.png`). Frame numbers come from the trailing digits of
//! each matched file stem. Change detection compares the file list and mtimes
//! against the snapshot taken at open/reload time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use log::{debug, info};

use crate::entities::frame::{Frame, FrameError};
use crate::entities::geometry::Size;
use crate::entities::source::{FrameSource, SourceSpec};

/// (path, mtime) for every matched file, sorted by path
type Fingerprint = Vec<(PathBuf, Option<SystemTime>)>;

#[derive(Debug)]
struct SeqState {
    files: BTreeMap<i32, PathBuf>,
    size: Size,
    fingerprint: Fingerprint,
    /// Last fingerprint reported through `is_changed`
    reported: Option<Fingerprint>,
}

#[derive(Debug)]
pub struct SequenceSource {
    mask: String,
    fps: Option<f64>,
    state: Mutex<SeqState>,
}

impl SequenceSource {
    pub fn open(mask: &str, fps: Option<f64>) -> Result<Self, FrameError> {
        let state = scan(mask)?;
        info!(
            "Opened sequence {}: {} frames, {}x{}",
            mask,
            state.files.len(),
            state.size.width,
            state.size.height
        );
        Ok(Self {
            mask: mask.to_string(),
            fps,
            state: Mutex::new(state),
        })
    }

    pub fn mask(&self) -> &str {
        &self.mask
    }
}

fn is_sequence_mask(mask: &str) -> bool {
    mask.contains('*')
}

/// Expand a glob pattern into a sorted list of paths
fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>, FrameError> {
    let pattern = pattern.replace('\\', "/");
    let options = glob::MatchOptions {
        case_sensitive: false,
        ..Default::default()
    };

    let mut paths = Vec::new();
    for entry in glob::glob_with(&pattern, options)
        .map_err(|e| FrameError::Glob(format!("{}: {}", pattern, e)))?
    {
        let path = entry.map_err(|e| FrameError::Glob(e.to_string()))?;
        paths.push(path);
    }
    paths.sort();
    debug!("glob {}: {} files", pattern, paths.len());
    Ok(paths)
}

/// Trailing frame number of a file stem ("a.0012.png" -> 12)
fn frame_number(path: &Path) -> Option<i32> {
    let stem = path.file_stem()?.to_str()?;
    let digits = stem
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    stem[digits..].parse().ok()
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn fingerprint(paths: &[PathBuf]) -> Fingerprint {
    paths.iter().map(|p| (p.clone(), mtime(p))).collect()
}

fn list_files(mask: &str) -> Result<Vec<PathBuf>, FrameError> {
    if is_sequence_mask(mask) {
        glob_paths(mask)
    } else {
        let p = PathBuf::from(mask);
        if p.is_file() { Ok(vec![p]) } else { Ok(Vec::new()) }
    }
}

fn scan(mask: &str) -> Result<SeqState, FrameError> {
    let paths = list_files(mask)?;
    if paths.is_empty() {
        return Err(FrameError::Source(format!("No files matched {}", mask)));
    }

    let mut files = BTreeMap::new();
    if is_sequence_mask(mask) {
        for p in &paths {
            if let Some(n) = frame_number(p) {
                files.entry(n).or_insert_with(|| p.clone());
            }
        }
        if files.is_empty() {
            return Err(FrameError::Source(format!("No numbered frames in {}", mask)));
        }
    } else {
        files.insert(0, paths[0].clone());
    }

    let first = files
        .values()
        .next()
        .ok_or_else(|| FrameError::Source(format!("No files matched {}", mask)))?;
    let (w, h) = image::image_dimensions(first).map_err(|e| FrameError::Image(e.to_string()))?;

    Ok(SeqState {
        files,
        size: Size::new(w as i32, h as i32),
        fingerprint: fingerprint(&paths),
        reported: None,
    })
}

impl FrameSource for SequenceSource {
    fn spec(&self) -> SourceSpec {
        SourceSpec::Sequence {
            mask: self.mask.clone(),
            fps: self.fps,
        }
    }

    fn describe(&self) -> String {
        if is_sequence_mask(&self.mask) {
            format!("Image sequence {}", self.mask)
        } else {
            format!("Image {}", self.mask)
        }
    }

    fn frame_size(&self) -> Size {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).size
    }

    fn frame_range(&self) -> (i32, i32) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match (state.files.keys().next(), state.files.keys().next_back()) {
            (Some(a), Some(b)) => (*a, *b),
            _ => (-1, -1),
        }
    }

    fn frame_rate(&self) -> Option<f64> {
        self.fps
    }

    fn read_frame(&self, idx: i32) -> Result<Frame, FrameError> {
        let (path, expected) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let path = state.files.get(&idx).cloned();
            let range = match (state.files.keys().next(), state.files.keys().next_back()) {
                (Some(a), Some(b)) => (*a, *b),
                _ => (-1, -1),
            };
            match path {
                Some(p) => (p, state.size),
                None => {
                    return Err(FrameError::OutOfRange {
                        idx,
                        start: range.0,
                        end: range.1,
                    });
                }
            }
        };

        debug!("Loading image: {}", path.display());
        let img = image::open(&path).map_err(|e| FrameError::Image(e.to_string()))?;
        let rgba = img.to_rgba8();
        let actual = Size::new(rgba.width() as i32, rgba.height() as i32);
        if actual != expected {
            return Err(FrameError::SizeMismatch { expected, actual });
        }
        let (w, h) = (rgba.width() as usize, rgba.height() as usize);
        Ok(Frame::from_u8_buffer(rgba.into_raw(), w, h))
    }

    fn is_changed(&self) -> bool {
        let Ok(paths) = list_files(&self.mask) else {
            return false;
        };
        let current = fingerprint(&paths);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if current == state.fingerprint || state.reported.as_ref() == Some(&current) {
            return false;
        }
        info!("Source changed on disk: {}", self.mask);
        state.reported = Some(current);
        true
    }

    fn reload(&self) -> Result<(), FrameError> {
        let fresh = scan(&self.mask)?;
        info!("Reloaded sequence {}: {} frames", self.mask, fresh.files.len());
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(())
    }
}
