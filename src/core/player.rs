//! Playback clock for one item of a playlist.
//!
//! **Architecture**: Player does NOT own the Playlist. `tick()` borrows it,
//! asks the active item what it needs and schedules loads through it.
//!
//! # Timing Model
//!
//! FPS-based: each frame lasts `1/fps` seconds. The clock advances by
//! `sampling` frames at a time and never skips a frame that is not ready:
//! if the next frame still needs a synchronous load, playback stalls on the
//! current frame until it arrives.
//!
//! # Per-tick decision (playing)
//!
//! | next frame state     | action                                          |
//! |----------------------|-------------------------------------------------|
//! | `NotNeeded`          | advance                                         |
//! | `NeededDoubleBuffer` | activate double buffer, advance, prefetch       |
//! | `Needed`             | stall, schedule a load                          |
//!
//! While paused, the current frame is loaded when it is `Needed`.

use std::time::{Duration, Instant};

use log::{debug, info, trace};

use super::event_bus::PlaybackStalledEvent;
use super::ids::ItemId;
use crate::entities::item::{LoadingState, NO_RANGE};
use crate::entities::Playlist;

/// Result of one [`Player::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do (no item, nothing to show, or not time yet)
    Idle,
    /// A load of the current frame was scheduled
    Loading { frame: i32 },
    /// The clock moved to `frame`
    Advanced { frame: i32 },
    /// Waiting for `frame`
    Stalled { frame: i32 },
    /// Reached the end of the range with looping off
    Stopped { frame: i32 },
}

#[derive(Debug)]
pub struct Player {
    item: Option<ItemId>,
    frame: i32,
    playing: bool,
    loop_enabled: bool,
    fps_override: Option<f64>,
    last_frame_time: Option<Instant>,
    stalled: bool,
}

impl Default for Player {
    fn default() -> Self {
        Self::new()
    }
}

impl Player {
    pub fn new() -> Self {
        Self {
            item: None,
            frame: 0,
            playing: false,
            loop_enabled: true,
            fps_override: None,
            last_frame_time: None,
            stalled: false,
        }
    }

    pub fn item(&self) -> Option<ItemId> {
        self.item
    }

    /// Drive `item` from the start of its range
    pub fn set_item(&mut self, item: Option<ItemId>, playlist: &Playlist) {
        self.item = item;
        self.stalled = false;
        self.last_frame_time = None;
        self.frame = item
            .and_then(|id| playlist.find(id))
            .map(|i| i.frame_range().0.max(0))
            .unwrap_or(0);
        debug!("Player: item {:?}, frame {}", self.item, self.frame);
    }

    pub fn frame(&self) -> i32 {
        self.frame
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled
    }

    pub fn set_loop_enabled(&mut self, enabled: bool) {
        self.loop_enabled = enabled;
    }

    /// Play at `fps` instead of the item's rate
    pub fn set_fps(&mut self, fps: Option<f64>) {
        self.fps_override = fps.filter(|f| *f > 0.0);
    }

    pub fn play(&mut self) {
        if !self.playing {
            info!("Player: play from {}", self.frame);
        }
        self.playing = true;
        self.last_frame_time = None;
    }

    pub fn pause(&mut self) {
        if self.playing {
            info!("Player: pause at {}", self.frame);
        }
        self.playing = false;
        self.stalled = false;
    }

    /// Jump to `frame`. Queued caching jobs become stale.
    pub fn seek(&mut self, frame: i32, playlist: &Playlist) {
        self.frame = frame;
        self.stalled = false;
        self.last_frame_time = None;
        let epoch = playlist.cancel_caching();
        debug!("Player: seek to {} (epoch {})", frame, epoch);
    }

    fn frame_duration(&self, fps: Option<f64>, default_fps: f64) -> Duration {
        let fps = self.fps_override.or(fps).filter(|f| *f > 0.0).unwrap_or(default_fps);
        Duration::from_secs_f64(1.0 / fps.max(0.001))
    }

    /// Advance the clock. Call from the main loop at display rate.
    pub fn tick(&mut self, playlist: &Playlist, now: Instant) -> TickOutcome {
        let Some(item) = self.item.and_then(|id| playlist.find(id)) else {
            return TickOutcome::Idle;
        };
        let (start, end) = item.frame_range();
        if (start, end) == NO_RANGE {
            return TickOutcome::Idle;
        }
        if self.frame < start || self.frame > end {
            self.frame = start;
        }

        if !self.playing {
            if item.needs_loading(self.frame, false) == LoadingState::Needed {
                playlist.schedule_load(&item, self.frame, false);
                return TickOutcome::Loading { frame: self.frame };
            }
            return TickOutcome::Idle;
        }

        let Some(last) = self.last_frame_time else {
            // First tick after play: make sure the current frame is there
            self.last_frame_time = Some(now);
            if item.needs_loading(self.frame, false) != LoadingState::NotNeeded {
                playlist.schedule_load(&item, self.frame, true);
            }
            return TickOutcome::Idle;
        };

        let duration = self.frame_duration(
            item.base().frame_rate(),
            playlist.env().config.default_frame_rate,
        );
        if !self.stalled && now.duration_since(last) < duration {
            return TickOutcome::Idle;
        }

        let step = item.base().sampling().max(1);
        let mut next = self.frame + step;
        if next > end {
            if !self.loop_enabled {
                self.playing = false;
                trace!("Player: reached end {}", self.frame);
                return TickOutcome::Stopped { frame: self.frame };
            }
            trace!("Player: loop {} -> {}", self.frame, start);
            next = start;
        }

        match item.needs_loading(next, false) {
            LoadingState::Needed => {
                if !self.stalled {
                    debug!("Player: stalled waiting for {}", next);
                    self.stalled = true;
                    playlist.bus().emit(PlaybackStalledEvent { root: item.id(), frame: next });
                }
                playlist.schedule_load(&item, next, true);
                TickOutcome::Stalled { frame: next }
            }
            state => {
                if state == LoadingState::NeededDoubleBuffer {
                    item.activate_double_buffer(next);
                    playlist.schedule_load(&item, next, true);
                }
                if self.stalled {
                    debug!("Player: resumed at {}", next);
                }
                self.stalled = false;
                self.frame = next;
                self.last_frame_time = Some(now);
                TickOutcome::Advanced { frame: next }
            }
        }
    }
}
