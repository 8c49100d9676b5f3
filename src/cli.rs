use clap::{Parser, Subcommand};
use std::path::PathBuf;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Headless driver for playlists of video, difference and overlay items
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Log to file instead of stderr (default: playtree.log in the config dir)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE", global = true)]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbosity: u8,

    /// Engine configuration file (JSON)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the item tree with per-item info
    Info {
        #[arg(value_name = "PLAYLIST")]
        playlist: PathBuf,
    },

    /// Draw one frame of a root item into a PNG
    Render {
        #[arg(value_name = "PLAYLIST")]
        playlist: PathBuf,

        /// Frame index
        #[arg(short = 'f', long = "frame", default_value_t = 0)]
        frame: i32,

        /// Output image
        #[arg(short = 'o', long = "out", value_name = "PNG")]
        out: PathBuf,

        /// Root item index (default: selected item, else the first)
        #[arg(short = 'i', long = "item")]
        item: Option<usize>,

        /// Zoom factor
        #[arg(short = 'z', long = "zoom", default_value_t = 1.0)]
        zoom: f64,
    },

    /// Print the pixel values under a point
    Probe {
        #[arg(value_name = "PLAYLIST")]
        playlist: PathBuf,

        #[arg(short = 'f', long = "frame", default_value_t = 0)]
        frame: i32,

        #[arg(short = 'x', long = "x")]
        x: i32,

        #[arg(short = 'y', long = "y")]
        y: i32,

        /// Root item index (default: selected item, else the first)
        #[arg(short = 'i', long = "item")]
        item: Option<usize>,
    },

    /// Play headless through the worker pool and report stalls
    Play {
        #[arg(value_name = "PLAYLIST")]
        playlist: PathBuf,

        /// Number of frames to advance before stopping
        #[arg(short = 'n', long = "frames", default_value_t = 100)]
        frames: usize,

        /// Playback rate override
        #[arg(long = "fps")]
        fps: Option<f64>,

        /// Root item index (default: selected item, else the first)
        #[arg(short = 'i', long = "item")]
        item: Option<usize>,
    },

    /// Write a playlist of test patterns with a difference and an overlay
    Demo {
        #[arg(short = 'o', long = "out", value_name = "PLAYLIST")]
        out: PathBuf,
    },
}
