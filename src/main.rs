use playtree::cli::{Args, Command};
use playtree::config::{self, EngineConfig};
use playtree::core::event_bus::PlaybackStalledEvent;
use playtree::core::player::{Player, TickOutcome};
use playtree::entities::geometry::{Point, Size};
use playtree::entities::overlay::{Alignment, OverlayItem};
use playtree::entities::persist;
use playtree::entities::sources::PatternSource;
use playtree::entities::{
    CanvasPainter, DifferenceItem, Item, LoadingState, Playlist, TextItem, VideoItem,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn init_logging(args: &Args) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::config_dir().join("playtree.log"));
        if let Some(dir) = log_path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn open_playlist(path: &Path, config: EngineConfig) -> Result<Playlist> {
    let mut playlist = Playlist::new(config);
    persist::load(path, &mut playlist)?;
    playlist.process_events();
    Ok(playlist)
}

/// Root at `index`, else the selected item, else the first root
fn pick_item(playlist: &Playlist, index: Option<usize>) -> Result<Arc<dyn Item>> {
    if let Some(i) = index {
        return match playlist.roots().get(i) {
            Some(item) => Ok(Arc::clone(item)),
            None => bail!("No root item {} (playlist has {})", i, playlist.roots().len()),
        };
    }
    if let Some(item) = playlist.selected() {
        return Ok(item);
    }
    match playlist.roots().first() {
        Some(item) => Ok(Arc::clone(item)),
        None => bail!("Playlist is empty"),
    }
}

/// Load `frame` synchronously, giving failed reads their retries
fn load_blocking(playlist: &Playlist, item: &Arc<dyn Item>, frame: i32) {
    let attempts = playlist.env().config.max_load_attempts.max(1);
    for _ in 0..attempts {
        if item.needs_loading(frame, true) != LoadingState::Needed {
            break;
        }
        item.load_frame(frame, false, true);
        playlist.process_events();
    }
}

fn print_tree(item: &Arc<dyn Item>, depth: usize) {
    let pad = "  ".repeat(depth);
    let (start, end) = item.frame_range();
    let size = item.size();
    println!(
        "{}{} {} \"{}\"  {}x{}  frames {}..{}",
        pad,
        item.kind().as_str(),
        item.id(),
        item.name(),
        size.width,
        size.height,
        start,
        end
    );
    let info = item.info();
    for (k, v) in &info.items {
        println!("{}    {}: {}", pad, k, v);
    }
    for child in item.children() {
        print_tree(&child, depth + 1);
    }
}

fn cmd_info(playlist: &Playlist) {
    for root in playlist.roots() {
        print_tree(root, 0);
    }
    let (usage, limit) = playlist.env().cache.manager().mem();
    println!("Cache: {} / {} MB", usage / 1024 / 1024, limit / 1024 / 1024);
}

fn cmd_render(playlist: &Playlist, item: &Arc<dyn Item>, frame: i32, zoom: f64, out: &Path) -> Result<()> {
    if zoom <= 0.0 {
        bail!("Zoom must be positive, got {}", zoom);
    }
    load_blocking(playlist, item, frame);

    let size = item.size();
    let w = ((size.width as f64 * zoom).round() as u32).max(1);
    let h = ((size.height as f64 * zoom).round() as u32).max(1);
    let mut painter = CanvasPainter::new(w, h, [0, 0, 0, 255]);
    item.draw(&mut painter, frame, zoom, false);
    for text in painter.texts() {
        warn!("{:?}: {}", item, text);
    }
    painter.save_png(out)?;
    println!("Wrote {} ({}x{})", out.display(), w, h);
    Ok(())
}

fn cmd_probe(playlist: &Playlist, item: &Arc<dyn Item>, frame: i32, x: i32, y: i32) {
    load_blocking(playlist, item, frame);
    let sets = item.pixel_values(Point::new(x, y), frame);
    if sets.is_empty() {
        println!("No values at ({}, {}) in frame {}", x, y, frame);
    }
    for (title, values) in sets.iter() {
        println!("{}:", title);
        for v in values {
            println!("  {} = {}", v.name, v.value);
        }
    }
}

fn cmd_play(playlist: &Playlist, item: &Arc<dyn Item>, frames: usize, fps: Option<f64>) -> Result<()> {
    let stalls = Arc::new(AtomicUsize::new(0));
    {
        let stalls = Arc::clone(&stalls);
        playlist.bus().subscribe::<PlaybackStalledEvent, _>(move |e| {
            debug!("Stalled on frame {}", e.frame);
            stalls.fetch_add(1, Ordering::Relaxed);
        });
    }

    let mut player = Player::new();
    player.set_item(Some(item.id()), playlist);
    player.set_fps(fps);
    player.play();
    playlist.update_caching(player.frame());

    let started = Instant::now();
    let timeout = Duration::from_secs(60).max(Duration::from_secs_f64(frames as f64));
    let mut advanced = 0;
    while advanced < frames {
        if started.elapsed() > timeout {
            bail!("Playback timed out after {} of {} frames", advanced, frames);
        }
        playlist.process_events();
        match player.tick(playlist, Instant::now()) {
            TickOutcome::Advanced { frame } => {
                advanced += 1;
                playlist.update_caching(frame);
            }
            TickOutcome::Stopped { frame } => {
                info!("Stopped at frame {}", frame);
                break;
            }
            TickOutcome::Idle | TickOutcome::Loading { .. } | TickOutcome::Stalled { .. } => {}
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    player.pause();
    playlist.wait_idle(Duration::from_secs(5));

    let elapsed = started.elapsed().as_secs_f64();
    let stats = playlist.env().cache.stats();
    println!(
        "Played {} frames in {:.2}s ({:.1} fps), {} stalls, cache hit rate {:.0}%",
        advanced,
        elapsed,
        advanced as f64 / elapsed.max(1e-6),
        stalls.load(Ordering::Relaxed),
        stats.hit_rate() * 100.0
    );
    Ok(())
}

fn cmd_demo(config: EngineConfig, out: &Path) -> Result<()> {
    let mut playlist = Playlist::new(config);
    let env = playlist.env().clone();
    let pattern = |name: &str, w: i32, h: i32, seed: u32| -> Arc<dyn Item> {
        Arc::new(VideoItem::new(
            &env,
            name,
            Arc::new(PatternSource::new(Size::new(w, h), 100, seed)),
        ))
    };

    let diff = playlist.add_root(Arc::new(DifferenceItem::new(&env)));
    playlist.add_child(diff, pattern("A", 640, 480, 1))?;
    playlist.add_child(diff, pattern("B", 640, 480, 2))?;

    let overlay = OverlayItem::new(&env);
    overlay.set_alignment(Alignment::Center, Point::new(10, -5));
    let overlay = playlist.add_root(Arc::new(overlay));
    playlist.add_child(overlay, pattern("Large", 320, 240, 3))?;
    playlist.add_child(overlay, pattern("Medium", 160, 120, 4))?;
    playlist.add_child(overlay, pattern("Small", 64, 48, 5))?;

    playlist.add_root(Arc::new(TextItem::new(&env, "playtree demo")));
    playlist.set_selected(Some(diff));
    playlist.process_events();

    persist::save(&playlist, out)?;
    println!("Wrote {}", out.display());
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let config = EngineConfig::load_or_default(args.config.as_deref())?;
    debug!("Engine config: {:?}", config);

    match args.command {
        Command::Info { playlist } => {
            let pl = open_playlist(&playlist, config)?;
            cmd_info(&pl);
        }
        Command::Render { playlist, frame, out, item, zoom } => {
            let pl = open_playlist(&playlist, config)?;
            let item = pick_item(&pl, item)?;
            cmd_render(&pl, &item, frame, zoom, &out)?;
        }
        Command::Probe { playlist, frame, x, y, item } => {
            let pl = open_playlist(&playlist, config)?;
            let item = pick_item(&pl, item)?;
            cmd_probe(&pl, &item, frame, x, y);
        }
        Command::Play { playlist, frames, fps, item } => {
            let pl = open_playlist(&playlist, config)?;
            let item = pick_item(&pl, item)?;
            cmd_play(&pl, &item, frames, fps)?;
        }
        Command::Demo { out } => cmd_demo(config, &out)?,
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("playtree {} starting...", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    run(args).inspect_err(|e| error!("{:#}", e))
}
