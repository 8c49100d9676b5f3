//! Playlist files written to disk and read back.

use std::sync::Arc;

use image::{Rgba, RgbaImage};
use playtree::entities::overlay::{Alignment, OverlayItem};
use playtree::entities::persist::{self, ContentRecord, ItemRecord, PlaylistFile};
use playtree::entities::sources::{PatternSource, SequenceSource};
use playtree::entities::{
    DifferenceItem, FrameSource, Item, LoadingState, Playlist, Point, Size, TextItem, VideoItem,
};

fn build_demo(pl: &mut Playlist) {
    let env = pl.env().clone();
    let video = |seed: u32, frames: i32| -> Arc<dyn Item> {
        Arc::new(VideoItem::new(
            &env,
            format!("clip {}", seed),
            Arc::new(PatternSource::new(Size::new(16, 12), frames, seed).with_fps(25.0)),
        ))
    };

    let diff = pl.add_root(Arc::new(DifferenceItem::new(&env)));
    pl.add_child(diff, video(1, 30)).unwrap();
    pl.add_child(diff, video(2, 40)).unwrap();

    let overlay = OverlayItem::new(&env);
    overlay.set_alignment(Alignment::BottomRight, Point::new(-4, 2));
    let overlay = pl.add_root(Arc::new(overlay));
    let clipped = video(3, 50);
    clipped.set_frame_range((5, 25));
    pl.add_child(overlay, clipped).unwrap();
    pl.add_child(overlay, Arc::new(TextItem::new(&env, "label"))).unwrap();

    pl.set_selected(Some(overlay));
    pl.process_events();
}

/// Ids are assigned fresh on load, so compare everything else
fn strip_ids(records: &mut [ItemRecord]) {
    for r in records {
        r.id = 0;
        match &mut r.content {
            ContentRecord::Difference { children } | ContentRecord::Overlay { children, .. } => {
                strip_ids(children)
            }
            _ => {}
        }
    }
}

#[test]
fn test_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("list.json");

    let mut original = Playlist::for_tests();
    build_demo(&mut original);
    persist::save(&original, &path).unwrap();

    let mut loaded = Playlist::for_tests();
    let mapping = persist::load(&path, &mut loaded).unwrap();
    assert_eq!(mapping.len(), original.all_items().len());

    let mut a = persist::to_file(&original).unwrap();
    let mut b = persist::to_file(&loaded).unwrap();
    strip_ids(&mut a.items);
    strip_ids(&mut b.items);
    assert_eq!(a.items, b.items);

    // Selection follows the saved id
    let selected = loaded.selected().unwrap();
    assert_eq!(selected.kind(), original.selected().unwrap().kind());
    let overlay = selected.as_any().downcast_ref::<OverlayItem>().unwrap();
    assert_eq!(overlay.alignment(), Alignment::BottomRight);
    assert_eq!(overlay.manual_offset(), Point::new(-4, 2));

    // Derived state is rebuilt, not stored
    assert_eq!(loaded.roots()[0].frame_range(), (0, 29));
    assert_eq!(selected.children()[0].frame_range(), (5, 25));
    assert!(loaded.all_items().iter().all(|i| i.base().playlist_id().is_none()));
}

#[test]
fn test_sequence_source_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    for i in 1..=4 {
        RgbaImage::from_pixel(6, 4, Rgba([i * 20, 0, 0, 255]))
            .save(dir.path().join(format!("shot.{:03}.png", i)))
            .unwrap();
    }
    let mask = format!("{}/shot.*.png", dir.path().display());

    let mut pl = Playlist::for_tests();
    let source: Arc<dyn FrameSource> = Arc::new(SequenceSource::open(&mask, Some(24.0)).unwrap());
    let item: Arc<dyn Item> = Arc::new(VideoItem::new(pl.env(), "shot", source));
    pl.add_root(item);
    let path = dir.path().join("seq.json");
    persist::save(&pl, &path).unwrap();

    let mut loaded = Playlist::for_tests();
    persist::load(&path, &mut loaded).unwrap();
    let item = &loaded.roots()[0];
    assert_eq!(item.frame_range(), (1, 4));
    assert_eq!(item.size(), Size::new(6, 4));
    assert_eq!(item.base().frame_rate(), Some(24.0));
    item.load_frame(2, false, false);
    assert_ne!(item.needs_loading(2, false), LoadingState::Needed);
    let sets = item.pixel_values(Point::new(0, 0), 2);
    assert_eq!(sets.len(), 1);
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut pl = Playlist::for_tests();
    let err = persist::load(dir.path().join("nope.json"), &mut pl).unwrap_err();
    assert!(format!("{:#}", err).contains("nope.json"));

    let empty = PlaylistFile { version: persist::FORMAT_VERSION, items: vec![], selected: Some(7) };
    persist::from_file(&empty, &mut pl).unwrap();
    assert!(pl.selected().is_none());
}
