//! Playlist files (JSON).
//!
//! Records mirror the tree: every item stores the id it had when saved, its
//! name and kind, and, for indexed items with a user range, the range, rate
//! and sampling. Containers store their composition parameters, then their
//! children.
//!
//! Loading allocates fresh ids. The saved id is kept as the item's transient
//! playlist id while references (`selected`) are resolved, then reset.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::difference::DifferenceItem;
use super::geometry::Point;
use super::item::{Item, ItemEnv, ItemError, ItemKind, Timing, item_and_all_children};
use super::overlay::{Alignment, OverlayItem};
use super::playlist::Playlist;
use super::source::{SourceSpec, open_source};
use super::text_item::TextItem;
use super::video_item::VideoItem;
use crate::core::ids::ItemId;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistFile {
    pub version: u32,
    pub items: Vec<ItemRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: u32,
    pub name: String,
    pub content: ContentRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<RangeRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentRecord {
    Video {
        source: SourceSpec,
    },
    Text {
        text: String,
        duration: f64,
    },
    Difference {
        children: Vec<ItemRecord>,
    },
    Overlay {
        alignment: usize,
        offset_x: i32,
        offset_y: i32,
        children: Vec<ItemRecord>,
    },
}

/// User-overridden addressing of an indexed item
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeRecord {
    pub start: i32,
    pub end: i32,
    pub frame_rate: f64,
    pub sampling: i32,
}

// ============================================================================
// Save
// ============================================================================

fn record_of(item: &Arc<dyn Item>) -> Result<ItemRecord> {
    let any = item.as_any();
    let children = || item.children().iter().map(record_of).collect::<Result<Vec<_>>>();

    let content = match item.kind() {
        ItemKind::Video => {
            let video = any
                .downcast_ref::<VideoItem>()
                .ok_or_else(|| anyhow!("{:?} is not a video item", item))?;
            ContentRecord::Video { source: video.source().spec() }
        }
        ItemKind::Text => {
            let text = any
                .downcast_ref::<TextItem>()
                .ok_or_else(|| anyhow!("{:?} is not a text item", item))?;
            ContentRecord::Text {
                text: text.text(),
                duration: item.base().duration().unwrap_or_default(),
            }
        }
        ItemKind::Difference => ContentRecord::Difference { children: children()? },
        ItemKind::Overlay => {
            let overlay = any
                .downcast_ref::<OverlayItem>()
                .ok_or_else(|| anyhow!("{:?} is not an overlay", item))?;
            let offset = overlay.manual_offset();
            ContentRecord::Overlay {
                alignment: overlay.alignment().index(),
                offset_x: offset.x,
                offset_y: offset.y,
                children: children()?,
            }
        }
    };

    let range = match item.base().timing() {
        Timing::Indexed(t) if t.user_override => Some(RangeRecord {
            start: t.range.0,
            end: t.range.1,
            frame_rate: t.frame_rate,
            sampling: t.sampling,
        }),
        _ => None,
    };

    Ok(ItemRecord {
        id: item.id().0,
        name: item.name(),
        content,
        range,
    })
}

pub fn to_file(playlist: &Playlist) -> Result<PlaylistFile> {
    Ok(PlaylistFile {
        version: FORMAT_VERSION,
        items: playlist.roots().iter().map(record_of).collect::<Result<_>>()?,
        selected: playlist.selected().map(|i| i.id().0),
    })
}

pub fn save(playlist: &Playlist, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = to_file(playlist)?;
    let json = serde_json::to_string_pretty(&file).context("Failed to serialize playlist")?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Playlist saved to {} ({} root items)", path.display(), file.items.len());
    Ok(())
}

// ============================================================================
// Load
// ============================================================================

fn build(env: &ItemEnv, record: &ItemRecord) -> Result<Arc<dyn Item>> {
    let item: Arc<dyn Item> = match &record.content {
        ContentRecord::Video { source } => {
            let source = open_source(source)
                .with_context(|| format!("Failed to open source of item {}", record.id))?;
            Arc::new(VideoItem::new(env, record.name.clone(), source))
        }
        ContentRecord::Text { text, duration } => {
            let item = TextItem::new(env, text.clone());
            item.base().set_duration(*duration);
            Arc::new(item)
        }
        ContentRecord::Difference { children } => {
            let diff: Arc<dyn Item> = Arc::new(DifferenceItem::new(env));
            attach(&diff, env, children)?;
            diff
        }
        ContentRecord::Overlay { alignment, offset_x, offset_y, children } => {
            let overlay = OverlayItem::new(env);
            let alignment = Alignment::from_index(*alignment)
                .ok_or_else(|| anyhow!("Item {}: invalid alignment {}", record.id, alignment))?;
            overlay.set_alignment(alignment, Point::new(*offset_x, *offset_y));
            let overlay: Arc<dyn Item> = Arc::new(overlay);
            attach(&overlay, env, children)?;
            overlay
        }
    };

    item.base().set_name(record.name.clone());
    item.base().set_playlist_id(Some(record.id));
    if let Some(r) = &record.range {
        item.base().set_frame_rate(r.frame_rate);
        item.base().set_sampling(r.sampling);
        if r.start > r.end {
            bail!("Item {}: range {}..{} is reversed", record.id, r.start, r.end);
        }
        item.set_frame_range((r.start, r.end));
    }
    debug!("Loaded {:?} (saved as {})", item, record.id);
    Ok(item)
}

fn attach(parent: &Arc<dyn Item>, env: &ItemEnv, children: &[ItemRecord]) -> Result<()> {
    let container = parent
        .container()
        .ok_or_else(|| anyhow!("{:?} cannot hold children", parent))?;
    for record in children {
        let child = build(env, record)?;
        if !parent.accepts_child(child.as_ref()) {
            let err = match container.max_count() {
                Some(max) if container.is_full() => ItemError::ContainerFull { max },
                _ => ItemError::ChildRejected { parent: parent.id(), child: child.id() },
            };
            return Err(anyhow::Error::new(err)
                .context(format!("Item {} cannot be loaded here", record.id)));
        }
        container
            .insert(None, child)
            .with_context(|| format!("Failed to add item {} to {:?}", record.id, parent))?;
    }
    parent.resync();
    Ok(())
}

/// Append the items of `file` to `playlist`. Returns saved id -> new id.
pub fn from_file(file: &PlaylistFile, playlist: &mut Playlist) -> Result<HashMap<u32, ItemId>> {
    if file.version > FORMAT_VERSION {
        bail!("Unsupported playlist version {}", file.version);
    }

    let env = playlist.env().clone();
    let roots = file
        .items
        .iter()
        .map(|r| build(&env, r))
        .collect::<Result<Vec<_>>>()?;

    let loaded: Vec<_> = roots.iter().flat_map(item_and_all_children).collect();
    let mapping: HashMap<u32, ItemId> = loaded
        .iter()
        .filter_map(|i| i.base().playlist_id().map(|pid| (pid, i.id())))
        .collect();

    for root in roots {
        playlist.add_root(root);
    }
    if let Some(sel) = file.selected {
        playlist.set_selected(mapping.get(&sel).copied());
    }

    for item in &loaded {
        item.base().set_playlist_id(None);
    }
    Ok(mapping)
}

pub fn load(path: impl AsRef<Path>, playlist: &mut Playlist) -> Result<HashMap<u32, ItemId>> {
    let path = path.as_ref();
    let json =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file: PlaylistFile = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let mapping = from_file(&file, playlist)?;
    info!("Playlist loaded from {} ({} items)", path.display(), mapping.len());
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::geometry::Size;
    use crate::entities::sources::PatternSource;

    fn pattern(pl: &Playlist, frames: i32) -> Arc<dyn Item> {
        Arc::new(VideoItem::new(
            pl.env(),
            "pattern",
            Arc::new(PatternSource::new(Size::new(4, 4), frames, 7)),
        ))
    }

    #[test]
    fn test_user_range_round_trips() {
        let mut pl = Playlist::for_tests();
        let v = pattern(&pl, 50);
        v.base().set_sampling(2);
        v.set_frame_range((10, 20));
        pl.add_root(Arc::clone(&v));
        pl.add_root(pattern(&pl, 50));

        let file = to_file(&pl).unwrap();
        assert_eq!(
            file.items[0].range,
            Some(RangeRecord { start: 10, end: 20, frame_rate: 20.0, sampling: 2 })
        );
        assert_eq!(file.items[1].range, None);

        let mut other = Playlist::for_tests();
        from_file(&file, &mut other).unwrap();
        let loaded = &other.roots()[0];
        assert_eq!(loaded.frame_range(), (10, 20));
        assert_eq!(loaded.base().sampling(), 2);
        assert!(loaded.base().is_range_overridden());
        assert!(!other.roots()[1].base().is_range_overridden());
    }

    #[test]
    fn test_playlist_ids_reset_after_load() {
        let mut pl = Playlist::for_tests();
        let overlay = pl.add_root(Arc::new(OverlayItem::new(pl.env())));
        let v = pattern(&pl, 5);
        pl.add_child(overlay, Arc::clone(&v)).unwrap();
        pl.set_selected(Some(v.id()));

        let file = to_file(&pl).unwrap();
        let mut other = Playlist::for_tests();
        let mapping = from_file(&file, &mut other).unwrap();

        assert_eq!(mapping.len(), 2);
        let new_v = mapping[&v.id().0];
        assert_eq!(other.selected().map(|i| i.id()), Some(new_v));
        assert!(other.all_items().iter().all(|i| i.base().playlist_id().is_none()));
    }

    #[test]
    fn test_rejects_bad_records() {
        let mut pl = Playlist::for_tests();
        let file = PlaylistFile {
            version: FORMAT_VERSION,
            items: vec![ItemRecord {
                id: 1,
                name: "o".into(),
                content: ContentRecord::Overlay {
                    alignment: 12,
                    offset_x: 0,
                    offset_y: 0,
                    children: vec![],
                },
                range: None,
            }],
            selected: None,
        };
        assert!(from_file(&file, &mut pl).is_err());
        assert!(pl.is_empty());

        let future = PlaylistFile { version: FORMAT_VERSION + 1, items: vec![], selected: None };
        assert!(from_file(&future, &mut pl).is_err());

        let text_in_diff = PlaylistFile {
            version: FORMAT_VERSION,
            items: vec![ItemRecord {
                id: 1,
                name: "d".into(),
                content: ContentRecord::Difference {
                    children: vec![ItemRecord {
                        id: 2,
                        name: "t".into(),
                        content: ContentRecord::Text { text: "t".into(), duration: 1.0 },
                        range: None,
                    }],
                },
                range: None,
            }],
            selected: None,
        };
        let err = from_file(&text_in_diff, &mut pl).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ItemError>(),
            Some(ItemError::ChildRejected { .. })
        ));
        assert!(pl.is_empty());
    }
}
