// Texture hot reload: watch the asset root and report changed image files

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use super::source::is_supported_texture;

pub struct TextureWatcher {
    /// Kept alive for the lifetime of the watcher
    _watcher: RecommendedWatcher,
    events: mpsc::Receiver<Event>,
    /// Absolute root that notify reports paths under
    watched_root: PathBuf,
    /// Root as configured; reported paths are rebased onto it so they match
    /// the keys the texture cache was built with
    asset_root: PathBuf,
}

impl TextureWatcher {
    pub fn new(asset_root: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Event>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .context("Failed to create file watcher")?;

        let watched_root = asset_root
            .canonicalize()
            .with_context(|| format!("Asset root {:?} does not exist", asset_root))?;
        watcher
            .watch(&watched_root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {:?}", watched_root))?;

        log::info!("Watching {:?} for texture changes", watched_root);

        Ok(Self {
            _watcher: watcher,
            events: rx,
            watched_root,
            asset_root: asset_root.to_path_buf(),
        })
    }

    /// Drain pending events; returns each changed texture file once
    pub fn drain_changed(&self) -> Vec<PathBuf> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        changed_textures(&events, &self.watched_root, &self.asset_root)
    }
}

fn changed_textures(events: &[Event], watched_root: &Path, asset_root: &Path) -> Vec<PathBuf> {
    let mut changed = BTreeSet::new();
    for event in events {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }
        for path in &event.paths {
            if !is_supported_texture(path) {
                continue;
            }
            let rebased = match path.strip_prefix(watched_root) {
                Ok(relative) => asset_root.join(relative),
                Err(_) => path.clone(),
            };
            changed.insert(rebased);
        }
    }
    changed.into_iter().collect()
}
