// SPDX-License-Identifier: MPL-2.0

//! Activation: rebuild the wallpapers when a new selection is saved.

use std::{ffi::OsStr, fs, os::unix::fs::MetadataExt, path::Path, time::SystemTime};

use eyre::{Context, OptionExt, eyre};
use notify::{
    RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use sctk::reexports::calloop::{LoopHandle, channel};
use video_wallpaper_config::{Config, FILE_NAME};

use crate::wayland::WallpaperHost;

/// Watch the configuration directory and reload the host when the selection
/// file is written. The watcher stops when the returned value is dropped.
pub fn selection_source(handle: &LoopHandle<'static, WallpaperHost>) -> eyre::Result<RecommendedWatcher> {
    let path = Config::path()?;
    let dir = path
        .parent()
        .ok_or_eyre("selection file has no parent directory")?;

    fs::create_dir_all(dir).wrap_err_with(|| format!("failed to create {}", dir.display()))?;

    let (notify_tx, notify_rx) = channel::sync_channel(20);
    handle
        .insert_source(notify_rx, |e: channel::Event<notify::Event>, _, host| match e {
            channel::Event::Msg(event) => {
                if is_selection_change(&event) {
                    tracing::debug!(kind = ?event.kind, "selection file changed");
                    host.reload();
                }
            }
            channel::Event::Closed => tracing::debug!("selection watcher closed"),
        })
        .map_err(|err| eyre!("failed to insert selection watcher: {}", err.error))?;

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if let Err(why) = notify_tx.send(event) {
                    tracing::error!(?why, "failed to forward selection event");
                }
            }
            Err(why) => tracing::warn!(?why, "selection watcher error"),
        },
        notify::Config::default(),
    )?;

    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    tracing::debug!(dir = %dir.display(), "watching for new selections");

    Ok(watcher)
}

/// Identity of one saved selection file.
///
/// Saving replaces the file, so saving the same record again still yields a
/// new stamp, while repeated events about one save share a stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionStamp {
    inode: u64,
    len: u64,
    modified: Option<SystemTime>,
}

impl SelectionStamp {
    /// `None` when the file does not exist.
    #[must_use]
    pub fn read(path: &Path) -> Option<Self> {
        let metadata = fs::metadata(path).ok()?;
        Some(Self {
            inode: metadata.ino(),
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

/// Whether `event` leaves a new selection file in place.
fn is_selection_change(event: &notify::Event) -> bool {
    let touches_selection = event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(OsStr::new(FILE_NAME)));

    touches_selection
        && match event.kind {
            notify::EventKind::Create(_)
            | notify::EventKind::Remove(_)
            | notify::EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both)) => {
                true
            }
            notify::EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => true,
            _ => false,
        }
}
