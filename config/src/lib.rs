// SPDX-License-Identifier: MPL-2.0

//! Persisted wallpaper selection.
//!
//! The record is written by the `set` command and read once by every engine
//! at construction. Reading never fails: a missing or unreadable file yields
//! [`Config::default`].

use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

pub const NAME: &str = "video-wallpaper";
pub const FILE_NAME: &str = "selection.ron";

/// Redraw cadence used for still images when none is configured.
pub const DEFAULT_FRAME_RATE: u32 = 20;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no configuration directory available")]
    NoConfigDir,
    #[error("configuration I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("configuration is malformed: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("configuration could not be serialized: {0}")]
    Serialize(#[from] ron::Error),
}

/// The last wallpaper selection saved by the user.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Setters)]
#[serde(default)]
#[setters(into)]
#[must_use]
pub struct Config {
    /// Location of the media, `scheme://path` or a plain file path.
    pub content_url: String,
    /// Whether the video restarts when it reaches the end.
    pub is_looping: bool,
    /// Type descriptor of the media, e.g. `video/mp4` or `image/png`.
    pub mime_type: String,
    /// Redraws per second for still images.
    pub frame_rate: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            content_url: String::new(),
            is_looping: false,
            mime_type: String::new(),
            frame_rate: DEFAULT_FRAME_RATE,
        }
    }
}

impl Config {
    /// Location of the persisted record.
    ///
    /// # Errors
    ///
    /// Fails if the platform has no configuration directory.
    pub fn path() -> Result<PathBuf, Error> {
        dirs::config_dir()
            .map(|dir| dir.join(NAME).join(FILE_NAME))
            .ok_or(Error::NoConfigDir)
    }

    /// Load the saved selection, substituting defaults when it is unavailable.
    pub fn load() -> Self {
        Self::try_load().unwrap_or_else(|why| {
            tracing::warn!(%why, "configuration unavailable, using defaults");
            Self::default()
        })
    }

    /// Load the saved selection. A selection that was never saved is the default.
    ///
    /// # Errors
    ///
    /// Fails if the record exists but cannot be read or parsed.
    pub fn try_load() -> Result<Self, Error> {
        match Self::path().and_then(|path| Self::load_from(&path)) {
            Err(Error::Io(why)) if why.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("no saved selection, using defaults");
                Ok(Self::default())
            }
            result => result,
        }
    }

    /// Load a selection from a specific file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or does not parse.
    pub fn load_from(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Ok(ron::from_str(&text)?)
    }

    /// Persist the selection to its default location.
    ///
    /// # Errors
    ///
    /// Fails if the directory or file cannot be written.
    pub fn save(&self) -> Result<PathBuf, Error> {
        let path = Self::path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Persist the selection to `path`, replacing it atomically.
    ///
    /// # Errors
    ///
    /// Fails if the directory or file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        let staging = path.with_extension("ron.tmp");
        fs::write(&staging, text)?;
        fs::rename(&staging, path)?;

        tracing::debug!(path = %path.display(), "saved selection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_an_empty_record() {
        let config = Config::default();
        assert_eq!(config.content_url, "");
        assert!(!config.is_looping);
        assert_eq!(config.mime_type, "");
        assert_eq!(config.frame_rate, DEFAULT_FRAME_RATE);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(NAME).join(FILE_NAME);

        let config = Config::default()
            .content_url("file:///videos/beach.mp4")
            .is_looping(true)
            .mime_type("video/mp4");
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
        assert!(!path.with_extension("ron.tmp").exists());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FILE_NAME);
        fs::write(&path, r#"(content_url: "/tmp/a.png", mime_type: "image/png")"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.content_url, "/tmp/a.png");
        assert!(!config.is_looping);
        assert_eq!(config.frame_rate, DEFAULT_FRAME_RATE);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FILE_NAME);
        fs::write(&path, "(content_url: ").unwrap();

        assert!(matches!(Config::load_from(&path), Err(Error::Parse(_))));
    }
}
