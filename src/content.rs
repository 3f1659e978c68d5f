// SPDX-License-Identifier: MPL-2.0

//! Content references and their classification.
//!
//! A [`ContentReference`] is the opaque locator of the media, and
//! [`ContentKind`] decides whether an engine plays it as a video or redraws it
//! as a still image.

use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Video container extensions that may contain playable video.
/// Checked case-insensitively when guessing a mime type for a selection.
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4",  // MPEG-4 container (typically H.264/H.265 codec)
    "webm", // WebM container (VP8/VP9/AV1)
    "mkv",  // Matroska container (any codec)
    "avi",  // AVI container (legacy format)
    "mov",  // QuickTime container (typically H.264)
    "m4v",  // MPEG-4 Video (Apple variant of MP4)
    "ogv",  // Ogg Video container (Theora codec)
];

/// Still image extensions the raster decoder handles.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("content url is empty")]
    Empty,
    #[error("content url {0:?} has an invalid scheme")]
    InvalidScheme(String),
    #[error("content url {0:?} has no path")]
    MissingPath(String),
}

/// Classification of the media, derived from its type descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Video,
    Image,
    Unknown,
}

impl ContentKind {
    /// Classify a mime-type-like descriptor by its leading category.
    ///
    /// `video/*` is a video, `image/*` an image, anything else (including an
    /// empty string) is unknown. The category is matched exactly.
    #[must_use]
    pub fn classify(mime_type: &str) -> Self {
        match mime_type.split('/').next() {
            Some("video") => ContentKind::Video,
            Some("image") => ContentKind::Image,
            _ => ContentKind::Unknown,
        }
    }
}

/// Opaque locator of the media: a scheme and a scheme-specific path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentReference {
    scheme: String,
    path: String,
}

impl ContentReference {
    /// Parse a saved content url.
    ///
    /// `scheme://path` keeps its scheme; a bare path is a `file` reference.
    pub fn parse(url: &str) -> Result<Self, ContentError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ContentError::Empty);
        }

        let Some((scheme, path)) = url.split_once("://") else {
            return Ok(Self {
                scheme: "file".into(),
                path: url.into(),
            });
        };

        let valid_scheme = scheme
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid_scheme {
            return Err(ContentError::InvalidScheme(url.into()));
        }

        if path.is_empty() {
            return Err(ContentError::MissingPath(url.into()));
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            path: path.into(),
        })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The local file this reference names, if it is a `file` reference.
    ///
    /// Relative paths are resolved against the working directory.
    #[must_use]
    pub fn local_path(&self) -> Option<PathBuf> {
        if self.scheme != "file" {
            return None;
        }

        let path = Path::new(&self.path);
        std::path::absolute(path).ok()
    }

    /// This reference with a relative `file` path made absolute, so it still
    /// names the same file when read from another working directory.
    #[must_use]
    pub fn to_absolute(&self) -> Self {
        match self.local_path() {
            Some(path) => Self {
                scheme: self.scheme.clone(),
                path: path.to_string_lossy().into_owned(),
            },
            None => self.clone(),
        }
    }
}

impl fmt::Display for ContentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.path)
    }
}

/// Guess a mime type for a content url from its file extension.
#[must_use]
pub fn guess_mime_type(url: &str) -> Option<String> {
    let path = url.split_once("://").map_or(url, |(_, path)| path);
    let ext = Path::new(path).extension()?.to_str()?.to_lowercase();

    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        let subtype = match ext.as_str() {
            "mov" => "quicktime",
            "mkv" => "x-matroska",
            "avi" => "x-msvideo",
            "m4v" => "mp4",
            "ogv" => "ogg",
            other => other,
        };
        Some(format!("video/{subtype}"))
    } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        let subtype = if ext == "jpg" { "jpeg" } else { ext.as_str() };
        Some(format!("image/{subtype}"))
    } else {
        None
    }
}
