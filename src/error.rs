// SPDX-License-Identifier: MPL-2.0

use crate::{content::ContentError, playback::PlaybackFailure};

/// Why an engine is not showing anything.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("configuration unavailable")]
    ConfigUnavailable,
    #[error("invalid content reference: {0}")]
    InvalidContentReference(#[from] ContentError),
    #[error("unknown content kind {mime_type:?}")]
    ContentKindUnknown { mime_type: String },
    #[error("failed to prepare playback: {0}")]
    PlaybackPrepareFailed(PlaybackFailure),
    #[error("surface unavailable")]
    SurfaceUnavailable,
}
