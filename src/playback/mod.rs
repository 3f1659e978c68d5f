// SPDX-License-Identifier: MPL-2.0

//! Video playback bound to a content reference and a surface.
//!
//! [`PlaybackResource`] is the engine-facing side. It owns at most one decode
//! session at a time, tags every session with a generation, and makes sure
//! each session is released exactly once. The decoder itself sits behind
//! [`PlaybackBackend`], which is GStreamer in production builds.

pub mod frame_queue;
#[cfg(feature = "video")]
mod video_player;

pub use frame_queue::VideoFrame;
#[cfg(feature = "video")]
pub use video_player::{GstPlaybackFactory, VideoPlayer};

use crate::{
    command::{CommandSink, EngineCommand},
    content::ContentReference,
    surface::{SurfaceHandle, SurfaceId},
};

/// Diagnostics reported by the decoder.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{what} ({extra})")]
pub struct PlaybackFailure {
    pub what: String,
    pub extra: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEventKind {
    /// Preparation finished, playback may start.
    Prepared,
    /// The frame queue went from empty to non-empty.
    FrameReady,
    /// The end of the stream was reached.
    Completed,
    Error(PlaybackFailure),
}

/// An asynchronous notification from a decode session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackEvent {
    pub generation: u64,
    pub kind: PlaybackEventKind,
}

/// Lets a backend report back into the engine from any thread.
#[derive(Debug, Clone)]
pub struct PlaybackNotifier {
    sink: CommandSink,
    generation: u64,
}

impl PlaybackNotifier {
    pub fn new(sink: CommandSink, generation: u64) -> Self {
        Self { sink, generation }
    }

    pub fn notify(&self, kind: PlaybackEventKind) {
        self.sink.send(EngineCommand::Playback(PlaybackEvent {
            generation: self.generation,
            kind,
        }));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("cannot open content: {0}")]
    InvalidContent(String),
    #[error("playback is already bound to a surface")]
    AlreadyBound,
    #[error("playback is not prepared")]
    NotPrepared,
    #[error("video playback is not supported by this build")]
    Unsupported,
    #[error("playback backend failed: {0}")]
    Backend(String),
}

/// A decoder session. Calls arrive on the engine's thread only.
pub trait PlaybackBackend {
    /// Open `content` and begin asynchronous preparation. The backend reports
    /// [`PlaybackEventKind::Prepared`] through `notifier` once ready.
    fn prepare(
        &mut self,
        content: &ContentReference,
        width: u32,
        height: u32,
        notifier: PlaybackNotifier,
    ) -> Result<(), PlaybackError>;

    fn play(&mut self) -> Result<(), PlaybackError>;

    fn pause(&mut self) -> Result<(), PlaybackError>;

    fn seek_to_start(&mut self) -> Result<(), PlaybackError>;

    fn set_volume(&mut self, volume: f64);

    fn set_target_size(&mut self, width: u32, height: u32);

    /// Newest decoded frame since the last call, if any.
    fn take_frame(&mut self) -> Option<VideoFrame>;

    fn release(&mut self);
}

pub trait PlaybackFactory {
    fn create(&mut self) -> Box<dyn PlaybackBackend>;
}

/// The factory for this build: GStreamer, or one that refuses every bind.
#[must_use]
pub fn default_factory() -> Box<dyn PlaybackFactory> {
    #[cfg(feature = "video")]
    {
        Box::new(GstPlaybackFactory)
    }

    #[cfg(not(feature = "video"))]
    {
        Box::new(UnsupportedPlayback)
    }
}

#[cfg(not(feature = "video"))]
pub struct UnsupportedPlayback;

#[cfg(not(feature = "video"))]
impl PlaybackFactory for UnsupportedPlayback {
    fn create(&mut self) -> Box<dyn PlaybackBackend> {
        Box::new(UnsupportedPlayback)
    }
}

#[cfg(not(feature = "video"))]
impl PlaybackBackend for UnsupportedPlayback {
    fn prepare(
        &mut self,
        _content: &ContentReference,
        _width: u32,
        _height: u32,
        _notifier: PlaybackNotifier,
    ) -> Result<(), PlaybackError> {
        Err(PlaybackError::Unsupported)
    }

    fn play(&mut self) -> Result<(), PlaybackError> {
        Err(PlaybackError::Unsupported)
    }

    fn pause(&mut self) -> Result<(), PlaybackError> {
        Err(PlaybackError::Unsupported)
    }

    fn seek_to_start(&mut self) -> Result<(), PlaybackError> {
        Err(PlaybackError::Unsupported)
    }

    fn set_volume(&mut self, _volume: f64) {}

    fn set_target_size(&mut self, _width: u32, _height: u32) {}

    fn take_frame(&mut self) -> Option<VideoFrame> {
        None
    }

    fn release(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Preparing,
    Prepared,
    Playing,
    Paused,
    Failed,
}

struct Session {
    backend: Box<dyn PlaybackBackend>,
    generation: u64,
    surface: SurfaceId,
    phase: PlaybackPhase,
}

/// Owns the decode session of one engine.
pub struct PlaybackResource {
    factory: Box<dyn PlaybackFactory>,
    sink: CommandSink,
    session: Option<Session>,
    generation: u64,
    looping: bool,
}

impl PlaybackResource {
    pub fn new(factory: Box<dyn PlaybackFactory>, sink: CommandSink) -> Self {
        Self {
            factory,
            sink,
            session: None,
            generation: 0,
            looping: false,
        }
    }

    /// Create a decode session sized to `surface` and start preparing it.
    pub fn bind(
        &mut self,
        content: &ContentReference,
        surface: &SurfaceHandle,
    ) -> Result<(), PlaybackError> {
        if let Some(session) = &self.session {
            tracing::debug!(bound = %session.surface, requested = %surface.id(), "playback already bound");
            return Err(PlaybackError::AlreadyBound);
        }

        self.generation += 1;
        let (width, height) = surface.size();
        let notifier = PlaybackNotifier::new(self.sink.clone(), self.generation);

        let mut backend = self.factory.create();
        if let Err(why) = backend.prepare(content, width, height, notifier) {
            backend.release();
            return Err(why);
        }

        tracing::debug!(
            %content,
            surface = %surface.id(),
            generation = self.generation,
            width,
            height,
            "preparing playback"
        );

        self.session = Some(Session {
            backend,
            generation: self.generation,
            surface: surface.id(),
            phase: PlaybackPhase::Preparing,
        });

        Ok(())
    }

    /// Record that the session of `generation` finished preparing.
    ///
    /// Returns `false` if that session no longer exists.
    pub fn on_prepared(&mut self, generation: u64) -> bool {
        match self.session_mut(generation) {
            Some(session) if session.phase == PlaybackPhase::Preparing => {
                session.phase = PlaybackPhase::Prepared;
                true
            }
            _ => false,
        }
    }

    /// Begin presentation with the volume at zero. Idempotent while playing.
    pub fn start(&mut self) -> Result<(), PlaybackError> {
        let Some(session) = self.session.as_mut() else {
            return Err(PlaybackError::NotPrepared);
        };

        match session.phase {
            PlaybackPhase::Playing => Ok(()),
            PlaybackPhase::Prepared | PlaybackPhase::Paused => {
                session.backend.set_volume(0.0);
                session.backend.play()?;
                session.phase = PlaybackPhase::Playing;
                Ok(())
            }
            PlaybackPhase::Preparing | PlaybackPhase::Failed => Err(PlaybackError::NotPrepared),
        }
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    #[must_use]
    pub fn is_looping(&self) -> bool {
        self.looping
    }

    /// Rewind to the beginning without changing play or pause.
    pub fn seek_to_start(&mut self) -> Result<(), PlaybackError> {
        match self.session.as_mut() {
            Some(session)
                if matches!(
                    session.phase,
                    PlaybackPhase::Prepared | PlaybackPhase::Playing | PlaybackPhase::Paused
                ) =>
            {
                session.backend.seek_to_start()
            }
            _ => Err(PlaybackError::NotPrepared),
        }
    }

    /// Handle the end of the stream. A looping session rewinds and keeps
    /// playing, any other session pauses at the start.
    pub fn on_completed(&mut self, generation: u64) -> bool {
        let looping = self.looping;
        let Some(session) = self.session_mut(generation) else {
            return false;
        };

        if session.phase != PlaybackPhase::Playing {
            return false;
        }

        if looping {
            if let Err(why) = session.backend.seek_to_start() {
                tracing::error!(%why, "failed to rewind for loop");
            }
        } else {
            if let Err(why) = session.backend.pause() {
                tracing::error!(%why, "failed to pause at end of stream");
            }
            if let Err(why) = session.backend.seek_to_start() {
                tracing::error!(%why, "failed to rewind at end of stream");
            }
            session.phase = PlaybackPhase::Paused;
        }

        true
    }

    /// Mark the session of `generation` as failed. It stays stopped.
    pub fn on_error(&mut self, generation: u64) -> bool {
        let Some(session) = self.session_mut(generation) else {
            return false;
        };

        if session.phase != PlaybackPhase::Failed {
            if let Err(why) = session.backend.pause() {
                tracing::debug!(%why, "failed to pause after decoder error");
            }
            session.phase = PlaybackPhase::Failed;
        }

        true
    }

    /// Newest frame of the session of `generation`.
    pub fn take_frame(&mut self, generation: u64) -> Option<VideoFrame> {
        let session = self.session_mut(generation)?;
        if session.phase == PlaybackPhase::Failed {
            return None;
        }
        session.backend.take_frame()
    }

    pub fn set_target_size(&mut self, width: u32, height: u32) {
        if let Some(session) = self.session.as_mut() {
            session.backend.set_target_size(width, height);
        }
    }

    /// Halt and release the session. Returns `false` if nothing was bound.
    pub fn stop_and_release(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };

        tracing::debug!(
            surface = %session.surface,
            generation = session.generation,
            "releasing playback"
        );
        session.backend.release();
        true
    }

    #[must_use]
    pub fn phase(&self) -> Option<PlaybackPhase> {
        self.session.as_ref().map(|session| session.phase)
    }

    #[must_use]
    pub fn bound_surface(&self) -> Option<SurfaceId> {
        self.session.as_ref().map(|session| session.surface)
    }

    fn session_mut(&mut self, generation: u64) -> Option<&mut Session> {
        self.session
            .as_mut()
            .filter(|session| session.generation == generation)
    }
}

impl Drop for PlaybackResource {
    fn drop(&mut self) {
        self.stop_and_release();
    }
}
