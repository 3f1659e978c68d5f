// SPDX-License-Identifier: MPL-2.0

//! The wallpaper engine: one content, at most one surface.
//!
//! An engine is built from the saved selection and decides once whether it
//! plays a video or redraws a still image. Surface and power events then
//! drive it through its lifecycle:
//!
//! ```text
//! Constructed ─created─▶ SurfaceBound ─prepared─▶ Prepared ─▶ Playing ⇄ Paused
//!      ▲                      │                                  │
//!      └──── SurfaceUnbound ◀─┴──────────── destroyed ───────────┘
//! ```
//!
//! Content that cannot be shown leaves the engine `Idle`, where every event
//! is a no-op. The state is never stored; it is read off the resources the
//! engine currently owns.

use std::sync::Arc;

use image::RgbaImage;
use tracing::{debug, error, info, trace, warn};
use video_wallpaper_config::Config;

use crate::{
    command::{CommandSink, EngineCommand},
    content::{ContentKind, ContentReference},
    draw,
    error::EngineError,
    playback::{
        PlaybackError, PlaybackEvent, PlaybackEventKind, PlaybackFactory, PlaybackFailure,
        PlaybackPhase, PlaybackResource,
    },
    raster::RasterSource,
    redraw::{self, ImageRedrawLoop, LoopState, RedrawScheduler},
    surface::{SurfaceFormat, SurfaceHandle, SurfaceId},
};

/// Everything an engine needs from its host.
pub struct EnginePorts {
    pub playback: Box<dyn PlaybackFactory>,
    pub scheduler: Box<dyn RedrawScheduler>,
    pub rasters: Box<dyn RasterSource>,
    /// Routes asynchronous results back to this engine.
    pub sink: CommandSink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineLifecycleState {
    Constructed,
    SurfaceBound,
    Prepared,
    Playing,
    Paused,
    SurfaceUnbound,
    Idle,
    Destroyed,
}

/// Surface lifecycle and power callbacks delivered by the host.
pub trait WallpaperEventHandler {
    fn on_surface_created(&mut self, surface: SurfaceHandle);

    fn on_surface_changed(
        &mut self,
        surface: SurfaceId,
        format: SurfaceFormat,
        width: u32,
        height: u32,
    );

    fn on_surface_destroyed(&mut self, surface: SurfaceId);

    fn on_visibility_changed(&mut self, visible: bool);

    fn on_screen_power(&mut self, screen_is_off: bool);
}

struct VideoContent {
    reference: ContentReference,
    playback: PlaybackResource,
    /// Power command received while preparing, applied after the first start.
    queued_power: Option<bool>,
}

struct ImageContent {
    reference: ContentReference,
    redraw: ImageRedrawLoop,
    rasters: Box<dyn RasterSource>,
    /// Bumped per raster request; results of older requests are discarded.
    generation: u64,
    raster: Option<Arc<RgbaImage>>,
    frame_rate: u32,
}

enum Content {
    Video(VideoContent),
    Image(ImageContent),
    Idle(EngineError),
}

pub struct WallpaperEngine {
    content: Content,
    sink: CommandSink,
    surface: Option<SurfaceHandle>,
    visible: bool,
    screen_is_off: Option<bool>,
    was_bound: bool,
    destroyed: bool,
}

fn resolve(config: &Config) -> Result<(ContentKind, ContentReference), EngineError> {
    let reference = ContentReference::parse(&config.content_url)?;

    match ContentKind::classify(&config.mime_type) {
        ContentKind::Unknown => Err(EngineError::ContentKindUnknown {
            mime_type: config.mime_type.clone(),
        }),
        kind => Ok((kind, reference)),
    }
}

impl WallpaperEngine {
    /// Build an engine for the saved selection.
    pub fn new(config: &Config, ports: EnginePorts) -> Self {
        let EnginePorts {
            playback,
            scheduler,
            rasters,
            sink,
        } = ports;

        let content = match resolve(config) {
            Ok((ContentKind::Video, reference)) => {
                info!(%reference, looping = config.is_looping, "video wallpaper");
                let mut playback = PlaybackResource::new(playback, sink.clone());
                playback.set_looping(config.is_looping);
                Content::Video(VideoContent {
                    reference,
                    playback,
                    queued_power: None,
                })
            }
            Ok((_, reference)) => {
                info!(%reference, frame_rate = config.frame_rate, "image wallpaper");
                Content::Image(ImageContent {
                    reference,
                    redraw: ImageRedrawLoop::new(scheduler),
                    rasters,
                    generation: 0,
                    raster: None,
                    frame_rate: config.frame_rate,
                })
            }
            Err(why) => {
                info!(%why, "no wallpaper to show");
                Content::Idle(why)
            }
        };

        Self::with_content(content, sink)
    }

    /// An engine for a selection that could not be read.
    pub fn unavailable(ports: EnginePorts) -> Self {
        info!("configuration unavailable, no wallpaper to show");
        Self::with_content(Content::Idle(EngineError::ConfigUnavailable), ports.sink)
    }

    fn with_content(content: Content, sink: CommandSink) -> Self {
        Self {
            content,
            sink,
            surface: None,
            visible: false,
            screen_is_off: None,
            was_bound: false,
            destroyed: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> EngineLifecycleState {
        if self.destroyed {
            return EngineLifecycleState::Destroyed;
        }

        match &self.content {
            Content::Idle(_) => EngineLifecycleState::Idle,
            _ if self.surface.is_none() => {
                if self.was_bound {
                    EngineLifecycleState::SurfaceUnbound
                } else {
                    EngineLifecycleState::Constructed
                }
            }
            Content::Video(video) => match video.playback.phase() {
                None | Some(PlaybackPhase::Preparing | PlaybackPhase::Failed) => {
                    EngineLifecycleState::SurfaceBound
                }
                Some(PlaybackPhase::Prepared) => EngineLifecycleState::Prepared,
                Some(PlaybackPhase::Playing) => EngineLifecycleState::Playing,
                Some(PlaybackPhase::Paused) => EngineLifecycleState::Paused,
            },
            Content::Image(image) => match (&image.raster, image.redraw.state()) {
                (None, _) => EngineLifecycleState::SurfaceBound,
                (Some(_), LoopState::Idle) => EngineLifecycleState::Prepared,
                (Some(_), LoopState::Running) => EngineLifecycleState::Playing,
                (Some(_), LoopState::Stopped) => EngineLifecycleState::Paused,
            },
        }
    }

    /// Why the engine is idle, if it is.
    #[must_use]
    pub fn idle_reason(&self) -> Option<&EngineError> {
        match &self.content {
            Content::Idle(why) => Some(why),
            _ => None,
        }
    }

    #[must_use]
    pub fn content_kind(&self) -> ContentKind {
        match &self.content {
            Content::Video(_) => ContentKind::Video,
            Content::Image(_) => ContentKind::Image,
            Content::Idle(_) => ContentKind::Unknown,
        }
    }

    #[must_use]
    pub fn bound_surface(&self) -> Option<SurfaceId> {
        self.surface.as_ref().map(SurfaceHandle::id)
    }

    /// Apply a command routed back from a worker, timer or power broadcast.
    pub fn handle(&mut self, command: EngineCommand) {
        if self.destroyed {
            trace!(?command, "engine destroyed, dropping command");
            return;
        }

        match command {
            EngineCommand::Playback(event) => self.on_playback_event(event),
            EngineCommand::RasterReady { generation, result } => {
                self.on_raster_ready(generation, result);
            }
            EngineCommand::RedrawTick(token) => {
                if let Content::Image(image) = &mut self.content {
                    image
                        .redraw
                        .on_tick(token, self.surface.as_mut(), self.visible);
                }
            }
        }
    }

    /// Give up on showing anything, e.g. when the host cannot provide a surface.
    pub fn disable(&mut self, reason: EngineError) {
        if self.destroyed || self.idle_reason().is_some() {
            return;
        }
        self.enter_idle(reason);
    }

    /// Cancel timers, release playback and drop the surface.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }

        self.release_content();
        self.surface = None;
        self.visible = false;
        self.destroyed = true;
        debug!("engine destroyed");
    }

    fn release_content(&mut self) {
        match &mut self.content {
            Content::Video(video) => {
                video.playback.stop_and_release();
                video.queued_power = None;
            }
            Content::Image(image) => {
                image.redraw.release();
                image.generation += 1;
                image.raster = None;
            }
            Content::Idle(_) => {}
        }
    }

    fn enter_idle(&mut self, reason: EngineError) {
        error!(%reason, "wallpaper disabled");
        self.release_content();
        self.surface = None;
        self.visible = false;
        self.content = Content::Idle(reason);
    }

    fn on_playback_event(&mut self, event: PlaybackEvent) {
        let Content::Video(video) = &mut self.content else {
            return;
        };

        let generation = event.generation;
        match event.kind {
            PlaybackEventKind::Prepared => {
                if !video.playback.on_prepared(generation) {
                    debug!(generation, "stale prepared notification");
                    return;
                }

                info!(reference = %video.reference, "playback prepared");
                if let Err(why) = video.playback.start() {
                    error!(%why, "failed to start playback");
                    return;
                }

                if let Some(screen_is_off) = video.queued_power.take() {
                    apply_video_power(&mut video.playback, screen_is_off);
                }
            }

            PlaybackEventKind::FrameReady => {
                let Some(frame) = video.playback.take_frame(generation) else {
                    return;
                };
                let Some(surface) = self.surface.as_mut() else {
                    return;
                };

                if let Err(why) = surface.draw(|canvas| draw::video_frame_canvas(canvas, &frame)) {
                    warn!(surface = %surface.id(), %why, "failed to draw video frame");
                }
            }

            PlaybackEventKind::Completed => {
                if video.playback.on_completed(generation) {
                    debug!(looping = video.playback.is_looping(), "end of stream");
                }
            }

            PlaybackEventKind::Error(PlaybackFailure { what, extra }) => {
                if video.playback.on_error(generation) {
                    error!(%what, %extra, "playback failed");
                }
            }
        }
    }

    fn on_raster_ready(&mut self, generation: u64, result: Result<RgbaImage, String>) {
        let Content::Image(image) = &mut self.content else {
            return;
        };

        let Some(surface) = self.surface.as_mut() else {
            debug!(generation, "raster arrived without a surface");
            return;
        };

        if generation != image.generation {
            debug!(generation, current = image.generation, "stale raster");
            return;
        }

        let raster = match result {
            Ok(raster) => Arc::new(raster),
            Err(extra) => {
                self.enter_idle(EngineError::PlaybackPrepareFailed(PlaybackFailure {
                    what: "cannot decode image".into(),
                    extra,
                }));
                return;
            }
        };

        image.raster = Some(Arc::clone(&raster));

        match image.redraw.state() {
            LoopState::Running | LoopState::Stopped => {
                redraw::draw_raster(surface, &raster);
                image.redraw.replace_raster(raster);
            }
            LoopState::Idle if self.visible => {
                image
                    .redraw
                    .start(raster, surface, image.frame_rate, true);
            }
            LoopState::Idle => debug!("raster ready, waiting for visibility"),
        }
    }
}

fn apply_video_power(playback: &mut PlaybackResource, screen_is_off: bool) {
    let result = if screen_is_off {
        playback.start()
    } else {
        playback.seek_to_start()
    };

    if let Err(why) = result {
        error!(screen_is_off, %why, "failed to apply screen power");
    }
}

impl WallpaperEventHandler for WallpaperEngine {
    fn on_surface_created(&mut self, surface: SurfaceHandle) {
        let span = tracing::debug_span!("surface_created", surface = %surface.id());
        let _handle = span.enter();

        if self.destroyed {
            return;
        }

        if let Content::Idle(why) = &self.content {
            debug!(%why, "idle, ignoring surface");
            return;
        }

        match &self.surface {
            Some(bound) if bound.id() == surface.id() => {
                debug!("surface recreated with the same identity");
                let (old_width, old_height) = bound.size();
                let (width, height) = surface.size();
                let id = surface.id();

                let mut surface = surface;
                surface.set_size(old_width, old_height);
                self.surface = Some(surface);
                self.on_surface_changed(id, SurfaceFormat::Xrgb8888, width, height);
                return;
            }
            Some(bound) => {
                warn!(bound = %bound.id(), "another surface is still bound, ignoring");
                return;
            }
            None => {}
        }

        let (width, height) = surface.size();
        let surface = self.surface.insert(surface);
        self.was_bound = true;

        let failure = match &mut self.content {
            Content::Video(video) => match video.playback.bind(&video.reference, surface) {
                Ok(()) => None,
                Err(why @ (PlaybackError::AlreadyBound | PlaybackError::NotPrepared)) => {
                    warn!(%why, "unexpected bind failure");
                    None
                }
                Err(why) => Some(EngineError::PlaybackPrepareFailed(PlaybackFailure {
                    what: "cannot open content".into(),
                    extra: why.to_string(),
                })),
            },
            Content::Image(image) => {
                image.generation += 1;
                image.rasters.request(
                    &image.reference,
                    width,
                    height,
                    image.generation,
                    self.sink.clone(),
                );
                None
            }
            Content::Idle(_) => None,
        };

        if let Some(reason) = failure {
            self.enter_idle(reason);
        }
    }

    fn on_surface_changed(
        &mut self,
        surface: SurfaceId,
        format: SurfaceFormat,
        width: u32,
        height: u32,
    ) {
        let span = tracing::debug_span!("surface_changed", %surface, ?format, width, height);
        let _handle = span.enter();

        let Some(bound) = self.surface.as_mut().filter(|bound| bound.id() == surface) else {
            debug!("surface not bound, ignoring change");
            return;
        };

        let resized = bound.size() != (width, height);
        bound.set_size(width, height);

        match &mut self.content {
            Content::Video(video) => {
                if resized {
                    video.playback.set_target_size(width, height);
                }
            }
            Content::Image(image) => {
                if let Some(raster) = &image.raster {
                    redraw::draw_raster(bound, raster);
                }
                if resized {
                    image.generation += 1;
                    image.rasters.request(
                        &image.reference,
                        width,
                        height,
                        image.generation,
                        self.sink.clone(),
                    );
                }
            }
            Content::Idle(_) => {}
        }
    }

    fn on_surface_destroyed(&mut self, surface: SurfaceId) {
        let span = tracing::debug_span!("surface_destroyed", %surface);
        let _handle = span.enter();

        if self.bound_surface() != Some(surface) {
            debug!("surface not bound, ignoring destruction");
            return;
        }

        self.release_content();
        self.surface = None;
        self.visible = false;
    }

    fn on_visibility_changed(&mut self, visible: bool) {
        if self.destroyed || self.idle_reason().is_some() {
            return;
        }

        let Some(surface) = self.surface.as_mut() else {
            debug!(visible, "no surface bound, ignoring visibility");
            return;
        };

        self.visible = visible;

        let Content::Image(image) = &mut self.content else {
            trace!(visible, "video ignores visibility");
            return;
        };

        if !visible {
            image.redraw.stop();
            return;
        }

        if image.redraw.state() == LoopState::Running {
            return;
        }

        if let Some(raster) = &image.raster {
            image
                .redraw
                .start(Arc::clone(raster), surface, image.frame_rate, true);
        }
    }

    fn on_screen_power(&mut self, screen_is_off: bool) {
        if self.destroyed {
            return;
        }

        if let Content::Idle(why) = &self.content {
            info!(screen_is_off, %why, "no wallpaper to show, ignoring screen power");
            return;
        }

        if self.screen_is_off == Some(screen_is_off) {
            debug!(screen_is_off, "screen power unchanged");
            return;
        }
        self.screen_is_off = Some(screen_is_off);

        match &mut self.content {
            Content::Video(video) => match video.playback.phase() {
                None => debug!(screen_is_off, "remembered until a surface is bound"),
                Some(PlaybackPhase::Preparing) => {
                    debug!(screen_is_off, "queued until prepared");
                    video.queued_power = Some(screen_is_off);
                }
                Some(PlaybackPhase::Failed) => debug!(screen_is_off, "playback failed, ignoring"),
                Some(_) => apply_video_power(&mut video.playback, screen_is_off),
            },
            Content::Image(image) => {
                if screen_is_off {
                    image.redraw.stop();
                }
            }
            Content::Idle(_) => {}
        }
    }
}

impl Drop for WallpaperEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        rc::Rc,
        sync::{Arc, Mutex},
    };

    use image::Rgba;

    use super::*;
    use crate::{
        command::testing::collecting_sink,
        playback::{
            VideoFrame,
            testing::{BackendCall, BackendLog, fake_factory},
        },
        redraw::testing::{SchedulerLog, fake_scheduler},
        surface::testing::{TargetLog, fake_surface},
    };

    #[derive(Debug, Default)]
    struct RasterLog {
        requests: Vec<(String, u32, u32, u64)>,
    }

    struct FakeRasters(Rc<RefCell<RasterLog>>);

    impl RasterSource for FakeRasters {
        fn request(
            &mut self,
            content: &ContentReference,
            width: u32,
            height: u32,
            generation: u64,
            _sink: CommandSink,
        ) {
            self.0
                .borrow_mut()
                .requests
                .push((content.to_string(), width, height, generation));
        }
    }

    struct Harness {
        engine: WallpaperEngine,
        backend: Rc<RefCell<BackendLog>>,
        timers: Rc<RefCell<SchedulerLog>>,
        rasters: Rc<RefCell<RasterLog>>,
        commands: Arc<Mutex<Vec<EngineCommand>>>,
    }

    impl Harness {
        fn new(config: &Config) -> Self {
            let (playback, backend) = fake_factory();
            let (scheduler, timers) = fake_scheduler();
            let rasters = Rc::new(RefCell::new(RasterLog::default()));
            let (sink, commands) = collecting_sink();

            let engine = WallpaperEngine::new(
                config,
                EnginePorts {
                    playback,
                    scheduler,
                    rasters: Box::new(FakeRasters(Rc::clone(&rasters))),
                    sink,
                },
            );

            Self {
                engine,
                backend,
                timers,
                rasters,
                commands,
            }
        }

        fn video(looping: bool) -> Self {
            Self::new(
                &Config::default()
                    .content_url("file://a.mp4")
                    .mime_type("video/mp4")
                    .is_looping(looping),
            )
        }

        fn image() -> Self {
            Self::new(
                &Config::default()
                    .content_url("/backgrounds/sea.png")
                    .mime_type("image/png"),
            )
        }

        /// Deliver everything the engine sent to itself.
        fn pump(&mut self) {
            loop {
                let commands = std::mem::take(&mut *self.commands.lock().unwrap());
                if commands.is_empty() {
                    break;
                }
                for command in commands {
                    self.engine.handle(command);
                }
            }
        }

        fn create(&mut self, id: u64) -> Rc<RefCell<TargetLog>> {
            let (surface, target) = fake_surface(id, 64, 32);
            self.engine.on_surface_created(surface);
            target
        }

        fn notify(&mut self, index: usize, kind: PlaybackEventKind) {
            let notifier = self.backend.borrow().notifiers[index].clone();
            notifier.notify(kind);
            self.pump();
        }

        fn prepare_latest(&mut self) {
            let index = self.backend.borrow().notifiers.len() - 1;
            self.notify(index, PlaybackEventKind::Prepared);
        }

        fn deliver_raster(&mut self) {
            let (_, width, height, generation) = *self.rasters.borrow().requests.last().unwrap();
            self.engine.handle(EngineCommand::RasterReady {
                generation,
                result: Ok(RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255]))),
            });
        }

        fn count(&self, call: &BackendCall) -> usize {
            self.backend.borrow().count(call)
        }
    }

    fn frame() -> VideoFrame {
        VideoFrame {
            data: vec![7; 64 * 32 * 4],
            width: 64,
            height: 32,
            stride: 64 * 4,
            pts_ns: Some(0),
        }
    }

    #[test]
    fn content_kind_is_chosen_from_the_mime_type() {
        let video = Harness::video(false);
        assert_eq!(video.engine.content_kind(), ContentKind::Video);
        assert_eq!(video.engine.state(), EngineLifecycleState::Constructed);

        let image = Harness::image();
        assert_eq!(image.engine.content_kind(), ContentKind::Image);

        for mime_type in ["", "audio/mp3"] {
            let harness =
                Harness::new(&Config::default().content_url("/a.mp3").mime_type(mime_type));
            assert_eq!(harness.engine.state(), EngineLifecycleState::Idle);
            assert!(matches!(
                harness.engine.idle_reason(),
                Some(EngineError::ContentKindUnknown { .. })
            ));
        }
    }

    #[test]
    fn video_plays_once_prepared_and_releases_on_destroy() {
        let mut harness = Harness::video(true);
        let target = harness.create(1);

        assert_eq!(harness.engine.state(), EngineLifecycleState::SurfaceBound);
        assert_eq!(
            harness.backend.borrow().calls,
            [BackendCall::Prepare {
                uri: "file://a.mp4".into(),
                width: 64,
                height: 32
            }]
        );

        harness.prepare_latest();
        assert_eq!(harness.engine.state(), EngineLifecycleState::Playing);
        assert_eq!(harness.count(&BackendCall::SetVolume(0.0)), 1);
        assert_eq!(harness.count(&BackendCall::Play), 1);

        harness.backend.borrow_mut().frames.push_back(frame());
        harness.notify(0, PlaybackEventKind::FrameReady);
        assert_eq!(target.borrow().posts, 1);

        harness.engine.on_surface_destroyed(SurfaceId(1));
        assert_eq!(harness.engine.state(), EngineLifecycleState::SurfaceUnbound);
        assert_eq!(harness.count(&BackendCall::Release), 1);

        harness.backend.borrow_mut().frames.push_back(frame());
        harness.notify(0, PlaybackEventKind::FrameReady);
        assert_eq!(target.borrow().posts, 1);
        assert_eq!(harness.backend.borrow().last(), Some(&BackendCall::Release));
    }

    #[test]
    fn every_destroy_releases_exactly_once() {
        let mut harness = Harness::video(true);

        for cycle in 1..=3 {
            harness.create(cycle);
            if cycle % 2 == 1 {
                harness.prepare_latest();
            }
            harness.engine.on_surface_destroyed(SurfaceId(cycle));
            harness.engine.on_surface_destroyed(SurfaceId(cycle));

            assert_eq!(harness.engine.state(), EngineLifecycleState::SurfaceUnbound);
            assert_eq!(harness.count(&BackendCall::Release), cycle as usize);
        }

        drop(harness.engine);
        assert_eq!(harness.backend.borrow().count(&BackendCall::Release), 3);
    }

    #[test]
    fn prepared_after_destroy_is_discarded() {
        let mut harness = Harness::video(true);
        harness.create(1);
        harness.engine.on_surface_destroyed(SurfaceId(1));
        harness.create(2);

        harness.notify(0, PlaybackEventKind::Prepared);
        assert_eq!(harness.engine.state(), EngineLifecycleState::SurfaceBound);
        assert_eq!(harness.count(&BackendCall::Play), 0);

        harness.notify(1, PlaybackEventKind::Prepared);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Playing);
    }

    #[test]
    fn screen_on_rewinds_and_keeps_playing() {
        let mut harness = Harness::video(true);
        harness.create(1);
        harness.prepare_latest();
        harness.engine.on_screen_power(true);

        harness.engine.on_screen_power(false);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Playing);
        assert_eq!(harness.backend.borrow().last(), Some(&BackendCall::SeekToStart));
        assert_eq!(harness.count(&BackendCall::Pause), 0);
    }

    #[test]
    fn repeated_power_commands_are_no_ops() {
        let mut harness = Harness::video(true);
        harness.create(1);
        harness.prepare_latest();

        harness.engine.on_screen_power(false);
        harness.engine.on_screen_power(false);
        assert_eq!(harness.count(&BackendCall::SeekToStart), 1);
    }

    #[test]
    fn power_while_preparing_applies_after_start() {
        let mut harness = Harness::video(true);
        harness.create(1);

        harness.engine.on_screen_power(false);
        assert_eq!(harness.count(&BackendCall::SeekToStart), 0);

        harness.prepare_latest();
        let calls = harness.backend.borrow().calls.clone();
        let play = calls.iter().position(|c| *c == BackendCall::Play).unwrap();
        let seek = calls
            .iter()
            .position(|c| *c == BackendCall::SeekToStart)
            .unwrap();
        assert!(play < seek);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Playing);
    }

    #[test]
    fn completion_without_loop_pauses_at_start_until_screen_off() {
        let mut harness = Harness::video(false);
        harness.create(1);
        harness.prepare_latest();

        harness.notify(0, PlaybackEventKind::Completed);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Paused);
        assert_eq!(harness.backend.borrow().last(), Some(&BackendCall::SeekToStart));

        harness.engine.on_screen_power(true);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Playing);
        assert_eq!(harness.count(&BackendCall::Play), 2);
    }

    #[test]
    fn looping_completion_keeps_playing() {
        let mut harness = Harness::video(true);
        harness.create(1);
        harness.prepare_latest();

        harness.notify(0, PlaybackEventKind::Completed);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Playing);
        assert_eq!(harness.count(&BackendCall::Pause), 0);
    }

    #[test]
    fn decoder_errors_leave_playback_stopped() {
        let mut harness = Harness::video(true);
        harness.create(1);
        harness.prepare_latest();

        harness.notify(
            0,
            PlaybackEventKind::Error(PlaybackFailure {
                what: "Internal data stream error.".into(),
                extra: "qtdemux0".into(),
            }),
        );
        assert_eq!(harness.engine.state(), EngineLifecycleState::SurfaceBound);

        harness.engine.on_screen_power(true);
        assert_eq!(harness.count(&BackendCall::Play), 1);
    }

    #[test]
    fn video_ignores_visibility() {
        let mut harness = Harness::video(true);
        harness.create(1);
        harness.prepare_latest();
        let calls = harness.backend.borrow().calls.len();

        harness.engine.on_visibility_changed(false);
        harness.engine.on_visibility_changed(true);
        assert_eq!(harness.backend.borrow().calls.len(), calls);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Playing);
    }

    #[test]
    fn resize_rescales_video_output() {
        let mut harness = Harness::video(true);
        harness.create(1);

        harness
            .engine
            .on_surface_changed(SurfaceId(2), SurfaceFormat::Xrgb8888, 10, 10);
        harness
            .engine
            .on_surface_changed(SurfaceId(1), SurfaceFormat::Xrgb8888, 64, 32);
        assert_eq!(harness.count(&BackendCall::SetTargetSize(10, 10)), 0);
        assert_eq!(harness.count(&BackendCall::SetTargetSize(64, 32)), 0);

        harness
            .engine
            .on_surface_changed(SurfaceId(1), SurfaceFormat::Xrgb8888, 128, 64);
        assert_eq!(harness.count(&BackendCall::SetTargetSize(128, 64)), 1);
    }

    #[test]
    fn unopenable_content_goes_idle() {
        let mut harness = Harness::video(true);
        harness.backend.borrow_mut().fail_prepare =
            Some(PlaybackError::InvalidContent("a.mp4 is not a file".into()));

        harness.create(1);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Idle);
        assert_eq!(harness.engine.bound_surface(), None);
        assert!(matches!(
            harness.engine.idle_reason(),
            Some(EngineError::PlaybackPrepareFailed(_))
        ));
    }

    #[test]
    fn empty_url_is_idle_and_ignores_everything() {
        let mut harness = Harness::new(&Config::default());
        assert!(matches!(
            harness.engine.idle_reason(),
            Some(EngineError::InvalidContentReference(_))
        ));

        let target = harness.create(1);
        harness.engine.on_visibility_changed(true);
        harness.engine.on_screen_power(true);
        harness.engine.on_screen_power(true);
        harness.engine.on_surface_destroyed(SurfaceId(1));

        assert_eq!(harness.engine.state(), EngineLifecycleState::Idle);
        assert!(harness.backend.borrow().calls.is_empty());
        assert_eq!(target.borrow().locks, 0);
        assert!(harness.rasters.borrow().requests.is_empty());
    }

    #[test]
    fn unavailable_configuration_is_idle() {
        let (playback, _) = fake_factory();
        let (scheduler, _) = fake_scheduler();
        let (sink, _) = collecting_sink();
        let engine = WallpaperEngine::unavailable(EnginePorts {
            playback,
            scheduler,
            rasters: Box::new(FakeRasters(Rc::default())),
            sink,
        });

        assert_eq!(engine.state(), EngineLifecycleState::Idle);
        assert!(matches!(
            engine.idle_reason(),
            Some(EngineError::ConfigUnavailable)
        ));
    }

    #[test]
    fn disabled_engine_releases_and_stays_idle() {
        let mut harness = Harness::video(true);
        harness.create(1);
        harness.prepare_latest();

        harness.engine.disable(EngineError::SurfaceUnavailable);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Idle);
        assert_eq!(harness.count(&BackendCall::Release), 1);

        harness.create(2);
        assert_eq!(harness.engine.bound_surface(), None);
    }

    #[test]
    fn recreating_the_bound_surface_applies_its_geometry() {
        let mut harness = Harness::video(true);
        harness.create(1);

        let (surface, _) = fake_surface(1, 128, 64);
        harness.engine.on_surface_created(surface);
        assert_eq!(harness.engine.bound_surface(), Some(SurfaceId(1)));
        assert_eq!(harness.count(&BackendCall::SetTargetSize(128, 64)), 1);

        let (other, _) = fake_surface(2, 8, 8);
        harness.engine.on_surface_created(other);
        assert_eq!(harness.engine.bound_surface(), Some(SurfaceId(1)));
        assert_eq!(harness.backend.borrow().notifiers.len(), 1);
    }

    #[test]
    fn image_loop_follows_visibility() {
        let mut harness = Harness::image();
        let target = harness.create(1);

        assert_eq!(
            harness.rasters.borrow().requests,
            [("file:///backgrounds/sea.png".to_string(), 64, 32, 1)]
        );
        assert_eq!(harness.engine.state(), EngineLifecycleState::SurfaceBound);

        harness.engine.on_visibility_changed(true);
        harness.deliver_raster();
        assert_eq!(harness.engine.state(), EngineLifecycleState::Playing);
        assert_eq!(target.borrow().posts, 1);
        assert_eq!(harness.timers.borrow().armed.len(), 1);

        harness.engine.on_visibility_changed(false);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Paused);
        assert!(harness.timers.borrow().armed.is_empty());

        harness.engine.on_visibility_changed(true);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Playing);
        assert_eq!(harness.timers.borrow().armed.len(), 1);
        assert_eq!(harness.timers.borrow().max_armed, 1);
    }

    #[test]
    fn image_ticks_redraw_through_the_command_path() {
        let mut harness = Harness::image();
        let target = harness.create(1);
        harness.engine.on_visibility_changed(true);
        harness.deliver_raster();

        for _ in 0..3 {
            let token = harness.timers.borrow().current().unwrap();
            harness.engine.handle(EngineCommand::RedrawTick(token));
        }

        assert_eq!(target.borrow().posts, 4);
        assert_eq!(target.borrow().locks, target.borrow().posts);
        assert_eq!(harness.timers.borrow().max_armed, 1);
    }

    #[test]
    fn image_waits_for_visibility_once_decoded() {
        let mut harness = Harness::image();
        let target = harness.create(1);
        harness.deliver_raster();

        assert_eq!(harness.engine.state(), EngineLifecycleState::Prepared);
        assert_eq!(target.borrow().posts, 0);

        harness.engine.on_visibility_changed(true);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Playing);
        assert_eq!(target.borrow().posts, 1);
    }

    #[test]
    fn image_screen_off_stops_and_screen_on_changes_nothing() {
        let mut harness = Harness::image();
        harness.create(1);
        harness.engine.on_visibility_changed(true);
        harness.deliver_raster();

        harness.engine.on_screen_power(true);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Paused);
        assert!(harness.timers.borrow().armed.is_empty());

        harness.engine.on_screen_power(false);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Paused);
        assert!(harness.timers.borrow().armed.is_empty());
    }

    #[test]
    fn image_resize_redraws_and_requests_a_new_raster() {
        let mut harness = Harness::image();
        let target = harness.create(1);
        harness.engine.on_visibility_changed(true);
        harness.deliver_raster();

        harness
            .engine
            .on_surface_changed(SurfaceId(1), SurfaceFormat::Xrgb8888, 128, 64);
        assert_eq!(target.borrow().posts, 2);
        assert_eq!(
            harness.rasters.borrow().requests.last().map(|r| (r.1, r.2, r.3)),
            Some((128, 64, 2))
        );

        harness.deliver_raster();
        assert_eq!(target.borrow().posts, 3);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Playing);
    }

    #[test]
    fn image_destroy_discards_in_flight_rasters() {
        let mut harness = Harness::image();
        let target = harness.create(1);
        harness.engine.on_visibility_changed(true);
        harness.engine.on_surface_destroyed(SurfaceId(1));

        harness.deliver_raster();
        assert_eq!(harness.engine.state(), EngineLifecycleState::SurfaceUnbound);
        assert_eq!(target.borrow().locks, 0);

        let target = harness.create(2);
        harness.deliver_raster();
        assert_eq!(harness.engine.state(), EngineLifecycleState::Prepared);
        assert_eq!(target.borrow().posts, 0);
    }

    #[test]
    fn image_decode_failure_goes_idle() {
        let mut harness = Harness::image();
        harness.create(1);
        harness.engine.handle(EngineCommand::RasterReady {
            generation: 1,
            result: Err("not an image".into()),
        });

        assert_eq!(harness.engine.state(), EngineLifecycleState::Idle);
        assert_eq!(harness.engine.bound_surface(), None);
    }

    #[test]
    fn failing_canvas_keeps_the_loop_alive() {
        let mut harness = Harness::image();
        let target = harness.create(1);
        target.borrow_mut().fail_lock = true;
        harness.engine.on_visibility_changed(true);
        harness.deliver_raster();

        let token = harness.timers.borrow().current().unwrap();
        harness.engine.handle(EngineCommand::RedrawTick(token));

        assert_eq!(target.borrow().posts, 0);
        assert_eq!(harness.timers.borrow().armed.len(), 1);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Playing);
    }

    #[test]
    fn destroy_is_terminal() {
        let mut harness = Harness::video(true);
        harness.create(1);
        harness.prepare_latest();

        harness.engine.destroy();
        harness.engine.destroy();
        assert_eq!(harness.engine.state(), EngineLifecycleState::Destroyed);
        assert_eq!(harness.count(&BackendCall::Release), 1);

        harness.create(2);
        harness.engine.on_screen_power(true);
        harness.notify(0, PlaybackEventKind::Prepared);
        assert_eq!(harness.engine.state(), EngineLifecycleState::Destroyed);
        let prepared = BackendCall::Prepare {
            uri: "file://a.mp4".into(),
            width: 64,
            height: 32,
        };
        assert_eq!(harness.count(&prepared), 1);

        drop(harness.engine);
        assert_eq!(harness.backend.borrow().count(&BackendCall::Release), 1);
    }

    #[test]
    fn image_destroy_cancels_timers() {
        let mut harness = Harness::image();
        harness.create(1);
        harness.engine.on_visibility_changed(true);
        harness.deliver_raster();

        harness.engine.destroy();
        assert!(harness.timers.borrow().armed.is_empty());
        assert_eq!(harness.engine.state(), EngineLifecycleState::Destroyed);
    }
}
