// SPDX-License-Identifier: MPL-2.0

//! GStreamer decode session.
//!
//! Each [`VideoPlayer`] wraps one `playbin`, muted, whose video sink scales
//! and converts to BGRx at the surface size:
//!
//! ```text
//! playbin ─▶ videoconvert ─▶ videoscale ─▶ capsfilter(BGRx, WxH) ─▶ appsink
//!                                                                    │
//!                                              FrameQueue ◀── push ──┘
//! ```
//!
//! Bus messages are forwarded from the streaming threads by a synchronous
//! handler, so the engine learns about preparation, end of stream and errors
//! through its command channel without polling.

use std::sync::{
    Arc, Once,
    atomic::{AtomicBool, Ordering},
};

use gstreamer::prelude::*;
use tracing::{debug, error, info, trace, warn};

use super::{
    PlaybackBackend, PlaybackError, PlaybackEventKind, PlaybackFactory, PlaybackFailure,
    PlaybackNotifier,
    frame_queue::{FrameQueue, SharedFrameQueue, VideoFrame},
};
use crate::content::ContentReference;

const SINK_DESCRIPTION: &str = concat!(
    "videoconvert ! ",
    "videoscale add-borders=false ! ",
    "capsfilter name=size ! ",
    "appsink name=sink sync=true max-buffers=4 drop=true"
);

/// Creates a fresh [`VideoPlayer`] per bind.
pub struct GstPlaybackFactory;

impl PlaybackFactory for GstPlaybackFactory {
    fn create(&mut self) -> Box<dyn PlaybackBackend> {
        Box::new(VideoPlayer::default())
    }
}

struct Pipeline {
    playbin: gstreamer::Element,
    size_filter: gstreamer::Element,
    frame_queue: SharedFrameQueue,
    /// Set when a `FrameReady` is in flight, cleared when the engine takes a frame.
    frame_pending: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct VideoPlayer {
    pipeline: Option<Pipeline>,
}

/// Log available hardware video decoders for debugging.
fn log_available_decoders() {
    let registry = gstreamer::Registry::get();

    let hw_decoders = [
        ("nvh264dec", "NVDEC H.264 (NVIDIA)"),
        ("nvh265dec", "NVDEC H.265/HEVC (NVIDIA)"),
        ("vah264dec", "VA H.264 (AMD/Intel)"),
        ("vah265dec", "VA H.265/HEVC (AMD/Intel)"),
        ("vavp9dec", "VA VP9 (AMD/Intel)"),
        ("vaav1dec", "VA AV1 (AMD/Intel)"),
        ("v4l2h264dec", "V4L2 H.264 (ARM)"),
    ];

    let available: Vec<_> = hw_decoders
        .into_iter()
        .filter(|(element_name, _)| {
            registry
                .find_feature(element_name, gstreamer::ElementFactory::static_type())
                .is_some()
        })
        .map(|(_, description)| description)
        .collect();

    if available.is_empty() {
        warn!("No hardware video decoders found. Video will use software decoding.");
    } else {
        info!(decoders = ?available, "Available hardware video decoders");
    }
}

fn backend_error(why: impl std::fmt::Display) -> PlaybackError {
    PlaybackError::Backend(why.to_string())
}

/// Turn a content reference into a URI `playbin` can open.
fn content_uri(content: &ContentReference) -> Result<String, PlaybackError> {
    if content.scheme() != "file" {
        return Ok(content.to_string());
    }

    let path = content
        .local_path()
        .ok_or_else(|| PlaybackError::InvalidContent(content.to_string()))?;

    if !path.is_file() {
        return Err(PlaybackError::InvalidContent(format!(
            "{} is not a file",
            path.display()
        )));
    }

    gstreamer::glib::filename_to_uri(&path, None)
        .map(|uri| uri.to_string())
        .map_err(|why| PlaybackError::InvalidContent(why.to_string()))
}

fn frame_caps(width: u32, height: u32) -> gstreamer::Caps {
    let dimension = |value: u32| i32::try_from(value.max(1)).unwrap_or(i32::MAX);

    gstreamer::Caps::builder("video/x-raw")
        .field("format", "BGRx")
        .field("width", dimension(width))
        .field("height", dimension(height))
        .field("pixel-aspect-ratio", gstreamer::Fraction::new(1, 1))
        .build()
}

fn handle_sample(
    appsink: &gstreamer_app::AppSink,
    frame_queue: &FrameQueue,
) -> Result<gstreamer::FlowSuccess, gstreamer::FlowError> {
    let sample = match appsink.pull_sample() {
        Ok(s) => s,
        Err(why) => {
            warn!(?why, "pull_sample failed");
            return Ok(gstreamer::FlowSuccess::Ok);
        }
    };

    let Some(buffer) = sample.buffer() else {
        return Ok(gstreamer::FlowSuccess::Ok);
    };

    let Some(caps) = sample.caps() else {
        return Ok(gstreamer::FlowSuccess::Ok);
    };

    let Ok(video_info) = gstreamer_video::VideoInfo::from_caps(caps) else {
        return Ok(gstreamer::FlowSuccess::Ok);
    };

    let Ok(map) = buffer.map_readable() else {
        trace!("Skipped frame: buffer map blocked");
        return Ok(gstreamer::FlowSuccess::Ok);
    };

    let width = video_info.width();
    let stride = video_info
        .stride()
        .first()
        .and_then(|&stride| u32::try_from(stride).ok())
        .unwrap_or(width * 4);

    let frame = VideoFrame {
        data: map.as_slice().to_vec(),
        width,
        height: video_info.height(),
        stride,
        pts_ns: buffer.pts().map(|pts| pts.nseconds()),
    };

    if frame_queue.push(frame) {
        let stats = frame_queue.stats();
        if stats.pushed % 600 == 0 {
            debug!(
                pushed = stats.pushed,
                taken = stats.taken,
                dropped = stats.dropped,
                "Video playback progress"
            );
        }
    }

    Ok(gstreamer::FlowSuccess::Ok)
}

impl VideoPlayer {
    fn pipeline(&self) -> Result<&Pipeline, PlaybackError> {
        self.pipeline.as_ref().ok_or(PlaybackError::NotPrepared)
    }

    fn set_state(&self, state: gstreamer::State) -> Result<(), PlaybackError> {
        self.pipeline()?
            .playbin
            .set_state(state)
            .map(|_| ())
            .map_err(backend_error)
    }
}

impl PlaybackBackend for VideoPlayer {
    fn prepare(
        &mut self,
        content: &ContentReference,
        width: u32,
        height: u32,
        notifier: PlaybackNotifier,
    ) -> Result<(), PlaybackError> {
        if self.pipeline.is_some() {
            return Err(PlaybackError::AlreadyBound);
        }

        gstreamer::init().map_err(backend_error)?;

        static LOGGED_DECODERS: Once = Once::new();
        LOGGED_DECODERS.call_once(log_available_decoders);

        let uri = content_uri(content)?;

        let sink_bin =
            gstreamer::parse::bin_from_description(SINK_DESCRIPTION, true).map_err(backend_error)?;

        let size_filter = sink_bin
            .by_name("size")
            .ok_or_else(|| backend_error("sink bin has no capsfilter"))?;
        size_filter.set_property("caps", &frame_caps(width, height));

        let appsink = sink_bin
            .by_name("sink")
            .and_then(|sink| sink.dynamic_cast::<gstreamer_app::AppSink>().ok())
            .ok_or_else(|| backend_error("sink bin has no appsink"))?;

        let playbin = gstreamer::ElementFactory::make("playbin")
            .build()
            .map_err(backend_error)?;
        playbin.set_property("uri", uri.as_str());
        playbin.set_property("mute", true);
        playbin.set_property("volume", 0.0f64);
        playbin.set_property("video-sink", &sink_bin);

        let frame_queue: SharedFrameQueue = Arc::new(FrameQueue::default());
        let frame_pending = Arc::new(AtomicBool::new(false));

        {
            let frame_queue = Arc::clone(&frame_queue);
            let frame_pending = Arc::clone(&frame_pending);
            let notifier = notifier.clone();
            appsink.set_callbacks(
                gstreamer_app::AppSinkCallbacks::builder()
                    .new_sample(move |appsink| {
                        let flow = handle_sample(appsink, &frame_queue);
                        if !frame_queue.is_empty() && !frame_pending.swap(true, Ordering::AcqRel)
                        {
                            notifier.notify(PlaybackEventKind::FrameReady);
                        }
                        flow
                    })
                    .build(),
            );
        }

        let bus = playbin
            .bus()
            .ok_or_else(|| backend_error("pipeline has no bus"))?;
        let prepared = AtomicBool::new(false);
        bus.set_sync_handler(move |_, msg| {
            use gstreamer::MessageView;

            match msg.view() {
                MessageView::AsyncDone(_) => {
                    if !prepared.swap(true, Ordering::AcqRel) {
                        notifier.notify(PlaybackEventKind::Prepared);
                    }
                }
                MessageView::Eos(_) => notifier.notify(PlaybackEventKind::Completed),
                MessageView::Error(err) => {
                    notifier.notify(PlaybackEventKind::Error(PlaybackFailure {
                        what: err.error().to_string(),
                        extra: err.debug().map(|debug| debug.to_string()).unwrap_or_default(),
                    }));
                }
                MessageView::Warning(warning) => {
                    warn!(
                        src = ?warning.src().map(|s| s.path_string()),
                        error = %warning.error(),
                        "GStreamer pipeline warning"
                    );
                }
                _ => {}
            }

            gstreamer::BusSyncReply::Drop
        });

        debug!(%uri, width, height, "Creating GStreamer video pipeline");

        self.pipeline = Some(Pipeline {
            playbin,
            size_filter,
            frame_queue,
            frame_pending,
        });

        if let Err(why) = self.set_state(gstreamer::State::Paused) {
            self.release();
            return Err(why);
        }

        Ok(())
    }

    fn play(&mut self) -> Result<(), PlaybackError> {
        self.set_state(gstreamer::State::Playing)
    }

    fn pause(&mut self) -> Result<(), PlaybackError> {
        self.set_state(gstreamer::State::Paused)
    }

    fn seek_to_start(&mut self) -> Result<(), PlaybackError> {
        let seek_flags = gstreamer::SeekFlags::FLUSH | gstreamer::SeekFlags::KEY_UNIT;

        self.pipeline()?
            .playbin
            .seek_simple(seek_flags, gstreamer::ClockTime::ZERO)
            .map_err(backend_error)
    }

    fn set_volume(&mut self, volume: f64) {
        if let Some(pipeline) = &self.pipeline {
            let volume = volume.clamp(0.0, 1.0);
            pipeline.playbin.set_property("volume", volume);
            pipeline.playbin.set_property("mute", volume == 0.0);
        }
    }

    fn set_target_size(&mut self, width: u32, height: u32) {
        if let Some(pipeline) = &self.pipeline {
            debug!(width, height, "Rescaling video output");
            pipeline
                .size_filter
                .set_property("caps", &frame_caps(width, height));
        }
    }

    fn take_frame(&mut self) -> Option<VideoFrame> {
        let pipeline = self.pipeline.as_ref()?;
        pipeline.frame_pending.store(false, Ordering::Release);
        pipeline.frame_queue.take_latest()
    }

    fn release(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };

        pipeline.frame_queue.stop();

        if let Some(bus) = pipeline.playbin.bus() {
            bus.unset_sync_handler();
        }

        if let Err(why) = pipeline.playbin.set_state(gstreamer::State::Null) {
            error!(?why, "Failed to stop video pipeline");
        }

        let stats = pipeline.frame_queue.stats();
        debug!(
            pushed = stats.pushed,
            taken = stats.taken,
            dropped = stats.dropped,
            "Video pipeline released"
        );
    }
}

impl Drop for VideoPlayer {
    fn drop(&mut self) {
        self.release();
    }
}
