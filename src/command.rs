// SPDX-License-Identifier: MPL-2.0

//! Commands that re-enter an engine from outside its own call stack.
//!
//! Worker threads and timers never touch engine state. They send an
//! [`EngineCommand`] through a [`CommandSink`] and the event loop hands it to
//! the owning engine.

use std::{fmt, sync::Arc};

use image::RgbaImage;

use crate::{playback::PlaybackEvent, redraw::TimerToken};

#[derive(Debug)]
pub enum EngineCommand {
    Playback(PlaybackEvent),
    RasterReady {
        generation: u64,
        result: Result<RgbaImage, String>,
    },
    RedrawTick(TimerToken),
}

/// Thread-safe sender of commands addressed to one engine.
#[derive(Clone)]
pub struct CommandSink(Arc<dyn Fn(EngineCommand) + Send + Sync>);

impl fmt::Debug for CommandSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CommandSink")
    }
}

impl CommandSink {
    pub fn new(send: impl Fn(EngineCommand) + Send + Sync + 'static) -> Self {
        Self(Arc::new(send))
    }

    pub fn send(&self, command: EngineCommand) {
        (self.0)(command);
    }
}
