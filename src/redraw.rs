// SPDX-License-Identifier: MPL-2.0

//! Periodic redraw of a still image.
//!
//! The loop draws, then arms a one-shot timer for the next draw. Each tick
//! re-arms it while the surface is visible, so there is never more than one
//! pending redraw and no thread or recursion is involved.

use std::{collections::HashMap, sync::Arc, time::Duration};

use image::RgbaImage;
use sctk::reexports::calloop::{
    LoopHandle, RegistrationToken,
    timer::{TimeoutAction, Timer},
};

use crate::{
    command::{CommandSink, EngineCommand},
    draw,
    surface::{SurfaceError, SurfaceHandle},
};

/// Identifies one armed redraw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

#[derive(Debug, thiserror::Error)]
#[error("failed to schedule redraw: {0}")]
pub struct ScheduleError(pub String);

/// Arms and disarms one-shot timers that come back as [`EngineCommand::RedrawTick`].
pub trait RedrawScheduler {
    fn arm(&mut self, token: TimerToken, delay: Duration) -> Result<(), ScheduleError>;

    fn disarm(&mut self, token: TimerToken);

    /// The timer of `token` fired and needs no disarming.
    fn expired(&mut self, token: TimerToken);
}

/// Redraw timers on the calloop event loop.
pub struct CalloopScheduler<D: 'static> {
    handle: LoopHandle<'static, D>,
    sink: CommandSink,
    timers: HashMap<TimerToken, RegistrationToken>,
}

impl<D: 'static> CalloopScheduler<D> {
    pub fn new(handle: LoopHandle<'static, D>, sink: CommandSink) -> Self {
        Self {
            handle,
            sink,
            timers: HashMap::new(),
        }
    }
}

impl<D: 'static> RedrawScheduler for CalloopScheduler<D> {
    fn arm(&mut self, token: TimerToken, delay: Duration) -> Result<(), ScheduleError> {
        let sink = self.sink.clone();
        let registration = self
            .handle
            .insert_source(Timer::from_duration(delay), move |_, _, _| {
                sink.send(EngineCommand::RedrawTick(token));
                TimeoutAction::Drop
            })
            .map_err(|why| ScheduleError(why.error.to_string()))?;

        self.timers.insert(token, registration);
        Ok(())
    }

    fn disarm(&mut self, token: TimerToken) {
        if let Some(registration) = self.timers.remove(&token) {
            self.handle.remove(registration);
        }
    }

    fn expired(&mut self, token: TimerToken) {
        self.timers.remove(&token);
    }
}

impl<D: 'static> Drop for CalloopScheduler<D> {
    fn drop(&mut self) {
        for (_, registration) in self.timers.drain() {
            self.handle.remove(registration);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// No raster has been started yet.
    Idle,
    Running,
    Stopped,
}

/// Interval between redraws for `fps`. Zero falls back to the default cadence.
#[must_use]
pub fn interval_for(fps: u32) -> Duration {
    let fps = if fps == 0 {
        video_wallpaper_config::DEFAULT_FRAME_RATE
    } else {
        fps
    };
    Duration::from_millis(u64::from(1000 / fps).max(1))
}

pub struct ImageRedrawLoop {
    raster: Option<Arc<RgbaImage>>,
    interval: Duration,
    pending: Option<TimerToken>,
    next_token: u64,
    scheduler: Box<dyn RedrawScheduler>,
    state: LoopState,
}

impl ImageRedrawLoop {
    pub fn new(scheduler: Box<dyn RedrawScheduler>) -> Self {
        Self {
            raster: None,
            interval: interval_for(0),
            pending: None,
            next_token: 0,
            scheduler,
            state: LoopState::Idle,
        }
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state
    }

    #[must_use]
    pub fn pending(&self) -> Option<TimerToken> {
        self.pending
    }

    /// Draw `raster` now and, while visible, schedule the next draw.
    pub fn start(
        &mut self,
        raster: Arc<RgbaImage>,
        surface: &mut SurfaceHandle,
        fps: u32,
        visible: bool,
    ) {
        self.raster = Some(raster);
        self.interval = interval_for(fps);
        self.state = LoopState::Running;

        tracing::debug!(surface = %surface.id(), interval = ?self.interval, "starting redraw loop");

        self.draw_once(surface);
        if visible {
            self.schedule_next();
        } else {
            self.cancel_pending();
        }
    }

    /// Swap in a rescaled raster without touching the schedule.
    pub fn replace_raster(&mut self, raster: Arc<RgbaImage>) {
        self.raster = Some(raster);
    }

    /// Cancel the pending redraw. Safe when nothing is scheduled.
    pub fn stop(&mut self) {
        self.cancel_pending();
        if self.state == LoopState::Running {
            tracing::debug!("redraw loop stopped");
            self.state = LoopState::Stopped;
        }
    }

    /// Stop and forget the raster.
    pub fn release(&mut self) {
        self.stop();
        self.raster = None;
        self.state = LoopState::Idle;
    }

    /// Handle a fired timer. Returns `false` if `token` was not the pending one.
    pub fn on_tick(
        &mut self,
        token: TimerToken,
        surface: Option<&mut SurfaceHandle>,
        visible: bool,
    ) -> bool {
        if self.pending != Some(token) {
            tracing::trace!(?token, pending = ?self.pending, "stale redraw tick");
            return false;
        }

        self.pending = None;
        self.scheduler.expired(token);

        let Some(surface) = surface else {
            tracing::debug!("redraw tick without a surface");
            return true;
        };

        if self.state != LoopState::Running {
            return true;
        }

        self.draw_once(surface);
        if visible {
            self.schedule_next();
        }

        true
    }

    /// Paint the current raster onto `surface`.
    pub fn draw_once(&self, surface: &mut SurfaceHandle) {
        if let Some(raster) = self.raster.as_deref() {
            draw_raster(surface, raster);
        }
    }

    fn schedule_next(&mut self) {
        self.cancel_pending();

        self.next_token += 1;
        let token = TimerToken(self.next_token);
        match self.scheduler.arm(token, self.interval) {
            Ok(()) => self.pending = Some(token),
            Err(why) => tracing::error!(%why, "redraw loop cannot continue"),
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(token) = self.pending.take() {
            self.scheduler.disarm(token);
        }
    }
}

impl Drop for ImageRedrawLoop {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

/// Paint `raster` onto `surface`. Failures are logged.
pub fn draw_raster(surface: &mut SurfaceHandle, raster: &RgbaImage) {
    let result: Result<(), SurfaceError> =
        surface.draw(|canvas| draw::xrgb888_canvas(canvas, raster));

    if let Err(why) = result {
        tracing::warn!(surface = %surface.id(), %why, "failed to draw wallpaper");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    #[derive(Debug, Default)]
    pub struct SchedulerLog {
        pub armed: Vec<TimerToken>,
        pub disarmed: Vec<TimerToken>,
        pub delays: Vec<Duration>,
        pub max_armed: usize,
    }

    impl SchedulerLog {
        pub fn current(&self) -> Option<TimerToken> {
            self.armed.last().copied()
        }
    }

    /// Keeps track of armed timers and fails the test if two overlap.
    pub struct FakeScheduler(pub Rc<RefCell<SchedulerLog>>);

    impl RedrawScheduler for FakeScheduler {
        fn arm(&mut self, token: TimerToken, delay: Duration) -> Result<(), ScheduleError> {
            let mut log = self.0.borrow_mut();
            log.armed.push(token);
            log.delays.push(delay);
            log.max_armed = log.max_armed.max(log.armed.len());
            assert!(log.armed.len() <= 1, "more than one redraw pending");
            Ok(())
        }

        fn disarm(&mut self, token: TimerToken) {
            let mut log = self.0.borrow_mut();
            log.armed.retain(|t| *t != token);
            log.disarmed.push(token);
        }

        fn expired(&mut self, token: TimerToken) {
            self.0.borrow_mut().armed.retain(|t| *t != token);
        }
    }

    pub fn fake_scheduler() -> (Box<dyn RedrawScheduler>, Rc<RefCell<SchedulerLog>>) {
        let log = Rc::new(RefCell::new(SchedulerLog::default()));
        (Box::new(FakeScheduler(Rc::clone(&log))), log)
    }
}
