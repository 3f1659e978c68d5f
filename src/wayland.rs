// SPDX-License-Identifier: MPL-2.0

//! Wayland host: one background layer and one engine per output.

use std::{cell::RefCell, rc::Rc, sync::Mutex};

use eyre::{Context, eyre};
use sctk::{
    compositor::{CompositorHandler, CompositorState},
    delegate_compositor, delegate_layer, delegate_output, delegate_registry, delegate_shm,
    output::{OutputHandler, OutputState},
    reexports::{
        calloop::{self, LoopHandle, channel},
        calloop_wayland_source::WaylandSource,
        client::{
            Connection, QueueHandle,
            globals::registry_queue_init,
            protocol::{
                wl_output::{self, WlOutput},
                wl_shm, wl_surface,
            },
        },
    },
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
    shell::{
        WaylandSurface,
        wlr_layer::{
            Anchor, KeyboardInteractivity, Layer, LayerShell, LayerShellHandler, LayerSurface,
            LayerSurfaceConfigure,
        },
    },
    shm::{Shm, ShmHandler, slot::SlotPool},
};
use video_wallpaper_config::Config;

use crate::{
    command::{CommandSink, EngineCommand},
    engine::{EnginePorts, WallpaperEngine, WallpaperEventHandler},
    error::EngineError,
    playback,
    power::{PowerEvent, PowerStateMonitor, SIGNALS},
    raster::WorkerRasterSource,
    redraw::CalloopScheduler,
    surface::{Canvas, DrawTarget, SurfaceError, SurfaceFormat, SurfaceHandle, SurfaceId},
    watch::{self, SelectionStamp},
};

/// A background layer on one output, with the engine drawing into it.
struct HostLayer {
    layer: LayerSurface,
    wl_output: WlOutput,
    surface_id: SurfaceId,
    engine_id: u64,
    engine: WallpaperEngine,
    size: Option<(u32, u32)>,
    /// Shared with the canvas the engine holds while the surface is bound.
    presenter: Option<Rc<RefCell<LayerPresenter>>>,
}

pub struct WallpaperHost {
    registry_state: RegistryState,
    output_state: OutputState,
    compositor_state: CompositorState,
    shm_state: Shm,
    layer_state: LayerShell,
    qh: QueueHandle<WallpaperHost>,
    loop_handle: LoopHandle<'static, WallpaperHost>,
    commands: channel::Sender<(u64, EngineCommand)>,

    /// `None` when the saved selection could not be read.
    config: Option<Config>,
    /// The selection file the current engines were built from.
    stamp: Option<SelectionStamp>,
    layers: Vec<HostLayer>,
    monitor: PowerStateMonitor,
    next_surface: u64,
    next_engine: u64,
    pub exit: bool,
}

impl std::fmt::Debug for WallpaperHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WallpaperHost")
            .field("config", &self.config)
            .field("layers", &self.layers.len())
            .field("screen_is_off", &self.monitor.screen_is_off())
            .field("exit", &self.exit)
            .finish_non_exhaustive()
    }
}

impl WallpaperHost {
    /// Connect to the compositor and run until a termination signal arrives.
    pub fn run(config: Option<Config>) -> eyre::Result<()> {
        // Signals are masked per thread, so this comes before any worker spawns.
        let signals = calloop::signals::Signals::new(&SIGNALS)
            .wrap_err("failed to listen for power broadcasts")?;

        let conn = Connection::connect_to_env().wrap_err("wayland client connection failed")?;

        let mut event_loop: calloop::EventLoop<'static, WallpaperHost> =
            calloop::EventLoop::try_new().wrap_err("failed to create event loop")?;

        let (globals, event_queue) =
            registry_queue_init(&conn).wrap_err("failed to initialize registry queue")?;

        let qh = event_queue.handle();

        WaylandSource::new(conn, event_queue)
            .insert(event_loop.handle())
            .map_err(|err| err.error)
            .wrap_err("failed to insert main EventLoop into WaylandSource")?;

        event_loop
            .handle()
            .insert_source(signals, |event, _, host| host.on_signal(event.signal()))
            .map_err(|err| eyre!("failed to insert signal source: {}", err.error))?;

        let (commands, command_rx) = channel::channel::<(u64, EngineCommand)>();
        event_loop
            .handle()
            .insert_source(command_rx, |event, _, host| match event {
                channel::Event::Msg((engine_id, command)) => host.dispatch(engine_id, command),
                channel::Event::Closed => tracing::debug!("command channel closed"),
            })
            .map_err(|err| eyre!("failed to insert command channel: {}", err.error))?;

        // Keep the watcher alive for the lifetime of the loop.
        let _watcher = match watch::selection_source(&event_loop.handle()) {
            Ok(watcher) => Some(watcher),
            Err(why) => {
                tracing::warn!(?why, "selection changes will not be picked up");
                None
            }
        };

        let mut host = WallpaperHost {
            registry_state: RegistryState::new(&globals),
            output_state: OutputState::new(&globals, &qh),
            compositor_state: CompositorState::bind(&globals, &qh)
                .wrap_err("wl_compositor is not available")?,
            shm_state: Shm::bind(&globals, &qh).wrap_err("wl_shm is not available")?,
            layer_state: LayerShell::bind(&globals, &qh).wrap_err("layer shell is not available")?,
            qh,
            loop_handle: event_loop.handle(),
            commands,
            config,
            stamp: selection_stamp(),
            layers: Vec::new(),
            monitor: PowerStateMonitor::default(),
            next_surface: 0,
            next_engine: 0,
            exit: false,
        };

        loop {
            event_loop.dispatch(None, &mut host)?;

            if host.exit {
                break;
            }
        }

        host.shutdown();
        Ok(())
    }

    /// Replace every engine with one built from the saved selection.
    ///
    /// Every save rebuilds, even of an identical record, so saving again
    /// retries content that failed to play.
    pub fn reload(&mut self) {
        let stamp = selection_stamp();
        if stamp.is_some() && stamp == self.stamp {
            tracing::debug!("selection file not replaced since the last rebuild");
            return;
        }
        self.stamp = stamp;

        let config = match Config::try_load() {
            Ok(config) => Some(config),
            Err(why) => {
                tracing::warn!(%why, "failed to read the saved selection");
                None
            }
        };

        tracing::info!(?config, "selection saved, rebuilding wallpapers");
        self.config = config;

        for index in 0..self.layers.len() {
            self.detach(index);
            let (engine_id, engine) = self.build_engine();
            let layer = &mut self.layers[index];
            layer.engine_id = engine_id;
            layer.engine = engine;
            self.attach(index);
        }
    }

    fn on_signal(&mut self, signal: calloop::signals::Signal) {
        match self.monitor.on_signal(signal) {
            PowerEvent::ScreenPower { screen_is_off } => {
                for layer in &mut self.layers {
                    layer.engine.on_screen_power(screen_is_off);
                }
            }
            PowerEvent::Shutdown => self.exit = true,
            PowerEvent::Ignored => {}
        }
    }

    fn dispatch(&mut self, engine_id: u64, command: EngineCommand) {
        match self.layers.iter_mut().find(|l| l.engine_id == engine_id) {
            Some(layer) => layer.engine.handle(command),
            None => tracing::trace!(engine_id, "dropping command for a retired engine"),
        }
    }

    fn build_engine(&mut self) -> (u64, WallpaperEngine) {
        self.next_engine += 1;
        let engine_id = self.next_engine;

        let sink = {
            let commands = Mutex::new(self.commands.clone());
            CommandSink::new(move |command| {
                let Ok(commands) = commands.lock() else {
                    return;
                };
                if commands.send((engine_id, command)).is_err() {
                    tracing::trace!(engine_id, "event loop gone, dropping command");
                }
            })
        };

        let ports = EnginePorts {
            playback: playback::default_factory(),
            scheduler: Box::new(CalloopScheduler::new(self.loop_handle.clone(), sink.clone())),
            rasters: Box::new(WorkerRasterSource),
            sink,
        };

        let mut engine = match &self.config {
            Some(config) => WallpaperEngine::new(config, ports),
            None => WallpaperEngine::unavailable(ports),
        };

        if let Some(screen_is_off) = self.monitor.screen_is_off() {
            engine.on_screen_power(screen_is_off);
        }

        tracing::debug!(
            engine_id,
            kind = ?engine.content_kind(),
            state = ?engine.state(),
            "engine created"
        );
        (engine_id, engine)
    }

    fn new_layer(&mut self, wl_output: WlOutput) -> HostLayer {
        let surface = self.compositor_state.create_surface(&self.qh);

        let layer = self.layer_state.create_layer_surface(
            &self.qh,
            surface.clone(),
            Layer::Background,
            Some("wallpaper"),
            Some(&wl_output),
        );

        layer.set_anchor(Anchor::all());
        layer.set_exclusive_zone(-1);
        layer.set_keyboard_interactivity(KeyboardInteractivity::None);
        surface.commit();

        self.next_surface += 1;
        let (engine_id, engine) = self.build_engine();

        HostLayer {
            layer,
            wl_output,
            surface_id: SurfaceId(self.next_surface),
            engine_id,
            engine,
            size: None,
            presenter: None,
        }
    }

    /// Hand the configured layer to its engine as a fresh surface.
    fn attach(&mut self, index: usize) {
        let layer = &mut self.layers[index];
        let Some((width, height)) = layer.size else {
            return;
        };

        let pool = match SlotPool::new(width as usize * height as usize * 4, &self.shm_state) {
            Ok(pool) => pool,
            Err(why) => {
                tracing::error!(?why, "failed to create pool");
                layer.engine.disable(EngineError::SurfaceUnavailable);
                return;
            }
        };

        let presenter = Rc::new(RefCell::new(LayerPresenter {
            layer: layer.layer.clone(),
            pool,
            qh: self.qh.clone(),
            pacer: FramePacer::default(),
            scratch: Vec::new(),
        }));
        layer.presenter = Some(Rc::clone(&presenter));

        layer.engine.on_surface_created(SurfaceHandle::new(
            layer.surface_id,
            width,
            height,
            Box::new(LayerCanvas(presenter)),
        ));
        layer.engine.on_visibility_changed(true);
    }

    fn detach(&mut self, index: usize) {
        let layer = &mut self.layers[index];
        if layer.size.is_some() {
            layer.engine.on_visibility_changed(false);
            layer.engine.on_surface_destroyed(layer.surface_id);
        }
        layer.presenter = None;
    }

    fn remove_layer(&mut self, index: usize) {
        self.detach(index);
        let mut layer = self.layers.remove(index);
        layer.engine.destroy();
        tracing::debug!(surface = %layer.surface_id, "layer removed");
    }

    fn shutdown(&mut self) {
        while !self.layers.is_empty() {
            self.remove_layer(self.layers.len() - 1);
        }
    }
}

fn selection_stamp() -> Option<SelectionStamp> {
    Config::path()
        .ok()
        .and_then(|path| SelectionStamp::read(&path))
}

/// Size to draw at. The compositor may leave the choice to us, in which case
/// the output's logical size is used.
fn layer_size(new_size: (u32, u32), logical: Option<(i32, i32)>) -> Option<(u32, u32)> {
    match new_size {
        (0, _) | (_, 0) => {
            let (width, height) = logical?;
            let width = u32::try_from(width).ok().filter(|w| *w > 0)?;
            let height = u32::try_from(height).ok().filter(|h| *h > 0)?;
            Some((width, height))
        }
        size => Some(size),
    }
}

/// Holds presents back until the compositor asks for the next frame.
///
/// At most one frame waits, and a newer one replaces it.
#[derive(Debug)]
struct FramePacer<T> {
    waiting: bool,
    held: Option<T>,
}

impl<T> Default for FramePacer<T> {
    fn default() -> Self {
        Self {
            waiting: false,
            held: None,
        }
    }
}

impl<T> FramePacer<T> {
    /// The frame to present now, or `None` when it is held for the next callback.
    fn submit(&mut self, frame: T) -> Option<T> {
        if self.waiting {
            self.held = Some(frame);
            None
        } else {
            self.waiting = true;
            Some(frame)
        }
    }

    /// The frame callback fired. Returns the held frame, if any, to present.
    fn frame_done(&mut self) -> Option<T> {
        self.waiting = false;
        let frame = self.held.take()?;
        self.waiting = true;
        Some(frame)
    }

    /// Nothing was committed, so no callback will arrive.
    fn abandon(&mut self) {
        self.waiting = false;
    }
}

/// Shared-memory presentation of a layer surface.
struct LayerPresenter {
    layer: LayerSurface,
    pool: SlotPool,
    qh: QueueHandle<WallpaperHost>,
    pacer: FramePacer<Canvas>,
    scratch: Vec<u8>,
}

impl LayerPresenter {
    fn submit(&mut self, canvas: Canvas) {
        if let Some(canvas) = self.pacer.submit(canvas) {
            self.present(canvas);
        }
    }

    fn frame_done(&mut self) {
        if let Some(canvas) = self.pacer.frame_done() {
            self.present(canvas);
        }
    }

    fn present(&mut self, canvas: Canvas) {
        if !self.commit(&canvas) {
            self.pacer.abandon();
        }
        self.scratch = canvas.pixels;
    }

    fn commit(&mut self, canvas: &Canvas) -> bool {
        let (width, height) = (canvas.width as i32, canvas.height as i32);

        if let Err(why) = self.pool.resize(canvas.pixels.len()) {
            tracing::error!(?why, "failed to resize pool");
            return false;
        }

        let (buffer, dst) = match self.pool.create_buffer(
            width,
            height,
            canvas.stride as i32,
            wl_shm::Format::Xrgb8888,
        ) {
            Ok(buffer) => buffer,
            Err(why) => {
                tracing::error!(?why, "failed to create buffer");
                return false;
            }
        };
        dst.copy_from_slice(&canvas.pixels);

        let wl_surface = self.layer.wl_surface();
        wl_surface.damage_buffer(0, 0, width, height);

        // Request our next frame
        wl_surface.frame(&self.qh, wl_surface.clone());

        if let Err(why) = buffer.attach_to(wl_surface) {
            tracing::error!(?why, "buffer attachment failed");
            return false;
        }

        wl_surface.commit();
        true
    }
}

/// The canvas an engine draws into. Posting goes through the layer's presenter.
struct LayerCanvas(Rc<RefCell<LayerPresenter>>);

impl DrawTarget for LayerCanvas {
    fn lock_canvas(&mut self, width: u32, height: u32) -> Result<Canvas, SurfaceError> {
        let stride = width * 4;
        let mut pixels = std::mem::take(&mut self.0.borrow_mut().scratch);
        pixels.resize(stride as usize * height as usize, 0);

        Ok(Canvas {
            width,
            height,
            stride,
            pixels,
        })
    }

    fn unlock_canvas_and_post(&mut self, canvas: Canvas) {
        self.0.borrow_mut().submit(canvas);
    }
}

impl CompositorHandler for WallpaperHost {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_factor: i32,
    ) {
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_transform: wl_output::Transform,
    ) {
    }

    fn frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &wl_surface::WlSurface,
        _time: u32,
    ) {
        let presenter = self
            .layers
            .iter()
            .find(|l| l.layer.wl_surface() == surface)
            .and_then(|l| l.presenter.clone());

        if let Some(presenter) = presenter {
            presenter.borrow_mut().frame_done();
        }
    }

    fn surface_enter(
        &mut self,
        _: &Connection,
        _: &QueueHandle<Self>,
        _: &wl_surface::WlSurface,
        _: &WlOutput,
    ) {
    }

    fn surface_leave(
        &mut self,
        _: &Connection,
        _: &QueueHandle<Self>,
        _: &wl_surface::WlSurface,
        _: &WlOutput,
    ) {
    }
}

impl OutputHandler for WallpaperHost {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        wl_output: wl_output::WlOutput,
    ) {
        if self.layers.iter().any(|l| l.wl_output == wl_output) {
            return;
        }

        let name = self
            .output_state
            .info(&wl_output)
            .and_then(|info| info.name);
        tracing::debug!(?name, "new output");

        let layer = self.new_layer(wl_output);
        self.layers.push(layer);
    }

    fn update_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _output: wl_output::WlOutput,
    ) {
    }

    fn output_destroyed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        output: wl_output::WlOutput,
    ) {
        let Some(index) = self.layers.iter().position(|l| l.wl_output == output) else {
            return;
        };

        self.remove_layer(index);
    }
}

impl LayerShellHandler for WallpaperHost {
    fn closed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, layer: &LayerSurface) {
        let Some(index) = self.layers.iter().position(|l| &l.layer == layer) else {
            return;
        };

        self.remove_layer(index);
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        layer: &LayerSurface,
        configure: LayerSurfaceConfigure,
        _serial: u32,
    ) {
        let span = tracing::debug_span!("<WallpaperHost as LayerShellHandler>::configure");
        let _handle = span.enter();

        let Some(index) = self.layers.iter().position(|l| &l.layer == layer) else {
            return;
        };

        let logical = self
            .output_state
            .info(&self.layers[index].wl_output)
            .and_then(|info| info.logical_size);

        let Some((width, height)) = layer_size(configure.new_size, logical) else {
            tracing::warn!(new_size = ?configure.new_size, "no usable layer size");
            return;
        };

        let host_layer = &mut self.layers[index];
        match host_layer.size.replace((width, height)) {
            None => self.attach(index),
            Some(_) => host_layer.engine.on_surface_changed(
                host_layer.surface_id,
                SurfaceFormat::Xrgb8888,
                width,
                height,
            ),
        }
    }
}

impl ShmHandler for WallpaperHost {
    fn shm_state(&mut self) -> &mut Shm {
        &mut self.shm_state
    }
}

delegate_compositor!(WallpaperHost);
delegate_output!(WallpaperHost);
delegate_shm!(WallpaperHost);
delegate_layer!(WallpaperHost);
delegate_registry!(WallpaperHost);

impl ProvidesRegistryState for WallpaperHost {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }
    registry_handlers![OutputState];
}
