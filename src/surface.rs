// SPDX-License-Identifier: MPL-2.0

//! The externally owned drawable target an engine renders into.
//!
//! The host owns the real surface. An engine only holds a [`SurfaceHandle`]
//! between the matching created and destroyed events, and every draw goes
//! through a [`CanvasGuard`] so the canvas is always handed back to the host.

use std::{
    fmt,
    ops::{Deref, DerefMut},
};

/// Identity of a host surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface-{}", self.0)
    }
}

/// Pixel format reported by the host when a surface changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceFormat {
    Xrgb8888,
}

#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("surface has no drawable area")]
    Empty,
    #[error("failed to acquire canvas: {0}")]
    Acquire(String),
}

/// CPU-side canvas in little-endian XRGB8888.
#[derive(Debug, Default)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixels: Vec<u8>,
}

impl Canvas {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width * 4;
        Self {
            width,
            height,
            stride,
            pixels: vec![0; stride as usize * height as usize],
        }
    }
}

/// Host side of a surface: hands out a canvas and publishes it afterwards.
pub trait DrawTarget {
    fn lock_canvas(&mut self, width: u32, height: u32) -> Result<Canvas, SurfaceError>;

    /// Publish the painted canvas. Called exactly once per successful lock.
    fn unlock_canvas_and_post(&mut self, canvas: Canvas);
}

pub struct SurfaceHandle {
    id: SurfaceId,
    width: u32,
    height: u32,
    target: Box<dyn DrawTarget>,
}

impl fmt::Debug for SurfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceHandle")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl SurfaceHandle {
    pub fn new(id: SurfaceId, width: u32, height: u32, target: Box<dyn DrawTarget>) -> Self {
        Self {
            id,
            width,
            height,
            target,
        }
    }

    #[must_use]
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn set_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    /// Acquire the canvas. It is posted back to the host when the guard drops.
    pub fn lock_canvas(&mut self) -> Result<CanvasGuard<'_>, SurfaceError> {
        if self.width == 0 || self.height == 0 {
            return Err(SurfaceError::Empty);
        }

        let canvas = self.target.lock_canvas(self.width, self.height)?;
        Ok(CanvasGuard {
            target: self.target.as_mut(),
            canvas,
        })
    }

    /// Lock, paint and post in one step.
    pub fn draw(&mut self, paint: impl FnOnce(&mut Canvas)) -> Result<(), SurfaceError> {
        let mut canvas = self.lock_canvas()?;
        paint(&mut canvas);
        Ok(())
    }
}

/// A locked canvas. Dropping it posts the canvas, on every exit path.
pub struct CanvasGuard<'a> {
    target: &'a mut dyn DrawTarget,
    canvas: Canvas,
}

impl Deref for CanvasGuard<'_> {
    type Target = Canvas;

    fn deref(&self) -> &Canvas {
        &self.canvas
    }
}

impl DerefMut for CanvasGuard<'_> {
    fn deref_mut(&mut self) -> &mut Canvas {
        &mut self.canvas
    }
}

impl Drop for CanvasGuard<'_> {
    fn drop(&mut self) {
        let canvas = std::mem::take(&mut self.canvas);
        self.target.unlock_canvas_and_post(canvas);
    }
}
