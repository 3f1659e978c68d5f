// SPDX-License-Identifier: MPL-2.0

//! Live wallpaper engine: plays a video or redraws a still image on a
//! background surface, following surface lifecycle and screen power.

pub mod command;
pub mod content;
pub mod draw;
pub mod engine;
pub mod error;
pub mod playback;
pub mod power;
pub mod raster;
pub mod redraw;
pub mod surface;
pub mod watch;
pub mod wayland;
