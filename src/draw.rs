// SPDX-License-Identifier: MPL-2.0

use image::RgbaImage;

use crate::{playback::VideoFrame, surface::Canvas};

/// Draws the image on an 8-bit canvas, anchored at the top left corner.
///
/// Parts of the image outside the canvas are clipped and uncovered canvas
/// area is cleared to black.
pub fn xrgb888_canvas(canvas: &mut Canvas, image: &RgbaImage) {
    let stride = canvas.stride as usize;
    let width = canvas.width.min(image.width()) as usize;
    let height = canvas.height.min(image.height()) as usize;

    if width < canvas.width as usize || height < canvas.height as usize {
        canvas.pixels.fill(0);
    }

    for (y, row) in image.rows().take(height).enumerate() {
        let line = &mut canvas.pixels[y * stride..y * stride + width * 4];

        for (dst, pixel) in line.chunks_exact_mut(4).zip(row) {
            let [r, g, b, _] = pixel.0;

            let r = u32::from(r) << 16;
            let g = u32::from(g) << 8;
            let b = u32::from(b);

            dst.copy_from_slice(&(r | g | b).to_le_bytes());
        }
    }
}

/// Copies a decoded BGRx frame onto the canvas row by row.
///
/// BGRx in memory is XRGB8888 little-endian, so rows copy without conversion.
pub fn video_frame_canvas(canvas: &mut Canvas, frame: &VideoFrame) {
    let stride = canvas.stride as usize;
    let frame_stride = frame.stride as usize;
    let row_len = canvas.width.min(frame.width) as usize * 4;
    let height = canvas.height.min(frame.height) as usize;

    if row_len < canvas.width as usize * 4 || height < canvas.height as usize {
        canvas.pixels.fill(0);
    }

    for y in 0..height {
        let Some(src) = frame
            .data
            .get(y * frame_stride..)
            .filter(|src| src.len() >= row_len)
        else {
            tracing::trace!(row = y, "video frame shorter than its geometry");
            break;
        };
        canvas.pixels[y * stride..y * stride + row_len].copy_from_slice(&src[..row_len]);
    }
}
