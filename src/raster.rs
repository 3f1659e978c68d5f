// SPDX-License-Identifier: MPL-2.0

//! Decoding of still images, off the event loop.

use image::{DynamicImage, ImageReader, RgbaImage, imageops::FilterType};

use crate::{
    command::{CommandSink, EngineCommand},
    content::ContentReference,
};

/// Produces a screen-sized raster and reports it as [`EngineCommand::RasterReady`].
pub trait RasterSource {
    fn request(
        &mut self,
        content: &ContentReference,
        width: u32,
        height: u32,
        generation: u64,
        sink: CommandSink,
    );
}

/// Decodes on the rayon thread pool.
#[derive(Debug, Default)]
pub struct WorkerRasterSource;

impl RasterSource for WorkerRasterSource {
    fn request(
        &mut self,
        content: &ContentReference,
        width: u32,
        height: u32,
        generation: u64,
        sink: CommandSink,
    ) {
        let content = content.clone();
        rayon::spawn(move || {
            let start = std::time::Instant::now();
            let result = load(&content, width, height);

            match &result {
                Ok(_) => tracing::debug!(
                    %content,
                    width,
                    height,
                    elapsed = ?start.elapsed(),
                    "image decoded"
                ),
                Err(why) => tracing::debug!(%content, %why, "image decode failed"),
            }

            sink.send(EngineCommand::RasterReady { generation, result });
        });
    }
}

/// Open, decode and stretch the image to exactly `width` x `height`.
pub fn load(content: &ContentReference, width: u32, height: u32) -> Result<RgbaImage, String> {
    let path = content
        .local_path()
        .ok_or_else(|| format!("unsupported scheme {:?}", content.scheme()))?;

    let image = ImageReader::open(&path)
        .map_err(|why| format!("{}: {why}", path.display()))?
        .with_guessed_format()
        .map_err(|why| format!("{}: {why}", path.display()))?
        .decode()
        .map_err(|why| format!("{}: {why}", path.display()))?;

    Ok(stretch(&image, width, height).into_rgba8())
}

/// Scale to the layer size, ignoring the aspect ratio.
pub fn stretch(image: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    if (image.width(), image.height()) == (width, height) {
        return image.clone();
    }
    image.resize_exact(width.max(1), height.max(1), FilterType::Lanczos3)
}
