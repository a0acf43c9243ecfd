use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{anyhow, Context, Result};

use crate::color::ImageSample;

/// Decodes every file on its own thread and joins them in input order. The
/// first failure (in input order) is returned.
pub fn load_image_samples(paths: &[PathBuf]) -> Result<Vec<ImageSample>> {
    thread::scope(|scope| {
        let handles: Vec<_> = paths
            .iter()
            .map(|path| scope.spawn(move || load_image_sample(path)))
            .collect();
        handles
            .into_iter()
            .zip(paths)
            .map(|(handle, path)| {
                handle
                    .join()
                    .map_err(|_| anyhow!("decoder thread panicked for {}", path.display()))?
            })
            .collect()
    })
}

pub fn load_image_sample(path: &Path) -> Result<ImageSample> {
    let bytes = std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    decode_image_bytes(&bytes).with_context(|| format!("failed decoding {}", path.display()))
}

pub fn decode_image_bytes(bytes: &[u8]) -> Result<ImageSample> {
    let image = image::load_from_memory(bytes).context("unsupported or corrupt image data")?;
    Ok(image.to_rgba8())
}
