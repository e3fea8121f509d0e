use anyhow::{bail, Context, Result};
use burn::prelude::*;
use image::{GenericImage, Rgb, RgbImage};
use std::path::Path;

/// Map a [-1, 1] value back to a byte.
pub fn to_byte(value: f32) -> u8 {
    (((value + 1.0) * 0.5).clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Convert a `[batch, 3, H, W]` tensor in [-1, 1] to RGB images.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 3 {
        bail!("expected 3 channels for images, got {channels}");
    }

    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("failed to read tensor data as f32: {err:?}"))?;
    let hw = height * width;

    let images = (0..batch)
        .map(|b| {
            let base = b * channels * hw;
            RgbImage::from_fn(width as u32, height as u32, |x, y| {
                let idx = base + y as usize * width + x as usize;
                Rgb([
                    to_byte(values[idx]),
                    to_byte(values[idx + hw]),
                    to_byte(values[idx + 2 * hw]),
                ])
            })
        })
        .collect();

    Ok(images)
}

/// Concatenate images horizontally, top-aligned.
pub fn concat_images_horiz(images: &[RgbImage]) -> Result<RgbImage> {
    if images.is_empty() {
        bail!("no images to concatenate");
    }
    let height = images.iter().map(|img| img.height()).max().unwrap_or(0);
    let total_width: u32 = images.iter().map(|img| img.width()).sum();
    let mut out = RgbImage::new(total_width, height);

    let mut offset_x = 0;
    for img in images {
        out.copy_from(img, offset_x, 0)
            .context("failed to concatenate image")?;
        offset_x += img.width();
    }

    Ok(out)
}

/// Save a horizontal concatenation of images to disk.
pub fn save_concat_images(images: &[RgbImage], path: &Path) -> Result<()> {
    let output = concat_images_horiz(images)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    output
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

/// Save the first sample of each named visual side by side, labelled by `step`.
pub fn save_visual_strip<B: Backend>(
    visuals: Vec<(&'static str, Tensor<B, 4>)>,
    dir: &Path,
    step: usize,
) -> Result<()> {
    let mut strip = Vec::with_capacity(visuals.len());
    for (name, tensor) in visuals {
        let first = tensor.slice_dim(0, 0..1);
        let image = tensor_to_images(first)?
            .into_iter()
            .next()
            .with_context(|| format!("visual {name} is empty"))?;
        strip.push(image);
    }
    save_concat_images(&strip, &dir.join(format!("step_{step:08}.png")))
}
