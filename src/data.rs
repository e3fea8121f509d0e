use anyhow::{ensure, Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// One training batch: low-light input, normal-light reference and illumination mask.
#[derive(Clone, Debug)]
pub struct EnhanceBatch<B: Backend> {
    pub low_light: Tensor<B, 4>,
    pub normal_light: Tensor<B, 4>,
    pub illumination_mask: Tensor<B, 4>,
}

impl<B: Backend> EnhanceBatch<B> {
    /// Check that the three tensors agree on batch size and resolution.
    pub fn validate(&self) -> Result<()> {
        let [batch, channels, height, width] = self.low_light.dims();
        ensure!(batch > 0, "batch holds no images");
        ensure!(channels == 3, "low-light image must have 3 channels, got {channels}");
        let normal = self.normal_light.dims();
        ensure!(
            normal == [batch, 3, height, width],
            "normal-light image {normal:?} does not match low-light image {:?}",
            [batch, channels, height, width]
        );
        let mask = self.illumination_mask.dims();
        ensure!(
            mask == [batch, 1, height, width],
            "illumination mask {mask:?} must be [{batch}, 1, {height}, {width}]"
        );
        Ok(())
    }

    /// Low-light image with the mask appended as a fourth channel.
    pub fn generator_input(&self) -> Tensor<B, 4> {
        Tensor::cat(
            vec![self.low_light.clone(), self.illumination_mask.clone()],
            1,
        )
    }
}

/// Paths of one low-light image and the normal-light image it is trained against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImagePair {
    pub low: PathBuf,
    pub high: PathBuf,
}

/// Directory of low-light images and a directory of normal-light images.
///
/// One epoch visits every image of the larger set once. The smaller set wraps
/// around, so the two sets need not be aligned pairs.
#[derive(Clone, Debug)]
pub struct EnhanceDataset {
    low: Vec<PathBuf>,
    high: Vec<PathBuf>,
}

impl EnhanceDataset {
    /// List `{data_dir}/low` and `{data_dir}/high` and check that every image can be read.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let low = list_images(&data_dir.join("low"))?;
        let high = list_images(&data_dir.join("high"))?;
        ensure!(!low.is_empty(), "no low-light images in {}", data_dir.display());
        ensure!(!high.is_empty(), "no normal-light images in {}", data_dir.display());
        for path in low.iter().chain(&high) {
            image::image_dimensions(path)
                .with_context(|| format!("unreadable image {}", path.display()))?;
        }
        log::info!(
            "low-light images -> {}, normal-light images -> {}",
            low.len(),
            high.len()
        );
        Ok(Self { low, high })
    }
}

impl Dataset<ImagePair> for EnhanceDataset {
    fn get(&self, index: usize) -> Option<ImagePair> {
        if index >= self.len() {
            return None;
        }
        Some(ImagePair {
            low: self.low[index % self.low.len()].clone(),
            high: self.high[index % self.high.len()].clone(),
        })
    }

    fn len(&self) -> usize {
        self.low.len().max(self.high.len())
    }
}

/// Decodes image pairs, resizes them to `image_size` and stacks them into an [`EnhanceBatch`].
#[derive(Clone, Debug)]
pub struct EnhanceBatcher {
    image_size: u32,
}

impl EnhanceBatcher {
    pub fn new(image_size: usize) -> Self {
        Self {
            image_size: image_size as u32,
        }
    }

    fn load_pair(&self, pair: &ImagePair) -> Result<(RgbImage, RgbImage)> {
        Ok((
            load_resized(&pair.low, self.image_size)?,
            load_resized(&pair.high, self.image_size)?,
        ))
    }
}

impl<B: Backend> Batcher<B, ImagePair, EnhanceBatch<B>> for EnhanceBatcher {
    /// Pairs that fail to decode are logged and left out of the batch.
    fn batch(&self, items: Vec<ImagePair>, device: &B::Device) -> EnhanceBatch<B> {
        let size = self.image_size as usize;
        let hw = size * size;
        let mut low = Vec::with_capacity(items.len() * 3 * hw);
        let mut high = Vec::with_capacity(items.len() * 3 * hw);
        let mut mask = Vec::with_capacity(items.len() * hw);
        let mut batch_size = 0;

        for pair in &items {
            let (low_img, high_img) = match self.load_pair(pair) {
                Ok(images) => images,
                Err(err) => {
                    log::error!("skipping {}: {err:#}", pair.low.display());
                    continue;
                }
            };
            let low_chw = image_to_chw(&low_img);
            mask.extend(illumination_mask(&low_chw, hw));
            low.extend(low_chw);
            high.extend(image_to_chw(&high_img));
            batch_size += 1;
        }

        EnhanceBatch {
            low_light: Tensor::from_data(TensorData::new(low, [batch_size, 3, size, size]), device),
            normal_light: Tensor::from_data(
                TensorData::new(high, [batch_size, 3, size, size]),
                device,
            ),
            illumination_mask: Tensor::from_data(
                TensorData::new(mask, [batch_size, 1, size, size]),
                device,
            ),
        }
    }
}

/// Open `path` as RGB and resize it to `size × size` unless it already is.
pub fn load_resized(path: &Path, size: u32) -> Result<RgbImage> {
    let img = image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgb8();
    if img.width() == size && img.height() == size {
        return Ok(img);
    }
    Ok(image::imageops::resize(
        &img,
        size,
        size,
        image::imageops::FilterType::CatmullRom,
    ))
}

/// Turn a single image into a one-sample input batch, mask included.
pub fn single_image_batch<B: Backend>(
    img: &RgbImage,
    device: &B::Device,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let (width, height) = img.dimensions();
    let (width, height) = (width as usize, height as usize);
    let chw = image_to_chw(img);
    let mask = illumination_mask(&chw, width * height);
    (
        Tensor::from_data(TensorData::new(chw, [1, 3, height, width]), device),
        Tensor::from_data(TensorData::new(mask, [1, 1, height, width]), device),
    )
}

/// Per-pixel darkness `1 - luminance`, from CHW values in [-1, 1], giving values in [0, 1].
pub fn illumination_mask(chw: &[f32], hw: usize) -> Vec<f32> {
    (0..hw)
        .map(|idx| {
            let r = (chw[idx] + 1.0) * 0.5;
            let g = (chw[hw + idx] + 1.0) * 0.5;
            let b = (chw[2 * hw + idx] + 1.0) * 0.5;
            1.0 - (0.299 * r + 0.587 * g + 0.114 * b)
        })
        .collect()
}

/// Convert RGB image data to CHW floats normalized to [-1, 1].
pub fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for (x, y, pixel) in img.enumerate_pixels() {
        let idx = (y * width + x) as usize;
        out[idx] = (pixel[0] as f32 / 127.5) - 1.0;
        out[hw + idx] = (pixel[1] as f32 / 127.5) - 1.0;
        out[2 * hw + idx] = (pixel[2] as f32 / 127.5) - 1.0;
    }

    out
}

/// Image files directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/*", dir.display());
    let mut paths: Vec<_> = glob::glob(&pattern)
        .with_context(|| format!("invalid image directory {}", dir.display()))?
        .filter_map(Result::ok)
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}
