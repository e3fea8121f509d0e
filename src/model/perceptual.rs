//! Frozen VGG16 features used as a perceptual comparator.

use crate::model::layers::instance_norm;
use anyhow::{Context, Result};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, Recorder};
use burn::tensor::activation::relu;
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use std::path::Path;

/// Configuration for the VGG16 trunk.
#[derive(Config, Debug)]
pub struct VggConfig {
    /// Width of the first stage. Pretrained weights require 64.
    #[config(default = 64)]
    pub base_channels: usize,
}

/// VGG16 convolutions up to `relu5_1`.
///
/// Field names match the keys of the pretrained state dict.
#[derive(Module, Debug)]
pub struct Vgg16Features<B: Backend> {
    conv1_1: Conv2d<B>,
    conv1_2: Conv2d<B>,
    conv2_1: Conv2d<B>,
    conv2_2: Conv2d<B>,
    conv3_1: Conv2d<B>,
    conv3_2: Conv2d<B>,
    conv3_3: Conv2d<B>,
    conv4_1: Conv2d<B>,
    conv4_2: Conv2d<B>,
    conv4_3: Conv2d<B>,
    conv5_1: Conv2d<B>,
    pool: MaxPool2d,
}

impl VggConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Vgg16Features<B> {
        let c = self.base_channels;
        Vgg16Features {
            conv1_1: conv3x3(3, c, device),
            conv1_2: conv3x3(c, c, device),
            conv2_1: conv3x3(c, c * 2, device),
            conv2_2: conv3x3(c * 2, c * 2, device),
            conv3_1: conv3x3(c * 2, c * 4, device),
            conv3_2: conv3x3(c * 4, c * 4, device),
            conv3_3: conv3x3(c * 4, c * 4, device),
            conv4_1: conv3x3(c * 4, c * 8, device),
            conv4_2: conv3x3(c * 8, c * 8, device),
            conv4_3: conv3x3(c * 8, c * 8, device),
            conv5_1: conv3x3(c * 8, c * 8, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }
}

impl<B: Backend> Vgg16Features<B> {
    /// Activation after `relu5_1`, at 1/8 of the input resolution.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.conv1_1.forward(x));
        let x = relu(self.conv1_2.forward(x));
        let x = self.pool.forward(x);

        let x = relu(self.conv2_1.forward(x));
        let x = relu(self.conv2_2.forward(x));
        let x = self.pool.forward(x);

        let x = relu(self.conv3_1.forward(x));
        let x = relu(self.conv3_2.forward(x));
        let x = relu(self.conv3_3.forward(x));
        let x = self.pool.forward(x);

        let x = relu(self.conv4_1.forward(x));
        let x = relu(self.conv4_2.forward(x));
        let x = relu(self.conv4_3.forward(x));

        relu(self.conv5_1.forward(x))
    }
}

/// Image-to-feature function backed by a VGG16 trunk whose weights never change.
///
/// The trunk is private and marked `no_grad`, so it cannot be handed to an optimizer.
#[derive(Debug, Clone)]
pub struct PerceptualExtractor<B: Backend> {
    vgg: Vgg16Features<B>,
}

impl<B: Backend> PerceptualExtractor<B> {
    /// Load pretrained weights from a PyTorch state dict.
    pub fn from_pretrained(config: &VggConfig, path: &Path, device: &B::Device) -> Result<Self> {
        let record = PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(LoadArgs::new(path.to_path_buf()), device)
            .with_context(|| format!("failed to load VGG weights from {}", path.display()))?;
        let vgg = config.init::<B>(device).load_record(record);
        log::info!("loaded perceptual weights from {}", path.display());
        Ok(Self::freeze(vgg))
    }

    /// Randomly initialized trunk, still frozen.
    pub fn untrained(config: &VggConfig, device: &B::Device) -> Self {
        Self::freeze(config.init(device))
    }

    fn freeze(vgg: Vgg16Features<B>) -> Self {
        Self { vgg: vgg.no_grad() }
    }

    /// Feature map of an image batch in [-1, 1].
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.vgg.forward(vgg_preprocess(images))
    }

    pub fn num_params(&self) -> usize {
        self.vgg.num_params()
    }
}

/// RGB in [-1, 1] to BGR in [0, 255], the range the pretrained trunk expects.
pub fn vgg_preprocess<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let r = images.clone().slice_dim(1, 0..1);
    let g = images.clone().slice_dim(1, 1..2);
    let b = images.slice_dim(1, 2..3);
    Tensor::cat(vec![b, g, r], 1).add_scalar(1.0).mul_scalar(127.5)
}

/// Mean squared distance between instance-normalized feature maps.
pub fn perceptual_loss<B: Backend>(
    extractor: &PerceptualExtractor<B>,
    image: Tensor<B, 4>,
    target: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let image_features = instance_norm(extractor.features(image));
    let target_features = instance_norm(extractor.features(target));
    image_features.sub(target_features).square().mean()
}

fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn extractor<B: Backend>() -> PerceptualExtractor<B> {
        PerceptualExtractor::untrained(&VggConfig::new().with_base_channels(4), &Default::default())
    }

    #[test]
    fn preprocess_swaps_channels_and_rescales() {
        let data = TensorData::new(vec![-1.0f32, 0.0, 1.0], [1, 3, 1, 1]);
        let images = Tensor::<TestBackend, 4>::from_data(data, &Default::default());
        let out = vgg_preprocess(images).into_data().to_vec::<f32>().unwrap();
        assert_eq!(out, vec![255.0, 127.5, 0.0]);
    }

    #[test]
    fn features_are_eighth_resolution() {
        let features = extractor::<TestBackend>().features(Tensor::zeros([2, 3, 32, 32], &Default::default()));
        assert_eq!(features.dims(), [2, 32, 4, 4]);
    }

    #[test]
    fn identical_images_have_zero_loss() {
        let extractor = extractor::<TestBackend>();
        let image = Tensor::<TestBackend, 4>::random(
            [1, 3, 32, 32],
            Distribution::Uniform(-1.0, 1.0),
            &Default::default(),
        );
        let same = perceptual_loss(&extractor, image.clone(), image.clone()).into_scalar();
        let other = Tensor::random(
            [1, 3, 32, 32],
            Distribution::Uniform(-1.0, 1.0),
            &Default::default(),
        );
        let different = perceptual_loss(&extractor, image, other).into_scalar();
        assert_eq!(same, 0.0);
        assert!(different > 0.0);
    }

    #[test]
    fn gradients_reach_the_image_but_not_the_trunk() {
        let extractor = extractor::<TestAutodiffBackend>();
        let device = Default::default();
        let image = Tensor::<TestAutodiffBackend, 4>::random(
            [1, 3, 16, 16],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        )
        .require_grad();
        let target = Tensor::random([1, 3, 16, 16], Distribution::Uniform(-1.0, 1.0), &device);
        let grads = perceptual_loss(&extractor, image.clone(), target).backward();
        assert!(image.grad(&grads).is_some());
        assert!(extractor.vgg.conv1_1.weight.grad(&grads).is_none());
    }
}
