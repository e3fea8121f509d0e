use crate::model::layers::{init_conv, Norm, NormType};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Initializer, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

const KERNEL: usize = 4;
const PADDING: usize = 2;
const MAX_WIDTH_MULT: usize = 8;

/// Which images a critic judges.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum CriticRole {
    /// Whole generated images.
    Global,
    /// Random square crops.
    Patch,
}

/// Configuration for the PatchGAN-style critic.
#[derive(Config, Debug)]
pub struct CriticConfig {
    pub role: CriticRole,
    /// Number of stride-2 convolutions.
    pub num_layers: usize,
    /// Channel width of the first convolution ("ndf").
    pub filters: usize,
    pub norm_type: NormType,
    #[config(default = "Initializer::Normal { mean: 0.0, std: 0.02 }")]
    pub initializer: Initializer,
}

/// Convolutional critic returning a spatial map of realism scores.
#[derive(Module, Debug)]
pub struct Critic<B: Backend> {
    convs: Vec<Conv2d<B>>,
    norms: Vec<Norm<B>>,
    head: Conv2d<B>,
}

impl CriticConfig {
    /// Initialize the critic layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Critic<B> {
        let ndf = self.filters;
        let num_layers = self.num_layers.max(1);
        let mut convs = Vec::with_capacity(num_layers + 1);
        let mut norms = Vec::with_capacity(num_layers);

        // No normalization on the first layer.
        convs.push(self.conv(3, ndf, 2, device));

        let mut mult = 1;
        for n in 1..num_layers {
            let prev = mult;
            mult = width_mult(n);
            convs.push(self.conv(ndf * prev, ndf * mult, 2, device));
            norms.push(self.norm_type.init(ndf * mult, device));
        }

        let prev = mult;
        mult = width_mult(num_layers);
        convs.push(self.conv(ndf * prev, ndf * mult, 1, device));
        norms.push(self.norm_type.init(ndf * mult, device));

        let head = self.conv(ndf * mult, 1, 1, device);

        Critic { convs, norms, head }
    }

    /// Side length of the score map produced for a square input of side `input`.
    pub fn output_size(&self, input: usize) -> usize {
        let num_layers = self.num_layers.max(1);
        let mut size = input;
        for _ in 0..num_layers {
            size = conv_out(size, KERNEL, 2, PADDING);
        }
        size = conv_out(size, KERNEL, 1, PADDING);
        conv_out(size, KERNEL, 1, PADDING)
    }

    fn conv<B: Backend>(
        &self,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        device: &B::Device,
    ) -> Conv2d<B> {
        let config = Conv2dConfig::new([in_channels, out_channels], [KERNEL, KERNEL])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(PADDING, PADDING));
        init_conv(config, &self.initializer, device)
    }
}

impl<B: Backend> Critic<B> {
    /// Score a `[batch, 3, H, W]` image batch; no pooling and no sigmoid.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = leaky_relu(self.convs[0].forward(images), 0.2);
        for (conv, norm) in self.convs[1..].iter().zip(&self.norms) {
            x = leaky_relu(norm.forward(conv.forward(x)), 0.2);
        }
        self.head.forward(x)
    }
}

fn width_mult(layer: usize) -> usize {
    (1usize << layer.min(3)).min(MAX_WIDTH_MULT)
}

fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn critic_config(role: CriticRole, num_layers: usize) -> CriticConfig {
        CriticConfig::new(role, num_layers, 2, NormType::Batch)
    }

    fn score_map_side(config: &CriticConfig, input: usize) -> usize {
        let critic: Critic<TestBackend> = config.init(&Default::default());
        let images = Tensor::random(
            [2, 3, input, input],
            Distribution::Uniform(-1.0, 1.0),
            &Default::default(),
        );
        let scores = critic.forward(images);
        let [batch, channels, height, width] = scores.dims();
        assert_eq!((batch, channels), (2, 1));
        assert_eq!(height, width);
        height
    }

    #[test]
    fn global_score_map_shrinks_with_depth() {
        let shallow = critic_config(CriticRole::Global, 4);
        let deep = critic_config(CriticRole::Global, 5);
        let shallow_side = score_map_side(&shallow, 64);
        let deep_side = score_map_side(&deep, 64);
        assert_eq!(shallow_side, shallow.output_size(64));
        assert_eq!(deep_side, deep.output_size(64));
        assert!(deep_side < shallow_side);
        assert!(deep_side > 1);
    }

    #[test]
    fn patch_score_map_shrinks_with_depth() {
        let shallow = critic_config(CriticRole::Patch, 3);
        let deep = critic_config(CriticRole::Patch, 4);
        let shallow_side = score_map_side(&shallow, 32);
        let deep_side = score_map_side(&deep, 32);
        assert_eq!(shallow_side, 7);
        assert_eq!(deep_side, 5);
    }

    #[test]
    fn output_size_is_strictly_decreasing_in_layers() {
        let sizes: Vec<_> = (1..=6)
            .map(|layers| critic_config(CriticRole::Global, layers).output_size(256))
            .collect();
        assert!(sizes.windows(2).all(|pair| pair[1] < pair[0]));
        assert_eq!(sizes[4], 11);
    }

    #[test]
    fn conv_biases_start_at_zero() {
        let critic: Critic<TestBackend> =
            critic_config(CriticRole::Patch, 3).init(&Default::default());
        for conv in critic.convs.iter().chain(std::iter::once(&critic.head)) {
            let bias = conv.bias.as_ref().unwrap().val();
            assert_eq!(bias.abs().sum().into_scalar(), 0.0);
        }
    }

    #[test]
    fn channel_width_is_capped() {
        assert_eq!(width_mult(1), 2);
        assert_eq!(width_mult(3), 8);
        assert_eq!(width_mult(6), 8);
    }
}
