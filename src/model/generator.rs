use crate::model::layers::{init_conv, reflect_pad, upsample_bilinear2x, Norm, NormType};
use anyhow::{ensure, Context, Result};
use burn::module::Ignored;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Initializer, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, relu};

/// Shallowest supported stack: four widening levels plus the bottleneck.
const MIN_DEPTH: usize = 5;

/// Configuration for the U-shaped residual generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    /// Number of stride-2 levels; the padded working size is `2^num_downs`.
    pub num_downs: usize,
    /// Channel width of the outermost level ("ngf").
    pub filters: usize,
    pub norm_type: NormType,
    #[config(default = "Initializer::Normal { mean: 0.0, std: 0.02 }")]
    pub initializer: Initializer,
}

/// Where a block sits in the stack; fixes which layers it owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockPosition {
    Outermost,
    Intermediate,
    Innermost,
}

/// One encoder/decoder level of the generator.
///
/// Blocks do not own their inner level. The generator keeps them outermost
/// first in a flat list and hands each block the slice of levels below it,
/// so the last block is always the innermost one.
#[derive(Module, Debug)]
pub struct SkipBlock<B: Backend> {
    down_conv: Conv2d<B>,
    down_norm: Option<Norm<B>>,
    up_conv: Option<Conv2d<B>>,
    up_norm: Option<Norm<B>>,
    position: Ignored<BlockPosition>,
}

impl<B: Backend> SkipBlock<B> {
    fn new(
        outer_channels: usize,
        inner_channels: usize,
        position: BlockPosition,
        config: &GeneratorConfig,
        device: &B::Device,
    ) -> Self {
        let down_conv = down_conv(outer_channels, inner_channels, &config.initializer, device);
        let norm = |channels: usize| -> Norm<B> { config.norm_type.init(channels, device) };
        let (down_norm, up_conv, up_norm) = match position {
            BlockPosition::Outermost => (
                None,
                Some(up_conv(inner_channels * 2, outer_channels, &config.initializer, device)),
                None,
            ),
            BlockPosition::Intermediate => (
                Some(norm(inner_channels)),
                Some(up_conv(inner_channels * 2, outer_channels, &config.initializer, device)),
                Some(norm(outer_channels)),
            ),
            BlockPosition::Innermost => (None, None, Some(norm(outer_channels))),
        };

        Self {
            down_conv,
            down_norm,
            up_conv,
            up_norm,
            position: Ignored(position),
        }
    }

    pub fn position(&self) -> BlockPosition {
        *self.position
    }

    /// Run this level and every level in `inner`, returning the output and the untouched mask.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        mask: Tensor<B, 4>,
        inner: &[SkipBlock<B>],
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let down = self.down(x.clone());
        let latent = match inner.split_first() {
            Some((next, rest)) => next.forward(down, mask.clone(), rest).0,
            None => down,
        };
        let up = self.up(latent);

        match self.position() {
            BlockPosition::Outermost => (up, mask),
            _ => (Tensor::cat(vec![x, up], 1), mask),
        }
    }

    fn down(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        // The outermost level sees the raw image and skips the activation.
        let x = match self.position() {
            BlockPosition::Outermost => x,
            _ => leaky_relu(x, 0.2),
        };
        let x = self.down_conv.forward(x);
        match &self.down_norm {
            Some(norm) => norm.forward(x),
            None => x,
        }
    }

    fn up(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = upsample_bilinear2x(relu(x));
        if let Some(conv) = &self.up_conv {
            x = conv.forward(reflect_pad(x, [1, 1, 1, 1]));
        }
        match (&self.up_norm, self.position()) {
            (_, BlockPosition::Outermost) => x.tanh(),
            (Some(norm), _) => norm.forward(x),
            (None, _) => x,
        }
    }
}

/// Residual U-Net generator.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    blocks: Vec<SkipBlock<B>>,
    #[module(ignore)]
    required_size: usize,
}

impl GeneratorConfig {
    /// Build the block stack. Depths below five are raised to five.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let ngf = self.filters;
        let depth = self.num_downs.max(MIN_DEPTH);

        // (outer, inner) channel pairs, outermost first.
        let mut levels = vec![(3, ngf), (ngf, ngf * 2), (ngf * 2, ngf * 4), (ngf * 4, ngf * 8)];
        levels.extend(std::iter::repeat((ngf * 8, ngf * 8)).take(depth - MIN_DEPTH));
        levels.push((ngf * 8, ngf * 8));

        let last = levels.len() - 1;
        let blocks = levels
            .into_iter()
            .enumerate()
            .map(|(idx, (outer, inner))| {
                let position = match idx {
                    0 => BlockPosition::Outermost,
                    idx if idx == last => BlockPosition::Innermost,
                    _ => BlockPosition::Intermediate,
                };
                SkipBlock::new(outer, inner, position, self, device)
            })
            .collect::<Vec<_>>();

        Generator {
            required_size: 1 << blocks.len(),
            blocks,
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Enhance a `[batch, 4, H, W]` tensor (RGB + illumination mask) into `[batch, 3, H, W]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let channels = input.dims()[1];
        ensure!(
            channels == 4,
            "generator expects image and mask stacked into 4 channels, got {channels}"
        );

        let (padded, padding) = add_padding(input, self.required_size)?;
        let image = padded.clone().slice_dim(1, 0..3);
        let mask = padded.slice_dim(1, 3..4);

        let (outermost, inner) = self
            .blocks
            .split_first()
            .context("generator has no blocks")?;
        let (latent, _) = outermost.forward(image.clone(), mask, inner);

        let latent = remove_padding(latent, &padding);
        let image = remove_padding(image, &padding);
        Ok(image.add(latent))
    }

    /// Spatial size every input is padded up to.
    pub fn required_size(&self) -> usize {
        self.required_size
    }

    pub fn blocks(&self) -> &[SkipBlock<B>] {
        &self.blocks
    }
}

/// Reflection padding added around an input, recorded so it can be cropped off again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Padding {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl Padding {
    /// Padding that grows `height × width` to `size × size`; odd remainders go to the bottom/right.
    pub fn to_size(height: usize, width: usize, size: usize) -> Result<Self> {
        ensure!(height > 0 && width > 0, "input {height}x{width} is empty");
        ensure!(
            height <= size && width <= size,
            "input {height}x{width} is larger than the generator size {size}"
        );
        let (top, bottom) = split_evenly(size - height);
        let (left, right) = split_evenly(size - width);
        Ok(Self {
            top,
            bottom,
            left,
            right,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.top + self.bottom + self.left + self.right == 0
    }
}

fn split_evenly(diff: usize) -> (usize, usize) {
    let leading = diff / 2;
    (leading, diff - leading)
}

/// Reflect-pad `x` up to `size × size`.
pub fn add_padding<B: Backend>(x: Tensor<B, 4>, size: usize) -> Result<(Tensor<B, 4>, Padding)> {
    let [_, _, height, width] = x.dims();
    let padding = Padding::to_size(height, width, size)?;
    if padding.is_empty() {
        return Ok((x, padding));
    }
    let padded = reflect_pad(
        x,
        [padding.top, padding.bottom, padding.left, padding.right],
    );
    Ok((padded, padding))
}

/// Crop the region added by [`add_padding`].
pub fn remove_padding<B: Backend>(x: Tensor<B, 4>, padding: &Padding) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    x.slice_dim(2, padding.top..(height - padding.bottom))
        .slice_dim(3, padding.left..(width - padding.right))
}

fn down_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    initializer: &Initializer,
    device: &B::Device,
) -> Conv2d<B> {
    let config = Conv2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1));
    init_conv(config, initializer, device)
}

fn up_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    initializer: &Initializer,
    device: &B::Device,
) -> Conv2d<B> {
    init_conv(
        Conv2dConfig::new([in_channels, out_channels], [3, 3]),
        initializer,
        device,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;

    fn config(num_downs: usize) -> GeneratorConfig {
        GeneratorConfig::new(num_downs, 2, NormType::Instance)
    }

    fn random(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::random(shape, Distribution::Uniform(-1.0, 1.0), &Default::default())
    }

    #[test]
    fn padding_round_trip_restores_input() {
        for (height, width) in [(20, 24), (21, 27), (32, 32), (8, 8), (1, 5)] {
            let x = random([2, 4, height, width]);
            let (padded, padding) = add_padding(x.clone(), 32).unwrap();
            assert_eq!(padded.dims(), [2, 4, 32, 32]);
            let restored = remove_padding(padded, &padding);
            assert_eq!(
                restored.into_data().to_vec::<f32>().unwrap(),
                x.into_data().to_vec::<f32>().unwrap()
            );
        }
    }

    #[test]
    fn odd_padding_goes_to_trailing_side() {
        let padding = Padding::to_size(27, 29, 32).unwrap();
        assert_eq!(
            padding,
            Padding {
                top: 2,
                bottom: 3,
                left: 1,
                right: 2
            }
        );
        assert!(Padding::to_size(32, 32, 32).unwrap().is_empty());
    }

    #[test]
    fn oversized_input_is_rejected() {
        assert!(Padding::to_size(33, 16, 32).is_err());
        let generator: Generator<TestBackend> = config(5).init(&Default::default());
        assert!(generator.forward(random([1, 4, 40, 40])).is_err());
        assert!(generator.forward(random([1, 3, 32, 32])).is_err());
    }

    #[test]
    fn small_input_runs_through_a_deep_stack() {
        let generator: Generator<TestBackend> = config(6).init(&Default::default());
        let output = generator.forward(random([1, 4, 8, 8])).unwrap();
        assert_eq!(output.dims(), [1, 3, 8, 8]);
        assert!(Padding::to_size(0, 8, 32).is_err());
    }

    #[test]
    fn conv_biases_start_at_zero() {
        let generator: Generator<TestBackend> = config(5).init(&Default::default());
        for block in generator.blocks() {
            let convs = std::iter::once(&block.down_conv).chain(block.up_conv.iter());
            for conv in convs {
                let bias = conv.bias.as_ref().unwrap().val();
                assert_eq!(bias.abs().sum().into_scalar(), 0.0);
            }
        }
    }

    #[test]
    fn stack_depth_sets_required_size() {
        let generator: Generator<TestBackend> = config(6).init(&Default::default());
        assert_eq!(generator.blocks().len(), 6);
        assert_eq!(generator.required_size(), 64);
        let positions: Vec<_> = generator.blocks().iter().map(|b| b.position()).collect();
        assert_eq!(positions[0], BlockPosition::Outermost);
        assert_eq!(positions[5], BlockPosition::Innermost);
        assert!(positions[1..5]
            .iter()
            .all(|p| *p == BlockPosition::Intermediate));
    }

    #[test]
    fn output_matches_input_resolution() {
        let generator: Generator<TestBackend> = config(5).init(&Default::default());
        let output = generator.forward(random([2, 4, 27, 30])).unwrap();
        assert_eq!(output.dims(), [2, 3, 27, 30]);
    }

    #[test]
    fn intermediate_blocks_double_channels_through_skip() {
        let device = Default::default();
        let generator: Generator<TestBackend> = config(5).init(&device);
        let blocks = generator.blocks();
        // Level 1 sees ngf channels and hands 2 * ngf back up.
        let x = random([1, 2, 16, 16]);
        let mask = random([1, 1, 16, 16]);
        let (out, mask_out) = blocks[1].forward(x, mask.clone(), &blocks[2..]);
        assert_eq!(out.dims(), [1, 4, 16, 16]);
        assert_eq!(
            mask_out.into_data().to_vec::<f32>().unwrap(),
            mask.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn zero_weights_give_identity_residual() {
        let device = Default::default();
        let generator: Generator<TestBackend> = config(5)
            .with_initializer(Initializer::Zeros)
            .init(&device);
        let input = random([2, 4, 24, 28]);
        let output = generator.forward(input.clone()).unwrap();
        let image = input.slice_dim(1, 0..3);
        let expected = image.into_data().to_vec::<f32>().unwrap();
        let actual = output.into_data().to_vec::<f32>().unwrap();
        assert_eq!(actual, expected);

        let data = TensorData::new(vec![0.25f32; 4 * 32 * 32], [1, 4, 32, 32]);
        let flat = generator
            .forward(Tensor::<TestBackend, 4>::from_data(data, &device))
            .unwrap();
        assert!(flat
            .into_data()
            .to_vec::<f32>()
            .unwrap()
            .iter()
            .all(|v| *v == 0.25));
    }
}
