use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer};
use burn::prelude::*;
use burn::tensor::{Distribution, TensorData};

const EPSILON: f64 = 1e-5;

/// Normalization applied after every normalized convolution in the generator and critics.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum NormType {
    /// Batch statistics with a learned affine transform.
    Batch,
    /// Per-sample, per-channel statistics without learned parameters.
    Instance,
}

impl NormType {
    /// Build a normalization layer for `num_channels` feature maps.
    pub fn init<B: Backend>(&self, num_channels: usize, device: &B::Device) -> Norm<B> {
        match self {
            NormType::Batch => {
                let mut batch: BatchNorm<B> = BatchNormConfig::new(num_channels).init(device);
                batch.gamma = Param::from_tensor(Tensor::random(
                    [num_channels],
                    Distribution::Normal(1.0, 0.02),
                    device,
                ));
                Norm { batch: Some(batch) }
            }
            NormType::Instance => Norm { batch: None },
        }
    }
}

/// Normalization layer selected by [`NormType`].
#[derive(Module, Debug)]
pub struct Norm<B: Backend> {
    batch: Option<BatchNorm<B>>,
}

impl<B: Backend> Norm<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.batch {
            Some(batch) => batch.forward(x),
            None => instance_norm(x),
        }
    }
}

/// Convolution with `initializer` weights and a zero bias.
pub fn init_conv<B: Backend>(
    config: Conv2dConfig,
    initializer: &Initializer,
    device: &B::Device,
) -> Conv2d<B> {
    let mut conv = config.with_initializer(initializer.clone()).init(device);
    conv.bias = conv
        .bias
        .map(|bias| Param::from_tensor(bias.val().zeros_like()));
    conv
}

/// Normalize each channel of each sample to zero mean and unit variance.
pub fn instance_norm<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let mean = x.clone().mean_dim(3).mean_dim(2);
    let centered = x.sub(mean);
    let var = centered.clone().square().mean_dim(3).mean_dim(2);
    centered.div(var.add_scalar(EPSILON).sqrt())
}

/// Reflection-pad the spatial axes by `[top, bottom, left, right]`.
///
/// Amounts larger than the axis reflect the already padded tensor again, so any
/// amount works. A single-pixel axis has nothing to mirror and is repeated.
pub fn reflect_pad<B: Backend>(x: Tensor<B, 4>, padding: [usize; 4]) -> Tensor<B, 4> {
    let [top, bottom, left, right] = padding;
    let x = reflect_axis(x, 2, top, bottom);
    reflect_axis(x, 3, left, right)
}

fn reflect_axis<B: Backend>(
    mut x: Tensor<B, 4>,
    axis: usize,
    mut before: usize,
    mut after: usize,
) -> Tensor<B, 4> {
    while before > 0 || after > 0 {
        let len = x.dims()[axis];
        if len == 1 {
            return x.repeat_dim(axis, 1 + before + after);
        }
        let step_before = before.min(len - 1);
        let step_after = after.min(len - 1);
        x = reflect_once(x, axis, step_before, step_after);
        before -= step_before;
        after -= step_after;
    }
    x
}

/// Mirror at most `len - 1` elements onto each side of `axis`.
fn reflect_once<B: Backend>(
    x: Tensor<B, 4>,
    axis: usize,
    before: usize,
    after: usize,
) -> Tensor<B, 4> {
    let len = x.dims()[axis];
    let mut parts = Vec::with_capacity(3);
    if before > 0 {
        parts.push(flip_axis(x.clone().slice_dim(axis, 1..(before + 1)), axis));
    }
    parts.push(x.clone());
    if after > 0 {
        parts.push(flip_axis(
            x.slice_dim(axis, (len - 1 - after)..(len - 1)),
            axis,
        ));
    }
    Tensor::cat(parts, axis)
}

fn flip_axis<B: Backend>(x: Tensor<B, 4>, axis: usize) -> Tensor<B, 4> {
    if axis == 2 {
        x.flip([2])
    } else {
        x.flip([3])
    }
}

/// Bilinear ×2 upsampling with aligned corners.
///
/// Built from index gathers so the backward pass works on every backend.
pub fn upsample_bilinear2x<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    let x = resize_axis(x, 2, height * 2);
    resize_axis(x, 3, width * 2)
}

fn resize_axis<B: Backend>(x: Tensor<B, 4>, axis: usize, out_len: usize) -> Tensor<B, 4> {
    let device = x.device();
    let in_len = x.dims()[axis];
    let (lower_idx, upper_idx, weights) = align_corners_taps(in_len, out_len);

    let lower_idx =
        Tensor::<B, 1, Int>::from_data(TensorData::new(lower_idx, [out_len]), &device);
    let upper_idx =
        Tensor::<B, 1, Int>::from_data(TensorData::new(upper_idx, [out_len]), &device);
    let mut weight_shape = [1, 1, 1, 1];
    weight_shape[axis] = out_len;
    let weights = Tensor::<B, 1>::from_data(TensorData::new(weights, [out_len]), &device)
        .reshape(weight_shape);

    let lower = x.clone().select(axis, lower_idx);
    let upper = x.select(axis, upper_idx);
    lower
        .mul(weights.clone().neg().add_scalar(1.0))
        .add(upper.mul(weights))
}

/// Source indices and blend weights mapping `out_len` samples onto `in_len`.
fn align_corners_taps(in_len: usize, out_len: usize) -> (Vec<i64>, Vec<i64>, Vec<f32>) {
    let mut lower = Vec::with_capacity(out_len);
    let mut upper = Vec::with_capacity(out_len);
    let mut weights = Vec::with_capacity(out_len);
    let scale = if out_len > 1 && in_len > 1 {
        (in_len - 1) as f64 / (out_len - 1) as f64
    } else {
        0.0
    };
    for idx in 0..out_len {
        let src = idx as f64 * scale;
        let floor = (src.floor() as usize).min(in_len - 1);
        let ceil = (floor + 1).min(in_len - 1);
        lower.push(floor as i64);
        upper.push(ceil as i64);
        weights.push((src - floor as f64) as f32);
    }
    (lower, upper, weights)
}
