pub mod discriminator;
pub mod generator;
pub mod layers;
pub mod perceptual;

use burn::nn::loss::{MseLoss, Reduction};
use burn::nn::Initializer;
use burn::prelude::*;

pub use discriminator::{Critic, CriticConfig, CriticRole};
pub use generator::{add_padding, remove_padding, Generator, GeneratorConfig, Padding, SkipBlock};
pub use layers::NormType;
pub use perceptual::{perceptual_loss, PerceptualExtractor, VggConfig};

/// Architecture hyperparameters for the generator, both critics and the perceptual trunk.
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Generator depth; inputs are padded to `2^num_downs` pixels per side.
    #[config(default = 9)]
    pub num_downs: usize,
    #[config(default = "NormType::Batch")]
    pub norm_type: NormType,
    #[config(default = 64)]
    pub generator_filters: usize,
    #[config(default = 64)]
    pub critic_filters: usize,
    #[config(default = 5)]
    pub num_disc_layers: usize,
    #[config(default = 4)]
    pub num_patch_disc_layers: usize,
    #[config(default = "VggConfig::new()")]
    pub vgg: VggConfig,
    #[config(default = "Initializer::Normal { mean: 0.0, std: 0.02 }")]
    pub initializer: Initializer,
}

impl ModelConfig {
    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(self.num_downs, self.generator_filters, self.norm_type)
            .with_initializer(self.initializer.clone())
    }

    pub fn critic_config(&self, role: CriticRole) -> CriticConfig {
        let num_layers = match role {
            CriticRole::Global => self.num_disc_layers,
            CriticRole::Patch => self.num_patch_disc_layers,
        };
        CriticConfig::new(role, num_layers, self.critic_filters, self.norm_type)
            .with_initializer(self.initializer.clone())
    }

    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        self.generator_config().init(device)
    }

    pub fn init_critic<B: Backend>(&self, role: CriticRole, device: &B::Device) -> Critic<B> {
        self.critic_config(role).init(device)
    }
}

/// Least-squares GAN loss: mean squared distance to an all-ones (real) or all-zeros (fake) target.
pub fn lsgan_loss<B: Backend>(prediction: Tensor<B, 4>, target_is_real: bool) -> Tensor<B, 1> {
    let fill = if target_is_real { 1.0 } else { 0.0 };
    let target = Tensor::full(prediction.shape(), fill, &prediction.device());
    MseLoss::new().forward(prediction, target, Reduction::Mean)
}

/// Relativistic least-squares loss.
///
/// Each side is scored against the batch-mean score of the other side. With
/// `real_is_real = true` this is the critic objective; the generator uses
/// `false`, which pushes fakes above reals instead.
pub fn relativistic_loss<B: Backend>(
    pred_real: Tensor<B, 4>,
    pred_fake: Tensor<B, 4>,
    real_is_real: bool,
) -> Tensor<B, 1> {
    let mean_real = pred_real.clone().mean().reshape([1, 1, 1, 1]);
    let mean_fake = pred_fake.clone().mean().reshape([1, 1, 1, 1]);
    let real_term = lsgan_loss(pred_real.sub(mean_fake), real_is_real);
    let fake_term = lsgan_loss(pred_fake.sub(mean_real), !real_is_real);
    real_term.add(fake_term).div_scalar(2.0)
}

/// Plain least-squares critic loss with real and fake scored independently.
pub fn independent_loss<B: Backend>(pred_real: Tensor<B, 4>, pred_fake: Tensor<B, 4>) -> Tensor<B, 1> {
    lsgan_loss(pred_real, true)
        .add(lsgan_loss(pred_fake, false))
        .mul_scalar(0.5)
}

/// Average a list of scalar losses.
pub fn mean_loss<B: Backend>(losses: Vec<Tensor<B, 1>>) -> Tensor<B, 1> {
    Tensor::cat(losses, 0).mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;

    fn scores(values: Vec<f32>) -> Tensor<TestBackend, 4> {
        let len = values.len();
        Tensor::from_data(TensorData::new(values, [len, 1, 1, 1]), &Default::default())
    }

    fn scalar(loss: Tensor<TestBackend, 1>) -> f32 {
        loss.into_scalar()
    }

    #[test]
    fn lsgan_targets_ones_or_zeros() {
        assert_eq!(scalar(lsgan_loss(scores(vec![1.0, 1.0]), true)), 0.0);
        assert_eq!(scalar(lsgan_loss(scores(vec![1.0, 1.0]), false)), 1.0);
        assert_eq!(scalar(lsgan_loss(scores(vec![0.5, -0.5]), false)), 0.25);
    }

    #[test]
    fn relativistic_loss_uses_opposite_means() {
        // real - mean(fake) = 1 hits the target, fake - mean(real) = -1 misses by 1.
        let loss = relativistic_loss(scores(vec![1.0, 1.0]), scores(vec![0.0, 0.0]), true);
        assert!((scalar(loss) - 0.5).abs() < 1e-6);

        // Shifting both sides by a constant changes nothing.
        let a = relativistic_loss(scores(vec![0.3, 0.9]), scores(vec![-0.2, 0.1]), true);
        let b = relativistic_loss(scores(vec![5.3, 5.9]), scores(vec![4.8, 5.1]), true);
        assert!((scalar(a) - scalar(b)).abs() < 1e-5);
    }

    #[test]
    fn relativistic_loss_is_symmetric_under_role_swap() {
        let device = Default::default();
        for _ in 0..5 {
            let real = Tensor::<TestBackend, 4>::random([4, 1, 3, 3], Distribution::Normal(0.0, 1.0), &device);
            let fake = Tensor::<TestBackend, 4>::random([4, 1, 3, 3], Distribution::Normal(0.0, 1.0), &device);
            let generator = relativistic_loss(real.clone(), fake.clone(), false);
            let swapped = relativistic_loss(fake.clone(), real.clone(), true);
            assert!((scalar(generator) - scalar(swapped)).abs() < 1e-5);

            let critic = relativistic_loss(real.clone(), fake.clone(), true);
            let swapped = relativistic_loss(fake, real, false);
            assert!((scalar(critic) - scalar(swapped)).abs() < 1e-5);
        }
    }

    #[test]
    fn independent_loss_ignores_the_other_side() {
        let perfect = independent_loss(scores(vec![1.0]), scores(vec![0.0]));
        assert_eq!(scalar(perfect), 0.0);
        // Unlike the relativistic form, a shared offset is penalized.
        let shifted = independent_loss(scores(vec![2.0]), scores(vec![1.0]));
        assert_eq!(scalar(shifted), 1.0);
    }

    #[test]
    fn critic_configs_follow_role() {
        let config = ModelConfig::new()
            .with_num_disc_layers(5)
            .with_num_patch_disc_layers(3);
        assert_eq!(config.critic_config(CriticRole::Global).num_layers, 5);
        assert_eq!(config.critic_config(CriticRole::Patch).num_layers, 3);
        assert_eq!(config.generator_config().num_downs, 9);
    }

    #[test]
    fn mean_loss_averages() {
        let device = Default::default();
        let losses = vec![
            Tensor::<TestBackend, 1>::from_floats([1.0], &device),
            Tensor::<TestBackend, 1>::from_floats([3.0], &device),
        ];
        assert_eq!(mean_loss(losses).into_scalar(), 2.0);
    }
}
