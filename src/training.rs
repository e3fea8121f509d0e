use crate::checkpoint::{self, NetworkRole};
use crate::data::{EnhanceBatch, EnhanceBatcher, EnhanceDataset, ImagePair};
use crate::model::{
    independent_loss, lsgan_loss, mean_loss, perceptual_loss, relativistic_loss, Critic,
    CriticRole, Generator, ModelConfig, PerceptualExtractor,
};
use crate::utils::save_visual_strip;
use anyhow::{ensure, Context, Result};
use burn::config::Config;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder, DataLoaderIterator};
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::lr_scheduler::LrScheduler;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::Record;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use burn::train::metric::state::{FormatOptions, NumericMetricState};
use burn::train::metric::{
    Metric, MetricAttributes, MetricMetadata, MetricName, Numeric, NumericAttributes,
    NumericEntry, SerializedEntry,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Test,
}

/// Training configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    /// Experiment name; checkpoints go to `checkpoints_dir/name`.
    pub name: String,
    pub checkpoints_dir: String,
    pub data_dir: String,
    /// Pretrained VGG16 state dict (PyTorch format).
    pub vgg_weights: String,
    #[config(default = 16)]
    pub batch_size: usize,
    /// Working resolution of training images.
    #[config(default = 340)]
    pub crop_size: usize,
    #[config(default = 32)]
    pub patch_size: usize,
    #[config(default = 6)]
    pub num_patches: usize,
    #[config(default = 0.00015)]
    pub lr: f64,
    #[config(default = 0.5)]
    pub beta1: f32,
    /// Epochs at the initial learning rate.
    #[config(default = 100)]
    pub niter: usize,
    /// Epochs of linear decay to zero after `niter`.
    #[config(default = 100)]
    pub niter_decay: usize,
    #[config(default = "Phase::Train")]
    pub phase: Phase,
    #[config(default = "vec![0]")]
    pub gpu_ids: Vec<usize>,
    #[config(default = 0)]
    pub seed: u64,
    #[config(default = 100)]
    pub print_freq: usize,
    #[config(default = 30)]
    pub display_freq: usize,
    #[config(default = 5000)]
    pub save_latest_freq: usize,
    #[config(default = 5)]
    pub save_epoch_freq: usize,
    #[config(default = false)]
    pub continue_train: bool,
}

impl TrainingConfig {
    pub fn save_dir(&self) -> PathBuf {
        Path::new(&self.checkpoints_dir).join(&self.name)
    }

    /// Fail unless this configuration is meant for `phase`.
    pub fn ensure_phase(&self, phase: Phase) -> Result<()> {
        ensure!(
            self.phase == phase,
            "configuration {} is for the {:?} phase, not {:?}",
            self.name,
            self.phase,
            phase
        );
        Ok(())
    }

    fn optimizer(&self) -> AdamConfig {
        AdamConfig::new().with_beta_1(self.beta1).with_beta_2(0.999)
    }
}

/// Adam optimizer that counts the updates it has applied.
pub struct TrackedOptimizer<M: AutodiffModule<B>, B: AutodiffBackend> {
    inner: OptimizerAdaptor<Adam, M, B>,
    steps: usize,
}

impl<M: AutodiffModule<B>, B: AutodiffBackend> TrackedOptimizer<M, B> {
    pub fn new(config: &AdamConfig) -> Self {
        Self {
            inner: config.init::<B, M>(),
            steps: 0,
        }
    }

    pub fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        self.steps += 1;
        self.inner.step(lr, module, grads)
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

/// Constant learning rate for `niter` epochs, then a linear ramp to zero over `niter_decay`.
#[derive(Clone, Debug)]
pub struct LinearDecay {
    initial_lr: f64,
    lr: f64,
    niter: usize,
    niter_decay: usize,
    epoch: usize,
}

#[derive(Record, Clone)]
pub struct LinearDecayRecord {
    lr: f64,
    epoch: usize,
}

impl LinearDecay {
    pub fn new(lr: f64, niter: usize, niter_decay: usize) -> Self {
        Self {
            initial_lr: lr,
            lr,
            niter,
            niter_decay,
            epoch: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    /// Completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl LrScheduler for LinearDecay {
    type Record<B: Backend> = LinearDecayRecord;

    /// Advance by one finished epoch.
    fn step(&mut self) -> f64 {
        self.epoch += 1;
        if self.epoch > self.niter && self.niter_decay > 0 {
            let lr = (self.lr - self.initial_lr / self.niter_decay as f64).max(0.0);
            log::info!("update learning rate: {:.8} -> {:.8}", self.lr, lr);
            self.lr = lr;
        }
        self.lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        LinearDecayRecord {
            lr: self.lr,
            epoch: self.epoch,
        }
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.lr = record.lr;
        self.epoch = record.epoch;
        self
    }
}

/// Scalar losses of one update, for reporting only.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LossReport {
    pub batch_size: usize,
    pub generator: f64,
    pub global_critic: f64,
    pub local_critic: f64,
    pub perceptual: f64,
}

impl LossReport {
    pub fn entries(&self) -> [(&'static str, f64); 4] {
        LossKind::ALL.map(|kind| (kind.name(), kind.value(self)))
    }

    pub fn is_finite(&self) -> bool {
        self.entries().iter().all(|(_, value)| value.is_finite())
    }

    pub fn format_line(&self, epoch: usize, step: usize, elapsed: Duration) -> String {
        let mut line = format!(
            "(epoch: {epoch}, iters: {step}, time: {:.3})",
            elapsed.as_secs_f64()
        );
        for (name, value) in self.entries() {
            line.push_str(&format!(" {name}: {value:.3}"));
        }
        line
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossKind {
    Generator,
    GlobalCritic,
    LocalCritic,
    Perceptual,
}

impl LossKind {
    pub const ALL: [LossKind; 4] = [
        LossKind::Generator,
        LossKind::GlobalCritic,
        LossKind::LocalCritic,
        LossKind::Perceptual,
    ];

    /// Reporting name.
    pub fn name(&self) -> &'static str {
        match self {
            LossKind::Generator => "Gen",
            LossKind::GlobalCritic => "G_Disc",
            LossKind::LocalCritic => "L_Disc",
            LossKind::Perceptual => "vgg",
        }
    }

    fn value(&self, report: &LossReport) -> f64 {
        match self {
            LossKind::Generator => report.generator,
            LossKind::GlobalCritic => report.global_critic,
            LossKind::LocalCritic => report.local_critic,
            LossKind::Perceptual => report.perceptual,
        }
    }
}

/// Numeric metric tracking one of the reported losses.
#[derive(Clone)]
pub struct LossMetric {
    kind: LossKind,
    name: MetricName,
    state: NumericMetricState,
}

impl LossMetric {
    pub fn new(kind: LossKind) -> Self {
        Self {
            kind,
            name: Arc::new(kind.name().to_string()),
            state: NumericMetricState::default(),
        }
    }
}

impl Metric for LossMetric {
    type Input = LossReport;

    fn name(&self) -> MetricName {
        self.name.clone()
    }

    fn attributes(&self) -> MetricAttributes {
        NumericAttributes {
            unit: None,
            higher_is_better: false,
        }
        .into()
    }

    fn update(&mut self, report: &Self::Input, _metadata: &MetricMetadata) -> SerializedEntry {
        self.state.update(
            self.kind.value(report),
            report.batch_size,
            FormatOptions::new(self.name()).precision(3),
        )
    }

    fn clear(&mut self) {
        self.state.reset();
    }
}

impl Numeric for LossMetric {
    fn value(&self) -> NumericEntry {
        self.state.current_value()
    }

    fn running_value(&self) -> NumericEntry {
        self.state.running_value()
    }
}

/// The four loss metrics, averaged over the current epoch.
#[derive(Clone)]
pub struct LossMetrics {
    metrics: Vec<LossMetric>,
}

impl Default for LossMetrics {
    fn default() -> Self {
        Self {
            metrics: LossKind::ALL.into_iter().map(LossMetric::new).collect(),
        }
    }
}

impl LossMetrics {
    /// Record one update; returns a `name: epoch x - batch y` line.
    pub fn update(&mut self, report: &LossReport, metadata: &MetricMetadata) -> String {
        self.metrics
            .iter_mut()
            .map(|metric| {
                let entry = metric.update(report, metadata);
                format!("{}: {}", metric.name(), entry.formatted)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Epoch averages by reporting name.
    pub fn running_values(&self) -> Vec<(MetricName, f64)> {
        self.metrics
            .iter()
            .map(|metric| (metric.name(), metric.running_value().current()))
            .collect()
    }

    pub fn summary(&self) -> String {
        self.running_values()
            .into_iter()
            .map(|(name, value)| format!("{name}: {value:.3}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn clear(&mut self) {
        self.metrics.iter_mut().for_each(Metric::clear);
    }
}

/// Append-only `loss_log.txt`.
pub struct LossLog {
    path: PathBuf,
}

impl LossLog {
    /// Open the log and mark the start of a new run.
    pub fn create(save_dir: &Path, run_name: &str) -> Result<Self> {
        let log = Self {
            path: save_dir.join("loss_log.txt"),
        };
        log.append(&format!(
            "================ Training Loss ({run_name}) ================"
        ))?;
        Ok(log)
    }

    pub fn append(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOffset {
    pub y: usize,
    pub x: usize,
}

/// Draw `count` top-left corners for square crops of side `patch_size`.
pub fn sample_offsets(
    rng: &mut impl Rng,
    height: usize,
    width: usize,
    patch_size: usize,
    count: usize,
) -> Result<Vec<PatchOffset>> {
    ensure!(patch_size > 0, "patch size must be positive");
    ensure!(
        patch_size <= height && patch_size <= width,
        "patch size {patch_size} exceeds image size {height}x{width}"
    );
    // The last valid row/column is left out, except when nothing else is available.
    let max_y = (height - patch_size).saturating_sub(1);
    let max_x = (width - patch_size).saturating_sub(1);
    Ok((0..count)
        .map(|_| PatchOffset {
            y: rng.gen_range(0..=max_y),
            x: rng.gen_range(0..=max_x),
        })
        .collect())
}

/// Crops of the generated, reference and input images at one offset.
#[derive(Clone, Debug)]
pub struct PatchTriple<B: Backend> {
    pub fake: Tensor<B, 4>,
    pub real: Tensor<B, 4>,
    pub input: Tensor<B, 4>,
}

#[derive(Clone, Debug)]
pub struct PatchSet<B: Backend> {
    pub offsets: Vec<PatchOffset>,
    pub patches: Vec<PatchTriple<B>>,
}

impl<B: Backend> PatchSet<B> {
    pub fn sample(
        rng: &mut impl Rng,
        fake: &Tensor<B, 4>,
        real: &Tensor<B, 4>,
        input: &Tensor<B, 4>,
        patch_size: usize,
        count: usize,
    ) -> Result<Self> {
        let dims = fake.dims();
        ensure!(
            real.dims() == dims && input.dims() == dims,
            "cannot crop patches from images of different shapes: {dims:?}, {:?}, {:?}",
            real.dims(),
            input.dims()
        );
        let offsets = sample_offsets(rng, dims[2], dims[3], patch_size, count)?;
        let crop = |image: &Tensor<B, 4>, offset: &PatchOffset| {
            image
                .clone()
                .slice_dim(2, offset.y..offset.y + patch_size)
                .slice_dim(3, offset.x..offset.x + patch_size)
        };
        let patches = offsets
            .iter()
            .map(|offset| PatchTriple {
                fake: crop(fake, offset),
                real: crop(real, offset),
                input: crop(input, offset),
            })
            .collect();
        Ok(Self { offsets, patches })
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchTriple<B>> {
        self.patches.iter()
    }
}

/// Tensors for display, already off the autodiff graph.
#[derive(Clone, Debug)]
pub struct Visuals<B: Backend> {
    pub real_a: Tensor<B, 4>,
    pub fake_b: Tensor<B, 4>,
}

impl<B: Backend> Visuals<B> {
    pub fn entries(self) -> Vec<(&'static str, Tensor<B, 4>)> {
        vec![("real_A", self.real_a), ("fake_B", self.fake_b)]
    }
}

pub struct UpdateOutput<B: AutodiffBackend> {
    pub losses: LossReport,
    pub visuals: Visuals<B::InnerBackend>,
}

/// Values threaded through one update.
struct StepContext<B: AutodiffBackend> {
    batch: EnhanceBatch<B>,
    fake: Tensor<B, 4>,
    report: LossReport,
    generator_offsets: Vec<PatchOffset>,
    critic_offsets: Vec<PatchOffset>,
}

/// Generator, both critics, the perceptual comparator and one optimizer per network.
pub struct EnhanceGan<B: AutodiffBackend> {
    generator: Generator<B>,
    global_critic: Critic<B>,
    local_critic: Critic<B>,
    perceptual: PerceptualExtractor<B>,
    generator_optim: TrackedOptimizer<Generator<B>, B>,
    global_optim: TrackedOptimizer<Critic<B>, B>,
    local_optim: TrackedOptimizer<Critic<B>, B>,
    schedule: LinearDecay,
    rng: StdRng,
    patch_size: usize,
    num_patches: usize,
    save_dir: PathBuf,
    device: B::Device,
}

impl<B: AutodiffBackend> EnhanceGan<B> {
    pub fn new(
        config: &TrainingConfig,
        perceptual: PerceptualExtractor<B>,
        device: &B::Device,
    ) -> Result<Self> {
        ensure!(config.num_patches > 0, "num_patches must be at least 1");
        let optimizer = config.optimizer();
        let generator = config.model.init_generator(device);
        log::info!(
            "generator: {} parameters, padded size {}",
            generator.num_params(),
            generator.required_size()
        );
        Ok(Self {
            generator,
            global_critic: config.model.init_critic(CriticRole::Global, device),
            local_critic: config.model.init_critic(CriticRole::Patch, device),
            perceptual,
            generator_optim: TrackedOptimizer::new(&optimizer),
            global_optim: TrackedOptimizer::new(&optimizer),
            local_optim: TrackedOptimizer::new(&optimizer),
            schedule: LinearDecay::new(config.lr, config.niter, config.niter_decay),
            rng: StdRng::seed_from_u64(config.seed),
            patch_size: config.patch_size,
            num_patches: config.num_patches,
            save_dir: config.save_dir(),
            device: device.clone(),
        })
    }

    /// Run one full cycle: forward, generator update, global critic update, local critic update.
    pub fn perform_update(&mut self, batch: EnhanceBatch<B>) -> Result<UpdateOutput<B>> {
        let ctx = self.forward(batch)?;
        let ctx = self.update_generator(ctx)?;
        let ctx = self.update_global_critic(ctx);
        let ctx = self.update_local_critic(ctx)?;

        let visuals = Visuals {
            real_a: ctx.batch.low_light.inner(),
            fake_b: ctx.fake.inner(),
        };
        Ok(UpdateOutput {
            losses: ctx.report,
            visuals,
        })
    }

    fn forward(&self, batch: EnhanceBatch<B>) -> Result<StepContext<B>> {
        batch.validate()?;
        let fake = self.generator.forward(batch.generator_input())?;
        ensure!(
            fake.dims() == batch.normal_light.dims(),
            "generated image {:?} does not match target {:?}",
            fake.dims(),
            batch.normal_light.dims()
        );
        let report = LossReport {
            batch_size: batch.low_light.dims()[0],
            ..Default::default()
        };
        Ok(StepContext {
            batch,
            fake,
            report,
            generator_offsets: Vec::new(),
            critic_offsets: Vec::new(),
        })
    }

    fn update_generator(&mut self, mut ctx: StepContext<B>) -> Result<StepContext<B>> {
        let pred_fake = self.global_critic.forward(ctx.fake.clone());
        let pred_real = self.global_critic.forward(ctx.batch.normal_light.clone());
        let global_adv = relativistic_loss(pred_real, pred_fake, false);

        let patches = PatchSet::sample(
            &mut self.rng,
            &ctx.fake,
            &ctx.batch.normal_light,
            &ctx.batch.low_light,
            self.patch_size,
            self.num_patches,
        )?;
        let local_adv = mean_loss(
            patches
                .iter()
                .map(|patch| lsgan_loss(self.local_critic.forward(patch.fake.clone()), true))
                .collect(),
        );

        // Content term: the output is compared with the low-light input.
        let whole = perceptual_loss(&self.perceptual, ctx.fake.clone(), ctx.batch.low_light.clone());
        let per_patch = mean_loss(
            patches
                .iter()
                .map(|patch| perceptual_loss(&self.perceptual, patch.fake.clone(), patch.input.clone()))
                .collect(),
        );
        let perceptual = whole.add(per_patch);
        let loss = global_adv.add(local_adv).add(perceptual.clone());

        ctx.report.generator = scalar(&loss);
        ctx.report.perceptual = scalar(&perceptual);
        ctx.generator_offsets = patches.offsets;

        let grads = GradientsParams::from_grads(loss.backward(), &self.generator);
        self.generator = self
            .generator_optim
            .step(self.schedule.learning_rate(), self.generator.clone(), grads);
        Ok(ctx)
    }

    fn update_global_critic(&mut self, mut ctx: StepContext<B>) -> StepContext<B> {
        let pred_real = self.global_critic.forward(ctx.batch.normal_light.clone());
        let pred_fake = self.global_critic.forward(ctx.fake.clone().detach());
        let loss = relativistic_loss(pred_real, pred_fake, true);
        ctx.report.global_critic = scalar(&loss);

        let grads = GradientsParams::from_grads(loss.backward(), &self.global_critic);
        self.global_critic = self
            .global_optim
            .step(self.schedule.learning_rate(), self.global_critic.clone(), grads);
        ctx
    }

    fn update_local_critic(&mut self, mut ctx: StepContext<B>) -> Result<StepContext<B>> {
        // Offsets are drawn again rather than reused from the generator pass.
        let patches = PatchSet::sample(
            &mut self.rng,
            &ctx.fake.clone().detach(),
            &ctx.batch.normal_light,
            &ctx.batch.low_light,
            self.patch_size,
            self.num_patches,
        )?;
        let loss = mean_loss(
            patches
                .iter()
                .map(|patch| {
                    let pred_real = self.local_critic.forward(patch.real.clone());
                    let pred_fake = self.local_critic.forward(patch.fake.clone());
                    independent_loss(pred_real, pred_fake)
                })
                .collect(),
        );
        ctx.report.local_critic = scalar(&loss);
        ctx.critic_offsets = patches.offsets;

        let grads = GradientsParams::from_grads(loss.backward(), &self.local_critic);
        self.local_critic = self
            .local_optim
            .step(self.schedule.learning_rate(), self.local_critic.clone(), grads);
        Ok(ctx)
    }

    /// Apply one epoch of the learning-rate schedule to all three optimizers.
    pub fn update_learning_rate(&mut self) -> f64 {
        self.schedule.step()
    }

    pub fn learning_rate(&self) -> f64 {
        self.schedule.learning_rate()
    }

    /// Restore the schedule after `epoch` completed epochs.
    pub fn resume_schedule(&mut self, epoch: usize, lr: f64) {
        self.schedule = self
            .schedule
            .clone()
            .load_record::<B>(LinearDecayRecord { lr, epoch });
    }

    /// Updates applied by the generator, global critic and local critic optimizers.
    pub fn optimizer_steps(&self) -> [usize; 3] {
        [
            self.generator_optim.steps(),
            self.global_optim.steps(),
            self.local_optim.steps(),
        ]
    }

    pub fn generator(&self) -> &Generator<B> {
        &self.generator
    }

    pub fn save_model(&self, label: &str) -> Result<()> {
        checkpoint::save_network(&self.generator, &self.save_dir, label, NetworkRole::Generator)?;
        checkpoint::save_network(&self.global_critic, &self.save_dir, label, NetworkRole::GlobalCritic)?;
        checkpoint::save_network(&self.local_critic, &self.save_dir, label, NetworkRole::LocalCritic)?;
        Ok(())
    }

    /// Replace all three networks with their most recent checkpoints.
    pub fn load_latest(&mut self) -> Result<()> {
        self.generator = checkpoint::load_latest(
            self.generator.clone(),
            &self.save_dir,
            NetworkRole::Generator,
            &self.device,
        )?;
        self.global_critic = checkpoint::load_latest(
            self.global_critic.clone(),
            &self.save_dir,
            NetworkRole::GlobalCritic,
            &self.device,
        )?;
        self.local_critic = checkpoint::load_latest(
            self.local_critic.clone(),
            &self.save_dir,
            NetworkRole::LocalCritic,
            &self.device,
        )?;
        Ok(())
    }

    /// Inference-only copy of the current generator.
    pub fn enhancer(&self) -> Enhancer<B::InnerBackend> {
        Enhancer::new(self.generator.valid())
    }
}

/// Test-phase wrapper around a trained generator.
pub struct Enhancer<B: Backend> {
    generator: Generator<B>,
}

impl<B: Backend> Enhancer<B> {
    pub fn new(generator: Generator<B>) -> Self {
        Self { generator }
    }

    /// Load the generator saved in `dir` for a test-phase `config`.
    pub fn from_config(config: &TrainingConfig, dir: &Path, device: &B::Device) -> Result<Self> {
        config.ensure_phase(Phase::Test)?;
        Self::from_checkpoints(&config.model, dir, device)
    }

    pub fn from_checkpoints(model: &ModelConfig, dir: &Path, device: &B::Device) -> Result<Self> {
        let generator = checkpoint::load_latest(
            model.init_generator::<B>(device),
            dir,
            NetworkRole::Generator,
            device,
        )?;
        Ok(Self::new(generator))
    }

    /// Enhance `[batch, 3, H, W]` images given their `[batch, 1, H, W]` illumination masks.
    pub fn predict(&self, low_light: Tensor<B, 4>, mask: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        self.generator.forward(Tensor::cat(vec![low_light, mask], 1))
    }
}

fn scalar<B: Backend>(loss: &Tensor<B, 1>) -> f64 {
    loss.clone().into_scalar().elem::<f64>()
}

fn every(step: usize, freq: usize) -> bool {
    freq > 0 && step % freq == 0
}

/// Persisted training state for resume support.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
struct TrainingState {
    step: usize,
    epoch: usize,
    learning_rate: f64,
}

fn write_training_state(state_path: &Path, state: &TrainingState) -> Result<()> {
    let state_json =
        serde_json::to_string_pretty(state).context("failed to serialize training state")?;
    std::fs::write(state_path, state_json)
        .with_context(|| format!("failed to write {}", state_path.display()))
}

fn read_training_state(state_path: &Path) -> Result<TrainingState> {
    let contents = std::fs::read_to_string(state_path)
        .with_context(|| format!("failed to read {}", state_path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", state_path.display()))
}

/// Train the enhancement GAN, handling checkpoints, loss logging and sample images.
pub fn train<B: AutodiffBackend>(config: TrainingConfig, device: B::Device) -> Result<()> {
    config.ensure_phase(Phase::Train)?;
    let save_dir = config.save_dir();
    std::fs::create_dir_all(&save_dir)
        .with_context(|| format!("failed to create {}", save_dir.display()))?;
    config.save(save_dir.join("config.json"))?;

    if config.gpu_ids.len() > 1 {
        log::warn!(
            "gpu_ids {:?}: training runs on a single device",
            config.gpu_ids
        );
    }
    B::seed(&device, config.seed);

    let dataset = EnhanceDataset::open(Path::new(&config.data_dir))?;
    let loader = DataLoaderBuilder::<B, ImagePair, EnhanceBatch<B>>::new(EnhanceBatcher::new(
        config.crop_size,
    ))
    .batch_size(config.batch_size)
    .shuffle(config.seed)
    .set_device(device.clone())
    .build(dataset);

    let perceptual = PerceptualExtractor::from_pretrained(
        &config.model.vgg,
        Path::new(&config.vgg_weights),
        &device,
    )?;
    let mut gan = EnhanceGan::new(&config, perceptual, &device)?;

    let state_path = save_dir.join("state.json");
    let mut state = TrainingState {
        learning_rate: config.lr,
        ..Default::default()
    };
    if config.continue_train {
        gan.load_latest()?;
        if state_path.exists() {
            state = read_training_state(&state_path)?;
            gan.resume_schedule(state.epoch, state.learning_rate);
        }
        log::info!(
            "resuming from epoch {}, step {}, learning rate {:.8}",
            state.epoch,
            state.step,
            state.learning_rate
        );
    }

    let loss_log = LossLog::create(&save_dir, &config.name)?;
    let image_dir = save_dir.join("images");
    let mut metrics = LossMetrics::default();
    let total_epochs = config.niter + config.niter_decay;

    for epoch in state.epoch + 1..=total_epochs {
        let epoch_start = Instant::now();
        let mut batches = loader.iter();
        while let Some(batch) = batches.next() {
            let iter_start = Instant::now();
            let output = gan.perform_update(batch)?;
            state.step += 1;

            let metadata = MetricMetadata {
                progress: batches.progress(),
                epoch,
                epoch_total: total_epochs,
                iteration: state.step,
                lr: Some(gan.learning_rate()),
            };
            let running = metrics.update(&output.losses, &metadata);

            if every(state.step, config.display_freq) {
                save_visual_strip(output.visuals.entries(), &image_dir, state.step)?;
            }
            if every(state.step, config.print_freq) {
                let line = output.losses.format_line(epoch, state.step, iter_start.elapsed());
                log::info!("{line} | {running}");
                loss_log.append(&line)?;
            }
            if every(state.step, config.save_latest_freq) {
                log::info!(
                    "saving the latest model (epoch {epoch}, total_steps {})",
                    state.step
                );
                gan.save_model("latest")?;
                write_training_state(&state_path, &state)?;
            }
        }

        if every(epoch, config.save_epoch_freq) {
            log::info!(
                "saving the model at the end of epoch {epoch}, iters {}",
                state.step
            );
            gan.save_model("latest")?;
            gan.save_model(&epoch.to_string())?;
        }
        log::info!(
            "end of epoch {epoch} / {total_epochs} \t time taken: {:.1} sec \t {}",
            epoch_start.elapsed().as_secs_f64(),
            metrics.summary()
        );
        metrics.clear();

        gan.update_learning_rate();
        state.epoch = epoch;
        state.learning_rate = gan.learning_rate();
        write_training_state(&state_path, &state)?;
    }

    Ok(())
}
