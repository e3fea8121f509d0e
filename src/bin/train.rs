#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, WebGpu};
use burn::config::Config;
use clap::Parser;
use lowlight_gan::training::TrainingConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Train the low-light enhancement GAN")]
struct Args {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Resume from the latest checkpoints in the experiment directory.
    #[arg(long, default_value_t = false)]
    continue_train: bool,
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();
    let mut config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    config.continue_train |= args.continue_train;

    type Backend = WebGpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;
    let device = WgpuDevice::default();

    log::info!(
        "training {} with batch size {} at {}px",
        config.name,
        config.batch_size,
        config.crop_size
    );
    lowlight_gan::training::train::<AutodiffBackend>(config, device)
}
