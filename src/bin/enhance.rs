#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::config::Config;
use burn_cuda::{Cuda, CudaDevice};
use clap::Parser;
use lowlight_gan::data::{list_images, single_image_batch};
use lowlight_gan::training::{Enhancer, Phase, TrainingConfig};
use lowlight_gan::utils::{save_concat_images, tensor_to_images};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Enhance low-light images with a trained generator")]
struct Args {
    /// Experiment directory holding `config.json` and the generator checkpoints.
    #[arg(long)]
    model_dir: PathBuf,
    #[arg(long)]
    input_dir: PathBuf,
    #[arg(long)]
    save_dir: PathBuf,
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    type Backend = Cuda<f32, i32>;
    let device = CudaDevice::default();

    let config_path = args.model_dir.join("config.json");
    let mut config = TrainingConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if config.phase == Phase::Train {
        log::info!("{} was saved by training, running it in the test phase", config_path.display());
        config = config.with_phase(Phase::Test);
    }
    let enhancer = Enhancer::<Backend>::from_config(&config, &args.model_dir, &device)?;

    let inputs = list_images(&args.input_dir)?;
    log::info!("enhancing {} images from {}", inputs.len(), args.input_dir.display());
    fs::create_dir_all(&args.save_dir)
        .with_context(|| format!("failed to create {}", args.save_dir.display()))?;

    for path in inputs {
        let img = image::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?
            .to_rgb8();
        let (low_light, mask) = single_image_batch::<Backend>(&img, &device);
        let enhanced = enhancer
            .predict(low_light, mask)
            .with_context(|| format!("failed to enhance {}", path.display()))?;

        let mut strip = vec![img];
        strip.extend(tensor_to_images(enhanced)?);
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("image");
        let out = args.save_dir.join(format!("{name}_enhanced.png"));
        save_concat_images(&strip, &out)?;
        log::debug!("saved {}", out.display());
    }

    Ok(())
}
