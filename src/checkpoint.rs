//! On-disk network snapshots named `{label}_net_{role}.mpk`.

use anyhow::{bail, Context, Result};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const EXTENSION: &str = "mpk";

/// Full-precision MessagePack records.
type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// The three trained networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkRole {
    Generator,
    GlobalCritic,
    LocalCritic,
}

impl NetworkRole {
    pub const ALL: [NetworkRole; 3] = [
        NetworkRole::Generator,
        NetworkRole::GlobalCritic,
        NetworkRole::LocalCritic,
    ];

    /// Role string embedded in checkpoint file names.
    pub fn tag(&self) -> &'static str {
        match self {
            NetworkRole::Generator => "Gener",
            NetworkRole::GlobalCritic => "Global_Disc",
            NetworkRole::LocalCritic => "Local_Disc",
        }
    }
}

pub fn checkpoint_stem(label: &str, role: NetworkRole) -> String {
    format!("{label}_net_{}", role.tag())
}

/// Write `module` to `{dir}/{label}_net_{role}.mpk`, returning the written path.
pub fn save_network<B: Backend, M: Module<B>>(
    module: &M,
    dir: &Path,
    label: &str,
    role: NetworkRole,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let stem = dir.join(checkpoint_stem(label, role));
    module
        .clone()
        .save_file(stem.clone(), &CheckpointRecorder::new())
        .with_context(|| format!("failed to save {}", stem.display()))?;
    Ok(stem.with_extension(EXTENSION))
}

/// Most recently modified checkpoint for `role` in `dir`.
pub fn latest_checkpoint(dir: &Path, role: NetworkRole) -> Result<PathBuf> {
    if !dir.is_dir() {
        bail!("checkpoint directory {} does not exist", dir.display());
    }
    let pattern = format!("{}/*_net_{}.{EXTENSION}", dir.display(), role.tag());
    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for path in glob::glob(&pattern)
        .with_context(|| format!("invalid checkpoint pattern {pattern}"))?
        .filter_map(Result::ok)
    {
        let time = modified(&path)?;
        if latest.as_ref().map_or(true, |(newest, _)| time >= *newest) {
            latest = Some((time, path));
        }
    }
    match latest {
        Some((_, path)) => Ok(path),
        None => bail!("no {} checkpoint found in {}", role.tag(), dir.display()),
    }
}

/// Load the checkpoint at `path` into `module`.
pub fn load_network<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    device: &B::Device,
) -> Result<M> {
    let module = module
        .load_file(path.to_path_buf(), &CheckpointRecorder::new(), device)
        .with_context(|| format!("failed to load {}", path.display()))?;
    log::info!("loaded {}", path.display());
    Ok(module)
}

/// Load the most recent checkpoint for `role` into `module`.
pub fn load_latest<B: Backend, M: Module<B>>(
    module: M,
    dir: &Path,
    role: NetworkRole,
    device: &B::Device,
) -> Result<M> {
    let path = latest_checkpoint(dir, role)?;
    load_network(module, &path, device)
}

fn modified(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .with_context(|| format!("failed to read modification time of {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CriticConfig, CriticRole, NormType};
    use burn::backend::NdArray;
    use burn::nn::Initializer;
    use std::time::Duration;

    type TestBackend = NdArray<f32>;

    fn critic(value: f64) -> crate::model::Critic<TestBackend> {
        CriticConfig::new(CriticRole::Patch, 1, 2, NormType::Instance)
            .with_initializer(Initializer::Constant { value })
            .init(&Default::default())
    }

    fn touch(path: &Path, secs: u64) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    fn input() -> Tensor<TestBackend, 4> {
        Tensor::ones([1, 3, 8, 8], &Default::default())
    }

    #[test]
    fn file_names_carry_label_and_role() {
        assert_eq!(checkpoint_stem("latest", NetworkRole::Generator), "latest_net_Gener");
        assert_eq!(checkpoint_stem("12", NetworkRole::LocalCritic), "12_net_Local_Disc");
    }

    #[test]
    fn save_then_load_restores_weights() {
        let dir = tempfile::tempdir().unwrap();
        let saved = critic(0.1);
        let path = save_network(&saved, dir.path(), "latest", NetworkRole::GlobalCritic).unwrap();
        assert!(path.exists());

        let loaded = load_latest(critic(0.7), dir.path(), NetworkRole::GlobalCritic, &Default::default()).unwrap();
        let expected = saved.forward(input()).into_data();
        loaded.forward(input()).into_data().assert_eq(&expected, true);
    }

    #[test]
    fn latest_is_chosen_by_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        let old = save_network(&critic(0.1), dir.path(), "latest", NetworkRole::Generator).unwrap();
        let new = save_network(&critic(0.2), dir.path(), "5", NetworkRole::Generator).unwrap();
        save_network(&critic(0.3), dir.path(), "9", NetworkRole::LocalCritic).unwrap();
        touch(&old, 1_000);
        touch(&new, 2_000);
        assert_eq!(latest_checkpoint(dir.path(), NetworkRole::Generator).unwrap(), new);

        touch(&old, 3_000);
        assert_eq!(latest_checkpoint(dir.path(), NetworkRole::Generator).unwrap(), old);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        save_network(&critic(0.1), dir.path(), "latest", NetworkRole::Generator).unwrap();
        let dangling = dir.path().join("3_net_Gener.mpk");
        std::os::unix::fs::symlink(dir.path().join("missing.mpk"), &dangling).unwrap();

        let err = latest_checkpoint(dir.path(), NetworkRole::Generator).unwrap_err();
        assert!(format!("{err:#}").contains("3_net_Gener.mpk"), "{err:#}");
    }

    #[test]
    fn missing_role_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        save_network(&critic(0.1), dir.path(), "latest", NetworkRole::Generator).unwrap();
        assert!(latest_checkpoint(dir.path(), NetworkRole::GlobalCritic).is_err());
        assert!(latest_checkpoint(&dir.path().join("missing"), NetworkRole::Generator).is_err());
    }
}
