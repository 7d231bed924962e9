//! Checkpoint and asset resolution.
//!
//! A model reference is either a local directory laid out like the hub
//! repository or a HuggingFace repo id. Files are looked up in the directory
//! first; repo ids go through the synchronous `hf_hub` API, which caches
//! downloads under `~/.cache/huggingface`.
//!
//! FLAV repository layout:
//!
//! ```text
//! config.json
//! model.safetensors | diffusion_pytorch_model.safetensors
//! vocoder/config.json
//! vocoder/vocoder.pt
//! ```

use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiRepo};

use crate::{Error, Result};

/// Denoiser weight files, in order of preference.
pub const DENOISER_WEIGHTS: [&str; 2] = [
    "model.safetensors",
    "diffusion_pytorch_model.safetensors",
];

pub const CONFIG_FILE: &str = "config.json";
pub const VOCODER_CONFIG: &str = "vocoder/config.json";
pub const VOCODER_WEIGHTS: &str = "vocoder/vocoder.pt";
pub const VAE_WEIGHTS: &str = "diffusion_pytorch_model.safetensors";

/// Fine-tuned SD VAE decoder variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum VaeVariant {
    #[default]
    Ema,
    Mse,
}

impl VaeVariant {
    /// Hub repository of the variant.
    pub fn repo(self) -> &'static str {
        match self {
            VaeVariant::Ema => "stabilityai/sd-vae-ft-ema",
            VaeVariant::Mse => "stabilityai/sd-vae-ft-mse",
        }
    }
}

/// Where files of one model come from.
pub enum AssetSource {
    Local(PathBuf),
    Hub { id: String, repo: ApiRepo },
}

impl AssetSource {
    /// Local directory if `repo_or_dir` is one, hub repository otherwise.
    pub fn new(repo_or_dir: &str) -> Result<Self> {
        let path = Path::new(repo_or_dir);
        if path.is_dir() {
            return Ok(AssetSource::Local(path.to_path_buf()));
        }
        let api = Api::new()?;
        Ok(AssetSource::Hub {
            id: repo_or_dir.to_string(),
            repo: api.model(repo_or_dir.to_string()),
        })
    }

    /// Path of `filename`, downloading it if needed.
    pub fn get(&self, filename: &str) -> Result<PathBuf> {
        match self {
            AssetSource::Local(dir) => {
                let path = dir.join(filename);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(Error::WeightLoad(format!(
                        "{filename} not found in {}",
                        dir.display()
                    )))
                }
            }
            AssetSource::Hub { id, repo } => {
                tracing::debug!(repo = %id, file = filename, "fetching");
                repo.get(filename)
                    .map_err(|e| Error::HfHub(format!("{id}/{filename}: {e}")))
            }
        }
    }

    /// First of `candidates` that exists.
    pub fn get_first(&self, candidates: &[&str]) -> Result<PathBuf> {
        let mut last_error = None;
        for name in candidates {
            match self.get(name) {
                Ok(path) => return Ok(path),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::WeightLoad("no candidate files".into())))
    }

    pub fn describe(&self) -> String {
        match self {
            AssetSource::Local(dir) => dir.display().to_string(),
            AssetSource::Hub { id, .. } => id.clone(),
        }
    }
}

/// Resolve one file of a model.
pub fn resolve(repo_or_dir: &str, filename: &str) -> Result<PathBuf> {
    AssetSource::new(repo_or_dir)?.get(filename)
}

/// Local paths of everything a FLAV checkpoint ships.
#[derive(Debug, Clone)]
pub struct FlavAssets {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub vocoder_config: PathBuf,
    pub vocoder_weights: PathBuf,
}

impl FlavAssets {
    pub fn fetch(model_ckpt: &str) -> Result<Self> {
        let source = AssetSource::new(model_ckpt)?;
        tracing::info!(source = %source.describe(), "resolving FLAV checkpoint");
        let assets = Self {
            config: source.get(CONFIG_FILE)?,
            weights: source.get_first(&DENOISER_WEIGHTS)?,
            vocoder_config: source.get(VOCODER_CONFIG)?,
            vocoder_weights: source.get(VOCODER_WEIGHTS)?,
        };
        tracing::debug!(weights = %assets.weights.display(), "denoiser weights");
        Ok(assets)
    }
}

/// SD VAE weights for `variant`; `local` overrides the hub download.
pub fn vae_weights(variant: VaeVariant, local: Option<&Path>) -> Result<PathBuf> {
    match local {
        Some(dir) if dir.is_dir() => AssetSource::Local(dir.to_path_buf()).get(VAE_WEIGHTS),
        Some(file) => Ok(file.to_path_buf()),
        None => resolve(variant.repo(), VAE_WEIGHTS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn local_directory_wins() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE);
        let source = AssetSource::new(dir.path().to_str().unwrap()).unwrap();
        assert!(matches!(source, AssetSource::Local(_)));
        assert_eq!(source.get(CONFIG_FILE).unwrap(), dir.path().join(CONFIG_FILE));
        assert!(source.get("missing.json").is_err());
    }

    #[test]
    fn fetch_local_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            CONFIG_FILE,
            "diffusion_pytorch_model.safetensors",
            VOCODER_CONFIG,
            VOCODER_WEIGHTS,
        ] {
            touch(dir.path(), name);
        }
        let assets = FlavAssets::fetch(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(
            assets.weights,
            dir.path().join("diffusion_pytorch_model.safetensors")
        );
        assert_eq!(assets.vocoder_weights, dir.path().join(VOCODER_WEIGHTS));
    }

    #[test]
    fn safetensors_preferred() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            CONFIG_FILE,
            "model.safetensors",
            "diffusion_pytorch_model.safetensors",
            VOCODER_CONFIG,
            VOCODER_WEIGHTS,
        ] {
            touch(dir.path(), name);
        }
        let assets = FlavAssets::fetch(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(assets.weights, dir.path().join("model.safetensors"));
    }

    #[test]
    fn ema_checkpoint_is_not_a_candidate() {
        let dir = tempfile::tempdir().unwrap();
        for name in [CONFIG_FILE, "checkpoints/ema.pth", VOCODER_CONFIG, VOCODER_WEIGHTS] {
            touch(dir.path(), name);
        }
        let result = FlavAssets::fetch(dir.path().to_str().unwrap());
        assert!(matches!(result, Err(Error::WeightLoad(_))));
    }

    #[test]
    fn missing_vocoder_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE);
        touch(dir.path(), "model.safetensors");
        assert!(FlavAssets::fetch(dir.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn vae_repos() {
        assert_eq!(VaeVariant::Ema.repo(), "stabilityai/sd-vae-ft-ema");
        assert_eq!(VaeVariant::Mse.repo(), "stabilityai/sd-vae-ft-mse");
    }

    #[test]
    fn local_vae_file() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), VAE_WEIGHTS);
        let path = vae_weights(VaeVariant::Ema, Some(dir.path())).unwrap();
        assert_eq!(path, dir.path().join(VAE_WEIGHTS));
    }
}
