//! Persisted models: burn `.mpk` weights plus a JSON sidecar describing how
//! to rebuild the module before loading them.

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    autoencoder::{ConvAutoencoder, ConvAutoencoderConfig},
    config::OptimizerKind,
    error::{AeError, Result},
    hparams::ParamSet,
};

const STEM_PREFIX: &str = "model_ae-smp_";

/// `model_ae-smp_{run_version}-{trial}`; `trial` is a trial number or `replay`.
pub fn artifact_stem(run_version: &str, trial: &str) -> String {
    format!("{STEM_PREFIX}{run_version}-{trial}")
}

/// Sidecar written next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub model: ConvAutoencoderConfig,
    pub params: ParamSet,
    pub optimizer: OptimizerKind,
    pub epochs_trained: usize,
}

const WEIGHTS_EXTENSION: &str = "mpk";
const SIDECAR_EXTENSION: &str = "json";

/// File name of `path` without a trailing `.mpk` or `.json`.
///
/// Only those two suffixes are removed, so stems keep any dots they carry
/// (`model_ae-smp_1.2-0`).
pub fn artifact_name(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    [WEIGHTS_EXTENSION, SIDECAR_EXTENSION]
        .into_iter()
        .find_map(|ext| name.strip_suffix(ext)?.strip_suffix('.'))
        .or(Some(name))
}

fn artifact_file(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    dir.join(format!("{stem}.{extension}"))
}

/// Writes `{dir}/{stem}.mpk` and `{dir}/{stem}.json`, returning the weights path.
pub fn save_artifact<B: Backend>(
    model: &ConvAutoencoder<B>,
    spec: &ArtifactSpec,
    dir: &Path,
    stem: &str,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    // burn resets the extension of the path it is given, so hand it the full name
    let weights = artifact_file(dir, stem, WEIGHTS_EXTENSION);
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model.clone().save_file(weights.clone(), &recorder)?;

    let file = std::fs::File::create(artifact_file(dir, stem, SIDECAR_EXTENSION))?;
    serde_json::to_writer_pretty(file, spec)?;

    info!("💾 Model saved to {}", weights.display());
    Ok(weights)
}

/// Rebuilds the module from the sidecar and loads the weights into it.
///
/// `path` may name the weights, the sidecar, or the bare stem.
pub fn load_artifact<B: Backend>(path: &Path, device: &B::Device) -> Result<(ConvAutoencoder<B>, ArtifactSpec)> {
    let stem = artifact_name(path)
        .ok_or_else(|| AeError::invalid("artifact", format!("{} has no file name", path.display())))?;
    let dir = path.parent().unwrap_or_else(|| Path::new(""));

    let text = std::fs::read_to_string(artifact_file(dir, stem, SIDECAR_EXTENSION))?;
    let spec: ArtifactSpec = serde_json::from_str(&text)?;

    let weights = artifact_file(dir, stem, WEIGHTS_EXTENSION);
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let model = spec
        .model
        .init::<B>(device)?
        .load_file(weights.clone(), &recorder, device)?;
    info!("📂 Model loaded from {}", weights.display());
    Ok((model, spec))
}
