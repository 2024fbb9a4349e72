use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::{AeError, Result},
    hparams::ParamSet,
};

/// Gradient-based optimizer family used to fit the autoencoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OptimizerKind {
    Adam,
    Nadam,
    Adamax,
}

impl OptimizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Adam => "adam",
            Self::Nadam => "nadam",
            Self::Adamax => "adamax",
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = AeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::Adam),
            "nadam" => Ok(Self::Nadam),
            "adamax" => Ok(Self::Adamax),
            _ => Err(AeError::UnknownOptimizer(s.to_string())),
        }
    }
}

impl TryFrom<String> for OptimizerKind {
    type Error = AeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<OptimizerKind> for String {
    fn from(kind: OptimizerKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ranges and choice sets the search samples hyperparameters from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchLimits {
    pub layers: [i64; 2],
    /// Filter count range, one entry per possible encoder layer.
    pub filters: Vec<[i64; 2]>,
    pub kernel_sizes: Vec<i64>,
    pub l2: [f64; 2],
    pub activations: Vec<String>,
    pub latent_size: [i64; 2],
    pub learning_rate: [f64; 2],
    pub batch_size: [f64; 2],
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            layers: [1, 3],
            filters: vec![[4, 128], [4, 128], [4, 128]],
            kernel_sizes: vec![3, 5],
            l2: [1e-7, 1e-3],
            activations: ["relu", "elu", "tanh", "linear"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            latent_size: [5, 150],
            learning_rate: [1e-5, 1e-1],
            batch_size: [2.0, 32.0],
        }
    }
}

/// Median pruning settings for the search study.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrunerConfig {
    /// Completed trials required before any trial can be pruned.
    pub n_startup_trials: usize,
    /// Epochs each trial runs before it becomes eligible for pruning.
    pub n_warmup_steps: usize,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            n_startup_trials: 5,
            n_warmup_steps: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub data_path: String,
    pub dataset_name: String,
    pub train_fraction: f64,
    pub valid_fraction: f64,
    pub num_epochs: usize,
    pub optimizer: OptimizerKind,
    pub run_version: String,
    pub output_dir: String,
    pub seed: u64,
    pub num_workers: usize,
    pub num_trials: usize,
    /// History metric reported to the search after every epoch.
    pub monitor: String,
    pub limits: SearchLimits,
    pub pruner: PrunerConfig,
    /// Parameters for `replay`; the best known configuration when unset.
    pub replay_params: Option<ParamSet>,
    /// Dataset rows plotted after a replay.
    pub sample_records: Vec<usize>,
    pub plot_channel: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_path: "nn_data.safetensors".to_string(),
            dataset_name: "scaled_data".to_string(),
            train_fraction: 0.8,
            valid_fraction: 0.1,
            num_epochs: 30,
            optimizer: OptimizerKind::Adam,
            run_version: "1".to_string(),
            output_dir: "runs".to_string(),
            seed: 42,
            num_workers: 0,
            num_trials: 100,
            monitor: "val_loss_norm_error".to_string(),
            limits: SearchLimits::default(),
            pruner: PrunerConfig::default(),
            replay_params: None,
            sample_records: vec![99],
            plot_channel: 2,
        }
    }
}

impl RunConfig {
    /// Reads a JSON config; missing fields keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fractions_ok = self.train_fraction > 0.0
            && self.valid_fraction > 0.0
            && self.train_fraction + self.valid_fraction < 1.0;
        if !fractions_ok {
            return Err(AeError::InvalidSplit(format!(
                "train {} + valid {} must be positive and sum below 1",
                self.train_fraction, self.valid_fraction
            )));
        }
        if self.num_epochs == 0 {
            return Err(AeError::invalid("num_epochs", "must be > 0"));
        }
        if self.dataset_name.is_empty() {
            return Err(AeError::invalid("dataset_name", "must not be empty"));
        }
        let limits = &self.limits;
        if limits.layers[0] < 1 || limits.layers[1] as usize > limits.filters.len() {
            return Err(AeError::invalid(
                "limits.layers",
                format!("needs 1 <= low and one filter range per layer, got {:?}", limits.layers),
            ));
        }
        if limits.layers[1] as usize > crate::autoencoder::STRIDES.len() {
            return Err(AeError::invalid(
                "limits.layers",
                format!("at most {} layers have a stride", crate::autoencoder::STRIDES.len()),
            ));
        }
        if limits.kernel_sizes.is_empty() || limits.activations.is_empty() {
            return Err(AeError::invalid("limits", "kernel and activation choices must not be empty"));
        }
        if limits.l2[0] <= 0.0 || limits.learning_rate[0] <= 0.0 {
            return Err(AeError::invalid("limits", "log-uniform ranges need a positive low bound"));
        }
        Ok(())
    }
}
