//! Configuration for audio validation, training, and composition.
//!
//! Every field has a default, so an empty YAML document (or no file at all)
//! yields a usable [`Config`]. CLI flags override individual values after
//! loading. Configurations are loaded from YAML with [`load_config`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::audio::SampleEncoding;
use crate::{Error, Result};

/// Sample rate every input file must have unless configured otherwise.
pub const DEFAULT_RATE: u32 = 44100;
/// Channel count every input file must have unless configured otherwise.
pub const DEFAULT_CHANNELS: usize = 2;
/// Training epochs when none are configured.
pub const DEFAULT_EPOCHS: usize = 5000;
/// Worker threads for tensor kernels when none are configured.
pub const DEFAULT_THREADS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Expected shape of every audio file fed to the pipeline.
pub struct AudioSpec {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: usize,
}

impl Default for AudioSpec {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_RATE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

impl AudioSpec {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Optimizer and epoch settings for the trainer.
pub struct TrainingConfig {
    /// Number of epochs. Ignored by streaming runs that train until the
    /// directory is exhausted.
    pub epochs: usize,
    /// Adam learning rate.
    pub learning_rate: f64,
    /// Files per batch when training from a live directory scan.
    pub batch_size: usize,
    /// Size of the rayon pool used by the tensor backend.
    pub threads: usize,
    /// Write a checkpoint every N epochs in addition to the final one.
    pub checkpoint_every: Option<usize>,
    /// Fraction of corpus rows held out for validation loss.
    pub validation_fraction: f64,
    /// Batches assembled ahead of the gradient step in streaming mode.
    pub prefetch: usize,
    /// Build the amplitude dictionary from the corpus before training.
    pub build_dictionary: bool,
    /// Directory receiving per-epoch loss history as JSON lines.
    pub log_dir: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            learning_rate: 1e-3,
            batch_size: 1,
            threads: DEFAULT_THREADS,
            checkpoint_every: None,
            validation_fraction: 0.0,
            prefetch: 2,
            build_dictionary: true,
            log_dir: None,
        }
    }
}

impl TrainingConfig {
    /// Reject values no training run could use.
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::config(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch size must be at least 1"));
        }
        if self.threads == 0 {
            return Err(Error::config("thread count must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(Error::config(format!(
                "validation fraction must be in [0, 1), got {}",
                self.validation_fraction
            )));
        }
        if self.checkpoint_every == Some(0) {
            return Err(Error::config("checkpoint interval must be at least 1 epoch"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Architecture settings that are not implied by the corpus shape.
pub struct ModelSettings {
    /// Width of the LSTM hidden state.
    pub hidden_size: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self { hidden_size: 64 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Generation settings.
pub struct ComposeConfig {
    /// Number of time steps to generate.
    pub duration: usize,
    /// Snap each generated sample to the nearest amplitude seen in training.
    pub quantize: bool,
    /// Peak-normalize the composition before writing it.
    pub normalize: bool,
    /// Truncate corpus seeds to this many steps.
    pub seed_length: Option<usize>,
    /// Sample layout of the written WAV file.
    pub encoding: SampleEncoding,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            duration: DEFAULT_RATE as usize,
            quantize: false,
            normalize: false,
            seed_length: None,
            encoding: SampleEncoding::Float32,
        }
    }
}

/// Top-level configuration.
///
/// # Example YAML
///
/// ```yaml
/// audio: { sample_rate: 44100, channels: 2 }
/// training:
///   epochs: 200
///   learning_rate: 0.001
///   threads: 4
///   checkpoint_every: 50
/// model: { hidden_size: 128 }
/// compose: { duration: 88200, quantize: true, encoding: int16 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub audio: AudioSpec,
    pub training: TrainingConfig,
    pub model: ModelSettings,
    pub compose: ComposeConfig,
}

/// Load a configuration from a YAML file.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if the file doesn't exist and
/// [`Error::Configuration`] if it contains invalid YAML or unknown keys.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::NotFound {
            path: path.to_path_buf(),
        });
    }

    let data = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let mut config: Config = serde_yaml::from_str(&data)
        .map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
    if let Some(log_dir) = config.training.log_dir.take() {
        config.training.log_dir = Some(resolve_relative_path(path, &log_dir));
    }
    Ok(config)
}

/// Resolve a possibly relative path against a config file location.
pub fn resolve_relative_path(config_path: &Path, maybe_relative: &Path) -> PathBuf {
    if maybe_relative.is_absolute() {
        return maybe_relative.to_path_buf();
    }
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(maybe_relative)
}
