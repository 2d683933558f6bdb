//! Checkpoint directories: a parameter file plus `metadata.json`.
//!
//! Parameters go through burn's named MessagePack recorder at double
//! precision. The metadata file carries the hyperparameters needed to rebuild
//! the module before loading its record, so nothing is guessed on load.
//!
//! Parameters alternate between two slot files and `metadata.json` names the
//! slot it belongs to. A save fills the slot the current metadata does not
//! point at, then renames the new metadata into place, so the metadata a
//! reader sees always refers to the parameters written with it.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{DoublePrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use super::lstm::{LstmModel, LstmModelConfig};
use crate::dictionary::AmplitudeDictionary;
use crate::perf::{self, Metric};
use crate::{Error, Result};

/// Bumped whenever the metadata layout changes incompatibly.
pub const FORMAT_VERSION: u32 = 1;

const WEIGHT_SLOTS: [&str; 2] = ["model-a.mpk", "model-b.mpk"];
const LEGACY_WEIGHTS: &str = "model.mpk";
const MODEL_STAGING: &str = "model-staging";
const METADATA_FILE: &str = "metadata.json";
const METADATA_STAGING: &str = "metadata.json.partial";

type Recorder = NamedMpkFileRecorder<DoublePrecisionSettings>;

/// Everything besides the parameters that a checkpoint must carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub format_version: u32,
    pub model: LstmModelConfig,
    pub learning_rate: f64,
    pub epochs_completed: usize,
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub dictionary: Option<AmplitudeDictionary>,
}

impl CheckpointMetadata {
    pub fn new(model: LstmModelConfig, learning_rate: f64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            model,
            learning_rate,
            epochs_completed: 0,
            sample_rate: None,
            dictionary: None,
        }
    }
}

/// On-disk layout of `metadata.json`.
#[derive(Serialize, Deserialize)]
struct MetadataFile {
    #[serde(flatten)]
    metadata: CheckpointMetadata,
    #[serde(default = "legacy_weights")]
    weights: String,
}

fn legacy_weights() -> String {
    LEGACY_WEIGHTS.to_string()
}

/// Path of the metadata file inside a checkpoint directory.
pub fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILE)
}

/// Path of the parameter file the metadata in `dir` refers to.
pub fn weights_path(dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    Ok(dir.join(read_metadata_file(dir)?.weights))
}

/// Write `model` and `metadata` into `dir`, creating it if needed.
pub fn save<B: Backend>(
    dir: impl AsRef<Path>,
    model: &LstmModel<B>,
    metadata: &CheckpointMetadata,
) -> Result<()> {
    let dir = dir.as_ref();
    let _span = perf::span(Metric::CheckpointSave);
    tracing::info!(
        "Writing checkpoint to {} ({} epochs)",
        dir.display(),
        metadata.epochs_completed
    );
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let previous = read_metadata_file(dir).ok().map(|file| file.weights);
    let slot = WEIGHT_SLOTS
        .iter()
        .find(|slot| previous.as_deref() != Some(**slot))
        .copied()
        .unwrap_or(WEIGHT_SLOTS[0]);

    // The recorder appends its own extension to the staging name.
    let recorder = Recorder::new();
    model
        .clone()
        .save_file(dir.join(MODEL_STAGING), &recorder)
        .map_err(|e| Error::checkpoint(dir, e))?;
    let staged_model = dir.join(MODEL_STAGING).with_extension("mpk");
    fs::rename(&staged_model, dir.join(slot)).map_err(|e| Error::io(&staged_model, e))?;

    let file = MetadataFile {
        metadata: metadata.clone(),
        weights: slot.to_string(),
    };
    let json = serde_json::to_vec_pretty(&file).map_err(|e| Error::checkpoint(dir, e))?;
    let staged_metadata = dir.join(METADATA_STAGING);
    fs::write(&staged_metadata, json).map_err(|e| Error::io(&staged_metadata, e))?;
    fs::rename(&staged_metadata, metadata_path(dir)).map_err(|e| Error::io(dir, e))?;

    if let Some(previous) = previous.filter(|name| name != slot) {
        let stale = dir.join(previous);
        if let Err(e) = fs::remove_file(&stale) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Could not remove {}: {e}", stale.display());
            }
        }
    }
    Ok(())
}

/// Read only the metadata of the checkpoint in `dir`.
pub fn load_metadata(dir: impl AsRef<Path>) -> Result<CheckpointMetadata> {
    Ok(read_metadata_file(dir.as_ref())?.metadata)
}

fn read_metadata_file(dir: &Path) -> Result<MetadataFile> {
    let path = metadata_path(dir);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::checkpoint(dir, "no checkpoint found"));
        }
        Err(e) => return Err(Error::io(&path, e)),
    };
    let file: MetadataFile =
        serde_json::from_slice(&bytes).map_err(|e| Error::checkpoint(&path, e))?;
    let metadata = &file.metadata;
    if metadata.format_version != FORMAT_VERSION {
        return Err(Error::checkpoint(
            &path,
            format!(
                "format version {} is not supported (expected {FORMAT_VERSION})",
                metadata.format_version
            ),
        ));
    }
    if metadata.model.channels == 0 || metadata.model.hidden_size == 0 {
        return Err(Error::checkpoint(&path, "model dimensions must be non-zero"));
    }
    if file.weights != LEGACY_WEIGHTS && !WEIGHT_SLOTS.contains(&file.weights.as_str()) {
        return Err(Error::checkpoint(
            &path,
            format!("unknown parameter file {:?}", file.weights),
        ));
    }
    Ok(file)
}

/// Rebuild the model stored in `dir` on `device`.
pub fn load<B: Backend>(
    dir: impl AsRef<Path>,
    device: &B::Device,
) -> Result<(LstmModel<B>, CheckpointMetadata)> {
    let dir = dir.as_ref();
    let _span = perf::span(Metric::CheckpointLoad);
    tracing::info!("Reading checkpoint from {}", dir.display());

    let MetadataFile { metadata, weights } = read_metadata_file(dir)?;
    let path = dir.join(weights);
    if !path.is_file() {
        return Err(Error::checkpoint(&path, "parameter file is missing"));
    }
    let model = metadata
        .model
        .init::<B>(device)
        .load_file(path.clone(), &Recorder::new(), device)
        .map_err(|e| Error::checkpoint(&path, e))?;
    Ok((model, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SequenceModel;
    use burn::tensor::{Tensor, TensorData};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f64>;

    fn predictions(model: &LstmModel<TestBackend>, device: &NdArrayDevice) -> Vec<f64> {
        let input = Tensor::from_data(
            TensorData::new(vec![0.1, -0.2, 0.3, 0.05, -0.4, 0.25], [1, 3, 2]),
            device,
        );
        let (out, _) = model.forward_sequence(input, None);
        out.into_data().to_vec::<f64>().unwrap()
    }

    #[test]
    fn save_then_load_restores_parameters_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::default();
        let config = LstmModelConfig::new(2, 6).with_unroll_length(9);
        let model = config.init::<TestBackend>(&device);

        let mut metadata = CheckpointMetadata::new(config, 0.01);
        metadata.epochs_completed = 7;
        metadata.sample_rate = Some(44100);
        metadata.dictionary = Some(AmplitudeDictionary::build([0.5, -0.5]));
        save(dir.path(), &model, &metadata).unwrap();

        assert!(weights_path(dir.path()).unwrap().is_file());
        assert!(!dir.path().join(METADATA_STAGING).exists());

        let (loaded, loaded_metadata) = load::<TestBackend>(dir.path(), &device).unwrap();
        assert_eq!(loaded_metadata, metadata);
        assert_eq!(predictions(&loaded, &device), predictions(&model, &device));
    }

    #[test]
    fn missing_checkpoint_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load::<TestBackend>(dir.path(), &NdArrayDevice::default()).unwrap_err();
        assert!(matches!(err, Error::Checkpoint { .. }));
    }

    #[test]
    fn corrupt_metadata_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(metadata_path(dir.path()), b"{ not json").unwrap();
        assert!(matches!(
            load_metadata(dir.path()).unwrap_err(),
            Error::Checkpoint { .. }
        ));
    }

    #[test]
    fn corrupt_parameters_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = CheckpointMetadata::new(LstmModelConfig::new(2, 4), 1e-3);
        fs::write(
            metadata_path(dir.path()),
            serde_json::to_vec(&metadata).unwrap(),
        )
        .unwrap();
        fs::write(weights_path(dir.path()).unwrap(), b"garbage").unwrap();
        let err = load::<TestBackend>(dir.path(), &NdArrayDevice::default()).unwrap_err();
        assert!(matches!(err, Error::Checkpoint { .. }));
    }

    #[test]
    fn unknown_format_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = CheckpointMetadata::new(LstmModelConfig::new(2, 4), 1e-3);
        metadata.format_version = 99;
        fs::write(
            metadata_path(dir.path()),
            serde_json::to_vec(&metadata).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            load_metadata(dir.path()).unwrap_err(),
            Error::Checkpoint { .. }
        ));
    }

    #[test]
    fn overwrite_switches_slots_and_keeps_pairs_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::default();
        let config = LstmModelConfig::new(2, 3);
        let first = config.init::<TestBackend>(&device);
        let second = config.init::<TestBackend>(&device);

        let mut metadata = CheckpointMetadata::new(config, 1e-3);
        metadata.epochs_completed = 1;
        save(dir.path(), &first, &metadata).unwrap();
        let first_weights = weights_path(dir.path()).unwrap();

        metadata.epochs_completed = 2;
        save(dir.path(), &second, &metadata).unwrap();
        let second_weights = weights_path(dir.path()).unwrap();

        assert_ne!(first_weights, second_weights);
        assert!(!first_weights.exists());
        let (loaded, loaded_metadata) = load::<TestBackend>(dir.path(), &device).unwrap();
        assert_eq!(loaded_metadata.epochs_completed, 2);
        assert_eq!(predictions(&loaded, &device), predictions(&second, &device));
        assert_ne!(predictions(&loaded, &device), predictions(&first, &device));
    }

    #[test]
    fn unsorted_dictionary_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = CheckpointMetadata::new(LstmModelConfig::new(2, 4), 1e-3);
        let mut json = serde_json::to_value(&metadata).unwrap();
        json["dictionary"] = serde_json::json!([0.5, -0.25, 0.5]);
        fs::write(metadata_path(dir.path()), json.to_string()).unwrap();
        assert!(matches!(
            load_metadata(dir.path()).unwrap_err(),
            Error::Checkpoint { .. }
        ));
    }
}
