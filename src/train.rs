//! Next-sample training of the next-sample LSTM.
//!
//! A fixed corpus of shape `(N, T, C)` trains on `data[:, ..T-1, :]` against
//! `data[:, 1.., :]`, one optimizer update per epoch. A live directory instead
//! turns every batch into an update, pairing each file with itself shifted by
//! one step. Either way the loss only covers positions inside the original
//! recording: padding never contributes.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor, TensorData};
use ndarray::{s, Array3};
use serde::Serialize;

use crate::audio::batch::{Batch, DirectoryBatches};
use crate::config::{AudioSpec, ModelSettings, TrainingConfig};
use crate::corpus::Corpus;
use crate::dictionary::AmplitudeDictionary;
use crate::model::checkpoint::{self, CheckpointMetadata};
use crate::model::{LstmModel, LstmModelConfig, SequenceModel};
use crate::perf::{self, Metric};
use crate::{Error, Result};

/// How long a training run lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochBudget {
    /// Exactly this many epochs, unless cancelled.
    Fixed(usize),
    /// A single pass over the input.
    UntilExhausted,
}

/// Where training examples come from.
#[derive(Debug, Clone, Copy)]
pub enum TrainingSource<'a> {
    /// A materialized corpus; the whole corpus is one update per epoch.
    Corpus(&'a Corpus),
    /// A live directory scan; every batch is one update and every pass over
    /// the directory is one epoch.
    Directory { dir: &'a Path, spec: AudioSpec },
}

/// Lifecycle of a [`Trainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    Uninitialized,
    Built,
    Training,
    Checkpointed,
}

/// What a call to [`Trainer::train`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSummary {
    /// Epochs completed by this call.
    pub epochs: usize,
    /// Optimizer updates applied by this call.
    pub steps: usize,
    /// Training loss of the last completed epoch.
    pub last_loss: Option<f64>,
    /// Held-out loss of the last completed epoch.
    pub validation_loss: Option<f64>,
    /// Whether the run stopped on the cancellation flag.
    pub cancelled: bool,
    /// Files skipped while scanning a live directory.
    pub skipped_files: usize,
}

/// Inputs, targets and validity mask for one update, all `(N, T, C)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencePair {
    pub input: Array3<f64>,
    pub target: Array3<f64>,
    /// 1.0 where the target lies inside the original recording, else 0.0.
    pub mask: Array3<f64>,
}

impl SequencePair {
    /// Number of masked-in elements.
    pub fn valid_elements(&self) -> f64 {
        self.mask.sum()
    }

    fn to_tensors<B: Backend>(&self, device: &B::Device) -> TensorPair<B> {
        TensorPair {
            input: to_tensor(&self.input, device),
            target: to_tensor(&self.target, device),
            mask: to_tensor(&self.mask, device),
            valid: self.valid_elements(),
        }
    }
}

/// Split `data` into next-step prediction pairs.
///
/// Position `(n, t)` counts toward the loss when `t + 1 < lengths[n]`.
///
/// # Errors
///
/// [`Error::Configuration`] when there are no examples, fewer than two time
/// steps, or no valid position at all.
pub fn next_step_pair(data: &Array3<f64>, lengths: &[usize]) -> Result<SequencePair> {
    let (examples, steps, channels) = data.dim();
    if examples == 0 {
        return Err(Error::config("no training examples"));
    }
    if steps < 2 {
        return Err(Error::config(format!(
            "examples need at least two time steps, got {steps}"
        )));
    }
    if lengths.len() != examples {
        return Err(Error::config(format!(
            "{} lengths for {examples} examples",
            lengths.len()
        )));
    }

    let unroll = steps - 1;
    let input = data.slice(s![.., ..unroll, ..]).to_owned();
    let target = data.slice(s![.., 1.., ..]).to_owned();
    let mut mask = Array3::zeros((examples, unroll, channels));
    for (row, &length) in lengths.iter().enumerate() {
        let valid = length.saturating_sub(1).min(unroll);
        mask.slice_mut(s![row, ..valid, ..]).fill(1.0);
    }

    let pair = SequencePair {
        input,
        target,
        mask,
    };
    if pair.valid_elements() == 0.0 {
        return Err(Error::config("no example is longer than one time step"));
    }
    Ok(pair)
}

/// Pair every batch member with itself shifted one step ahead.
///
/// The target gets a zero row appended at the end. That row is padding and
/// is masked out along with any other padding.
pub fn shifted_pair(batch: &Batch) -> Result<SequencePair> {
    let stacked = batch.to_array();
    let (examples, steps, channels) = stacked.dim();
    let mut extended = Array3::zeros((examples, steps + 1, channels));
    extended.slice_mut(s![.., ..steps, ..]).assign(&stacked);
    next_step_pair(&extended, &batch.lengths)
}

/// Mean squared error over the masked-in elements.
pub fn masked_mse<B: Backend>(
    prediction: Tensor<B, 3>,
    target: Tensor<B, 3>,
    mask: Tensor<B, 3>,
    valid: f64,
) -> Tensor<B, 1> {
    let error = prediction - target;
    (error.clone() * error * mask).sum().div_scalar(valid)
}

/// Coefficient of determination over the masked-in elements.
fn r_squared<B: Backend>(
    prediction: Tensor<B, 3>,
    target: Tensor<B, 3>,
    mask: Tensor<B, 3>,
    valid: f64,
) -> f64 {
    let mean = scalar((target.clone() * mask.clone()).sum()) / valid;
    let total = scalar((target.clone().sub_scalar(mean).powf_scalar(2.0) * mask.clone()).sum());
    let residual = scalar(((prediction - target).powf_scalar(2.0) * mask).sum());
    if total > 0.0 {
        1.0 - residual / total
    } else {
        0.0
    }
}

/// Size the global rayon pool used by the tensor kernels.
pub fn configure_threads(threads: usize) -> Result<()> {
    if threads == 0 {
        return Err(Error::config("thread count must be at least 1"));
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .map_err(|e| Error::config(format!("cannot size thread pool: {e}")))
}

struct TensorPair<B: Backend> {
    input: Tensor<B, 3>,
    target: Tensor<B, 3>,
    mask: Tensor<B, 3>,
    valid: f64,
}

#[derive(Debug, Clone, Copy)]
struct StepLoss {
    loss: f64,
    r2: f64,
}

/// Owns the model between build and checkpoint.
pub struct Trainer<B: AutodiffBackend> {
    device: B::Device,
    config: TrainingConfig,
    settings: ModelSettings,
    model: Option<LstmModel<B>>,
    metadata: Option<CheckpointMetadata>,
    checkpoint_dir: Option<PathBuf>,
    phase: TrainerPhase,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, settings: ModelSettings, device: B::Device) -> Result<Self> {
        config.validate()?;
        if settings.hidden_size == 0 {
            return Err(Error::config("hidden size must be at least 1"));
        }
        Ok(Self {
            device,
            config,
            settings,
            model: None,
            metadata: None,
            checkpoint_dir: None,
            phase: TrainerPhase::Uninitialized,
        })
    }

    /// Reconstruct a trainer from the checkpoint in `dir`.
    ///
    /// Architecture, learning rate and epoch count come from the checkpoint;
    /// later checkpoints go back to `dir` unless redirected.
    pub fn resume(dir: impl AsRef<Path>, mut config: TrainingConfig, device: B::Device) -> Result<Self> {
        let dir = dir.as_ref();
        let (model, metadata) = checkpoint::load::<B>(dir, &device)?;
        if config.learning_rate != metadata.learning_rate {
            tracing::info!(
                "Using learning rate {} from checkpoint",
                metadata.learning_rate
            );
        }
        config.learning_rate = metadata.learning_rate;
        config.validate()?;
        tracing::info!(
            "Resuming from {} after {} epochs",
            dir.display(),
            metadata.epochs_completed
        );
        Ok(Self {
            device,
            config,
            settings: ModelSettings {
                hidden_size: metadata.model.hidden_size,
            },
            model: Some(model),
            metadata: Some(metadata),
            checkpoint_dir: Some(dir.to_path_buf()),
            phase: TrainerPhase::Built,
        })
    }

    /// Write checkpoints into `dir` during and after training.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn metadata(&self) -> Option<&CheckpointMetadata> {
        self.metadata.as_ref()
    }

    pub fn model(&self) -> Option<&LstmModel<B>> {
        self.model.as_ref()
    }

    pub fn epochs_completed(&self) -> usize {
        self.metadata.as_ref().map_or(0, |m| m.epochs_completed)
    }

    /// Create a fresh model sized for `corpus`.
    pub fn build(&mut self, corpus: &Corpus) -> Result<()> {
        self.ensure_uninitialized()?;
        let (examples, steps, channels) = corpus.shape();
        if examples == 0 {
            return Err(Error::config("corpus has no examples"));
        }
        if steps < 2 {
            return Err(Error::config(format!(
                "corpus examples need at least two time steps, got {steps}"
            )));
        }

        let model_config =
            LstmModelConfig::new(channels, self.settings.hidden_size).with_unroll_length(steps - 1);
        let mut metadata = CheckpointMetadata::new(model_config, self.config.learning_rate);
        metadata.sample_rate = corpus.sample_rate();
        if self.config.build_dictionary {
            let dictionary = AmplitudeDictionary::build(corpus.valid_amplitudes());
            tracing::info!("Amplitude dictionary has {} entries", dictionary.len());
            metadata.dictionary = Some(dictionary);
        }
        self.install(model_config, metadata);
        Ok(())
    }

    /// Create a fresh model for files matching `spec`, to be trained from a
    /// live directory.
    pub fn build_streaming(&mut self, spec: AudioSpec) -> Result<()> {
        self.ensure_uninitialized()?;
        if spec.channels == 0 {
            return Err(Error::config("channel count must be at least 1"));
        }
        let model_config = LstmModelConfig::new(spec.channels, self.settings.hidden_size);
        let mut metadata = CheckpointMetadata::new(model_config, self.config.learning_rate);
        metadata.sample_rate = Some(spec.sample_rate);
        self.install(model_config, metadata);
        Ok(())
    }

    /// Run training until `budget` is spent or `cancel` is raised.
    ///
    /// The final checkpoint is written whenever a checkpoint directory is
    /// set, including after cancellation.
    pub fn train(
        &mut self,
        source: TrainingSource<'_>,
        budget: EpochBudget,
        cancel: &AtomicBool,
    ) -> Result<TrainingSummary> {
        if self.phase == TrainerPhase::Uninitialized {
            return Err(Error::config("the model must be built before training"));
        }
        let mut history = match &self.config.log_dir {
            Some(dir) => Some(HistoryLog::create(dir)?),
            None => None,
        };
        let mut optim = AdamConfig::new().init::<B, LstmModel<B>>();
        let mut summary = TrainingSummary::default();

        match source {
            TrainingSource::Corpus(corpus) => {
                self.check_corpus(corpus)?;
                self.phase = TrainerPhase::Training;
                self.train_corpus(corpus, budget, cancel, &mut optim, &mut history, &mut summary)?;
            }
            TrainingSource::Directory { dir, spec } => {
                self.check_channels(spec.channels)?;
                self.phase = TrainerPhase::Training;
                self.train_directory(dir, spec, budget, cancel, &mut optim, &mut history, &mut summary)?;
            }
        }

        tracing::info!(
            "Trained {} epochs ({} updates), last loss {}",
            summary.epochs,
            summary.steps,
            summary
                .last_loss
                .map_or_else(|| "n/a".to_string(), |loss| format!("{loss:.6}"))
        );
        if let Some(dir) = self.checkpoint_dir.clone() {
            self.save_checkpoint(&dir)?;
        }
        Ok(summary)
    }

    /// Write the current model and metadata into `dir`.
    pub fn save_checkpoint(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let (model, metadata) = self
            .model
            .as_ref()
            .zip(self.metadata.as_ref())
            .ok_or_else(|| Error::config("no model to checkpoint"))?;
        checkpoint::save(dir, model, metadata)?;
        self.phase = TrainerPhase::Checkpointed;
        Ok(())
    }

    fn ensure_uninitialized(&self) -> Result<()> {
        if self.phase != TrainerPhase::Uninitialized {
            return Err(Error::config("the model has already been built"));
        }
        Ok(())
    }

    fn install(&mut self, model_config: LstmModelConfig, metadata: CheckpointMetadata) {
        tracing::info!(
            "Built LSTM with {} channels, hidden size {}{}",
            model_config.channels,
            model_config.hidden_size,
            model_config
                .unroll_length
                .map_or_else(String::new, |len| format!(", unrolled over {len} steps"))
        );
        self.model = Some(model_config.init::<B>(&self.device));
        self.metadata = Some(metadata);
        self.phase = TrainerPhase::Built;
    }

    fn model_config(&self) -> Result<LstmModelConfig> {
        self.metadata
            .as_ref()
            .map(|m| m.model)
            .ok_or_else(|| Error::config("the model must be built before training"))
    }

    fn check_channels(&self, channels: usize) -> Result<()> {
        let expected = self.model_config()?.channels;
        if channels != expected {
            return Err(Error::config(format!(
                "input has {channels} channels, the model expects {expected}"
            )));
        }
        Ok(())
    }

    fn check_corpus(&self, corpus: &Corpus) -> Result<()> {
        let (_, steps, channels) = corpus.shape();
        self.check_channels(channels)?;
        if let Some(unroll) = self.model_config()?.unroll_length {
            if steps.saturating_sub(1) != unroll {
                return Err(Error::config(format!(
                    "corpus unrolls over {} steps, the model was built for {unroll}",
                    steps.saturating_sub(1)
                )));
            }
        }
        Ok(())
    }

    fn train_corpus<O: Optimizer<LstmModel<B>, B>>(
        &mut self,
        corpus: &Corpus,
        budget: EpochBudget,
        cancel: &AtomicBool,
        optim: &mut O,
        history: &mut Option<HistoryLog>,
        summary: &mut TrainingSummary,
    ) -> Result<()> {
        let held_out = (corpus.shape().0 as f64 * self.config.validation_fraction).floor() as usize;
        let (training, validation) = corpus.split_tail(held_out);
        let pair = next_step_pair(training.data(), training.lengths())?
            .to_tensors::<B>(&self.device);
        let validation = validation.and_then(|held| {
            match next_step_pair(held.data(), held.lengths()) {
                Ok(pair) => Some(pair.to_tensors::<B::InnerBackend>(&self.device)),
                Err(e) => {
                    tracing::warn!("Not validating: {e}");
                    None
                }
            }
        });
        if validation.is_some() {
            tracing::info!("Holding out {held_out} examples for validation");
        }

        let epochs = match budget {
            EpochBudget::Fixed(epochs) => epochs,
            EpochBudget::UntilExhausted => 1,
        };
        for _ in 0..epochs {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!("Training cancelled");
                summary.cancelled = true;
                break;
            }
            let started = Instant::now();
            let step = {
                let _span = perf::span(Metric::TrainEpoch);
                self.step(optim, &pair, summary)?
            };
            let validation_loss = validation.as_ref().map(|held| self.evaluate(held)).transpose()?;
            self.finish_epoch(step, validation_loss, started, history, summary)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn train_directory<O: Optimizer<LstmModel<B>, B>>(
        &mut self,
        dir: &Path,
        spec: AudioSpec,
        budget: EpochBudget,
        cancel: &AtomicBool,
        optim: &mut O,
        history: &mut Option<HistoryLog>,
        summary: &mut TrainingSummary,
    ) -> Result<()> {
        let passes = match budget {
            EpochBudget::Fixed(passes) => passes,
            EpochBudget::UntilExhausted => 1,
        };
        for _ in 0..passes {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!("Training cancelled");
                summary.cancelled = true;
                break;
            }
            let started = Instant::now();
            let _span = perf::span(Metric::TrainEpoch);

            // Each pass takes a fresh snapshot of the directory.
            let mut batches = DirectoryBatches::open(dir, self.config.batch_size, spec)?
                .prefetch(self.config.prefetch);
            let mut losses = Vec::new();
            let mut failure = None;
            for batch in batches.by_ref() {
                if cancel.load(Ordering::Relaxed) {
                    summary.cancelled = true;
                    break;
                }
                let pair = match shifted_pair(&batch) {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::debug!("Skipping batch of {} files: {e}", batch.len());
                        continue;
                    }
                };
                let tensors = pair.to_tensors::<B>(&self.device);
                match self.step(optim, &tensors, summary) {
                    Ok(step) => losses.push(step),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            let skipped = batches.finish();
            if let Some(e) = failure {
                return Err(e);
            }
            summary.skipped_files += skipped?.len();

            // A pass cut short by cancellation is not an epoch. Its updates
            // stay in the model and reach the final checkpoint.
            if summary.cancelled {
                tracing::info!(
                    "Training cancelled after {} batches of the current pass",
                    losses.len()
                );
                break;
            }
            if losses.is_empty() {
                return Err(Error::config(format!(
                    "no usable audio files in {}",
                    dir.display()
                )));
            }
            let count = losses.len() as f64;
            let epoch = StepLoss {
                loss: losses.iter().map(|s| s.loss).sum::<f64>() / count,
                r2: losses.iter().map(|s| s.r2).sum::<f64>() / count,
            };
            self.finish_epoch(epoch, None, started, history, summary)?;
        }
        Ok(())
    }

    fn step<O: Optimizer<LstmModel<B>, B>>(
        &mut self,
        optim: &mut O,
        pair: &TensorPair<B>,
        summary: &mut TrainingSummary,
    ) -> Result<StepLoss> {
        let model = self
            .model
            .take()
            .ok_or_else(|| Error::config("the model must be built before training"))?;

        let (prediction, _) = model.forward_sequence(pair.input.clone(), None);
        let r2 = r_squared(
            prediction.clone().inner(),
            pair.target.clone().inner(),
            pair.mask.clone().inner(),
            pair.valid,
        );
        let loss = masked_mse(prediction, pair.target.clone(), pair.mask.clone(), pair.valid);
        let loss_value = scalar(loss.clone());

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        self.model = Some(optim.step(self.config.learning_rate, model, grads));

        perf::add_count(Metric::GradientSteps, 1);
        summary.steps += 1;
        Ok(StepLoss {
            loss: loss_value,
            r2,
        })
    }

    fn evaluate(&self, held: &TensorPair<B::InnerBackend>) -> Result<f64> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| Error::config("no model to evaluate"))?
            .valid();
        let (prediction, _) = model.forward_sequence(held.input.clone(), None);
        Ok(scalar(masked_mse(
            prediction,
            held.target.clone(),
            held.mask.clone(),
            held.valid,
        )))
    }

    fn finish_epoch(
        &mut self,
        step: StepLoss,
        validation_loss: Option<f64>,
        started: Instant,
        history: &mut Option<HistoryLog>,
        summary: &mut TrainingSummary,
    ) -> Result<()> {
        let epoch = match self.metadata.as_mut() {
            Some(metadata) => {
                metadata.epochs_completed += 1;
                metadata.epochs_completed
            }
            None => return Err(Error::config("no model metadata")),
        };
        summary.epochs += 1;
        summary.last_loss = Some(step.loss);
        summary.validation_loss = validation_loss;

        match validation_loss {
            Some(held) => tracing::debug!(
                "epoch {epoch}: loss {:.6}, r2 {:.4}, validation loss {held:.6}",
                step.loss,
                step.r2
            ),
            None => tracing::debug!("epoch {epoch}: loss {:.6}, r2 {:.4}", step.loss, step.r2),
        }
        if let Some(log) = history.as_mut() {
            log.append(&EpochRecord {
                epoch,
                loss: step.loss,
                r2: step.r2,
                validation_loss,
                seconds: started.elapsed().as_secs_f64(),
            })?;
        }

        if let (Some(every), Some(dir)) = (self.config.checkpoint_every, self.checkpoint_dir.clone()) {
            if epoch % every == 0 {
                self.save_checkpoint(&dir)?;
                self.phase = TrainerPhase::Training;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct EpochRecord {
    epoch: usize,
    loss: f64,
    r2: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation_loss: Option<f64>,
    seconds: f64,
}

/// Per-epoch losses appended to `<log_dir>/<run id>.jsonl`.
struct HistoryLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl HistoryLog {
    fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let run_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        let path = dir.join(format!("{run_id}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        tracing::info!("Logging training history to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn append(&mut self, record: &EpochRecord) -> Result<()> {
        let line = serde_json::to_string(record).map_err(|e| Error::config(e.to_string()))?;
        writeln!(self.writer, "{line}")
            .and_then(|()| self.writer.flush())
            .map_err(|e| Error::io(&self.path, e))
    }
}

fn to_tensor<B: Backend>(array: &Array3<f64>, device: &B::Device) -> Tensor<B, 3> {
    let (examples, steps, channels) = array.dim();
    let values: Vec<f64> = array.iter().copied().collect();
    Tensor::from_data(TensorData::new(values, [examples, steps, channels]), device)
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}
