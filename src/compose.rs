//! Autoregressive generation from a trained checkpoint.
//!
//! The seed is fed through the model once to warm up the recurrent state.
//! The prediction after the last seed step is the first generated sample;
//! every generated sample is then fed back as the next input.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::{s, Array2};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::audio::io::SampleMatrix;
use crate::corpus::Corpus;
use crate::dictionary::AmplitudeDictionary;
use crate::model::checkpoint::{self, CheckpointMetadata};
use crate::model::{LstmModel, SequenceModel};
use crate::perf::{self, Metric};
use crate::{Error, Result};

/// Generates new sample sequences with a [`SequenceModel`].
pub struct Composer<B: Backend, M: SequenceModel<B> = LstmModel<B>> {
    model: M,
    device: B::Device,
    dictionary: Option<AmplitudeDictionary>,
    quantize: bool,
    sample_rate: Option<u32>,
    _backend: PhantomData<B>,
}

impl<B: Backend> Composer<B, LstmModel<B>> {
    /// Load the checkpoint in `dir` onto `device`.
    pub fn load(dir: impl AsRef<Path>, device: B::Device) -> Result<Self> {
        let (model, metadata) = checkpoint::load::<B>(dir, &device)?;
        let CheckpointMetadata {
            dictionary,
            sample_rate,
            ..
        } = metadata;
        let mut composer = Self::new(model, device, dictionary);
        composer.sample_rate = sample_rate;
        Ok(composer)
    }
}

impl<B: Backend, M: SequenceModel<B>> Composer<B, M> {
    pub fn new(model: M, device: B::Device, dictionary: Option<AmplitudeDictionary>) -> Self {
        Self {
            model,
            device,
            dictionary,
            quantize: false,
            sample_rate: None,
            _backend: PhantomData,
        }
    }

    /// Snap every generated sample to the nearest amplitude seen in training.
    ///
    /// Fails when the model carries no amplitude dictionary.
    pub fn with_quantization(mut self, enabled: bool) -> Result<Self> {
        if enabled && self.dictionary.as_ref().map_or(true, |d| d.is_empty()) {
            return Err(Error::config(
                "quantization needs a checkpoint with an amplitude dictionary",
            ));
        }
        self.quantize = enabled;
        Ok(self)
    }

    pub fn channels(&self) -> usize {
        self.model.channels()
    }

    /// Sample rate of the corpus the model was trained on, when known.
    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    pub fn dictionary(&self) -> Option<&AmplitudeDictionary> {
        self.dictionary.as_ref()
    }

    /// Generate `duration` time steps continuing `seed`.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for an empty seed and
    /// [`Error::ChannelMismatch`] when the seed width differs from the model's.
    pub fn compose(&self, seed: &SampleMatrix, duration: usize) -> Result<SampleMatrix> {
        let (seed_steps, channels) = seed.dim();
        if seed_steps == 0 {
            return Err(Error::config("the seed has no time steps"));
        }
        if channels != self.channels() {
            return Err(Error::ChannelMismatch {
                path: PathBuf::from("seed"),
                found: channels,
                expected: self.channels(),
            });
        }
        let mut output = Array2::zeros((duration, channels));
        if duration == 0 {
            return Ok(output);
        }
        tracing::info!("Composing {duration} steps from a {seed_steps}-step seed");

        let (mut next, mut state) = {
            let _span = perf::span(Metric::ComposeSeed);
            let input = self.tensor(seed.iter().copied().collect(), seed_steps, channels);
            let (prediction, state) = self.model.forward_sequence(input, None);
            (prediction.narrow(1, seed_steps - 1, 1), state)
        };

        for step in 0..duration {
            let _span = perf::span(Metric::ComposeStep);
            let mut sample = next
                .into_data()
                .convert::<f64>()
                .to_vec::<f64>()
                .map_err(|e| Error::config(format!("cannot read model output: {e:?}")))?;
            if self.quantize {
                if let Some(dictionary) = &self.dictionary {
                    for value in sample.iter_mut() {
                        *value = dictionary.nearest(*value).unwrap_or(*value);
                    }
                }
            }
            for (slot, value) in output.row_mut(step).iter_mut().zip(sample.iter()) {
                *slot = *value;
            }
            perf::add_count(Metric::ComposedSteps, 1);

            if step + 1 == duration {
                break;
            }
            let (prediction, carried) = self
                .model
                .forward_sequence(self.tensor(sample, 1, channels), Some(state));
            next = prediction;
            state = carried;
        }
        Ok(output)
    }

    fn tensor(&self, values: Vec<f64>, steps: usize, channels: usize) -> Tensor<B, 3> {
        Tensor::from_data(TensorData::new(values, [1, steps, channels]), &self.device)
    }
}

/// Pick a random non-empty example of `corpus` as a seed.
///
/// The example is stripped of padding and, when `seed_length` is given,
/// truncated to its first `seed_length` steps.
pub fn seed_from_corpus<R: Rng + ?Sized>(
    corpus: &Corpus,
    rng: &mut R,
    seed_length: Option<usize>,
) -> Result<SampleMatrix> {
    let candidates: Vec<usize> = corpus
        .lengths()
        .iter()
        .enumerate()
        .filter(|(_, len)| **len > 0)
        .map(|(idx, _)| idx)
        .collect();
    let index = *candidates
        .choose(rng)
        .ok_or_else(|| Error::config("the corpus has no non-empty example to seed from"))?;
    let example = corpus
        .example(index)
        .ok_or_else(|| Error::config(format!("corpus example {index} is missing")))?;
    tracing::info!("Seeding with corpus example {index}");
    Ok(truncate_seed(example, seed_length))
}

/// Keep at most the first `seed_length` steps of `seed`.
pub fn truncate_seed(seed: SampleMatrix, seed_length: Option<usize>) -> SampleMatrix {
    match seed_length {
        Some(limit) if limit < seed.nrows() => seed.slice(s![..limit, ..]).to_owned(),
        _ => seed,
    }
}
