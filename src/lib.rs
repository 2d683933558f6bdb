//! # nnmusic - compose audio with a recurrent network
//!
//! Trains an LSTM directly on raw waveforms and lets it continue a seed
//! excerpt, one sample at a time.
//!
//! ## Pipeline
//!
//! 1. **Audio ingestion** ([`audio::io`]): decodes a file into a `(time, channel)`
//!    matrix and rejects anything that does not match the expected sample rate
//!    and channel count.
//!
//! 2. **Directory batching** ([`audio::batch`]): snapshots a folder and yields
//!    zero-padded batches of the files that pass ingestion. Bad files are
//!    logged and skipped.
//!
//! 3. **Corpus materialization** ([`corpus`]): packs every usable file of a
//!    folder into one `(example, time, channel)` safetensors container.
//!
//! 4. **Training** ([`train`]): fits the model to predict each sample from the
//!    ones before it and writes a checkpoint directory.
//!
//! 5. **Composition** ([`compose`]): warms the model up on a seed and feeds
//!    its own predictions back to generate new audio.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use burn::backend::Autodiff;
//! use burn_ndarray::{NdArray, NdArrayDevice};
//! use nnmusic::config::{AudioSpec, ModelSettings, TrainingConfig};
//! use nnmusic::corpus::{materialize, Corpus};
//! use nnmusic::train::{EpochBudget, Trainer, TrainingSource};
//! use nnmusic::Composer;
//!
//! let spec = AudioSpec::default();
//! materialize("songs/", "songs.safetensors", spec).unwrap();
//! let corpus = Corpus::open("songs.safetensors").unwrap();
//!
//! let device = NdArrayDevice::default();
//! let mut trainer = Trainer::<Autodiff<NdArray<f64>>>::new(
//!     TrainingConfig::default(),
//!     ModelSettings::default(),
//!     device,
//! )
//! .unwrap()
//! .with_checkpoint_dir("checkpoint");
//! trainer.build(&corpus).unwrap();
//! trainer
//!     .train(TrainingSource::Corpus(&corpus), EpochBudget::Fixed(100), &AtomicBool::new(false))
//!     .unwrap();
//!
//! let composer = Composer::<NdArray<f64>>::load("checkpoint", NdArrayDevice::default()).unwrap();
//! let seed = corpus.example(0).unwrap();
//! let music = composer.compose(&seed, 44100).unwrap();
//! nnmusic::audio::write("out.wav", &music, spec.sample_rate).unwrap();
//! ```

pub mod audio;
pub mod compose;
pub mod config;
pub mod corpus;
pub mod dictionary;
pub mod model;
pub mod perf;
pub mod train;

mod error;

pub use compose::Composer;
pub use config::{load_config, AudioSpec, Config};
pub use corpus::{materialize, Corpus, MaterializeReport};
pub use dictionary::AmplitudeDictionary;
pub use error::{Error, Result};
pub use train::{EpochBudget, Trainer, TrainerPhase, TrainingSource, TrainingSummary};
