//! Sequence model and its on-disk checkpoint format.
//!
//! `lstm` holds the recurrent network trained on raw amplitudes; `checkpoint`
//! persists its parameters together with everything needed to rebuild it.

pub mod checkpoint;
pub mod lstm;

pub use checkpoint::{CheckpointMetadata, FORMAT_VERSION};
pub use lstm::{LstmModel, LstmModelConfig, SequenceModel};
