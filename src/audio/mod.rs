//! Audio ingestion and directory batching.
//!
//! [`io`] turns one file into a validated `(time, channel)` matrix; [`batch`]
//! walks a directory snapshot and groups the files that pass validation into
//! zero-padded batches.

pub mod batch;
pub mod io;

pub use batch::{Batch, DirectoryBatches, SkippedFile};
pub use io::{read, write, write_with, SampleEncoding, SampleMatrix};
