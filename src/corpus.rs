//! Fixed-shape training corpora persisted as safetensors files.
//!
//! A corpus holds one `amplitudes` tensor of shape `(example, time, channel)`
//! in `F64`, plus an `I64` `lengths` tensor with the pre-padding length of
//! each example. String metadata records the sample rate, the channel count,
//! and the source file names.
//!
//! [`materialize`] builds a corpus from a directory in two passes: the first
//! pass decides which files are usable and how long the longest one is, the
//! second fills a pre-allocated zero array row by row.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{s, Array3, ArrayView2, Axis};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use crate::audio::batch::{list_audio_files, read_or_skip, SkippedFile};
use crate::audio::io::SampleMatrix;
use crate::config::AudioSpec;
use crate::perf::{self, Metric};
use crate::{Error, Result};

/// Name of the amplitude tensor inside the container.
pub const AMPLITUDES: &str = "amplitudes";
/// Name of the per-example length tensor inside the container.
pub const LENGTHS: &str = "lengths";

const FORMAT_KEY: &str = "format";
const FORMAT_VALUE: &str = "nnmusic-corpus-v1";
const SAMPLE_RATE_KEY: &str = "sample_rate";
const CHANNELS_KEY: &str = "channels";
const SOURCES_KEY: &str = "sources";

/// In-memory view of a corpus container.
#[derive(Debug, Clone, PartialEq)]
pub struct Corpus {
    data: Array3<f64>,
    lengths: Vec<usize>,
    sample_rate: Option<u32>,
    sources: Vec<String>,
}

impl Corpus {
    /// Wrap an array whose rows have the given pre-padding lengths.
    pub fn new(data: Array3<f64>, lengths: Vec<usize>) -> Result<Self> {
        let (examples, steps, _) = data.dim();
        if lengths.len() != examples {
            return Err(Error::config(format!(
                "{} lengths for {examples} examples",
                lengths.len()
            )));
        }
        if let Some(&too_long) = lengths.iter().find(|&&len| len > steps) {
            return Err(Error::config(format!(
                "example length {too_long} exceeds corpus length {steps}"
            )));
        }
        Ok(Self {
            data,
            lengths,
            sample_rate: None,
            sources: Vec::new(),
        })
    }

    /// Wrap an array, inferring each row's length from its trailing zeros.
    pub fn from_array(data: Array3<f64>) -> Self {
        let lengths = data.outer_iter().map(|row| trimmed_length(row)).collect();
        Self {
            data,
            lengths,
            sample_rate: None,
            sources: Vec::new(),
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    /// `(examples, time steps, channels)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// Example `index` without its padding.
    pub fn example(&self, index: usize) -> Option<SampleMatrix> {
        let length = *self.lengths.get(index)?;
        Some(self.data.slice(s![index, ..length, ..]).to_owned())
    }

    /// Iterate over the unpadded amplitudes of every example.
    pub fn valid_amplitudes(&self) -> impl Iterator<Item = f64> + '_ {
        self.data
            .outer_iter()
            .zip(self.lengths.iter())
            .flat_map(|(row, &len)| row.slice_move(s![..len, ..]).into_iter().copied())
    }

    /// Split off the last `held_out` examples.
    pub fn split_tail(&self, held_out: usize) -> (Corpus, Option<Corpus>) {
        let examples = self.lengths.len();
        if held_out == 0 || held_out >= examples {
            return (self.clone(), None);
        }
        let cut = examples - held_out;
        let part = |range: std::ops::Range<usize>| Corpus {
            data: self.data.slice(s![range.clone(), .., ..]).to_owned(),
            lengths: self.lengths[range.clone()].to_vec(),
            sample_rate: self.sample_rate,
            sources: self.sources.get(range).map(<[String]>::to_vec).unwrap_or_default(),
        };
        (part(0..cut), Some(part(cut..examples)))
    }

    /// Load a corpus container.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Reading corpus {}", path.display());
        let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
        let tensors = SafeTensors::deserialize(&bytes).map_err(|e| Error::corpus(path, e))?;
        let (_, header) = SafeTensors::read_metadata(&bytes).map_err(|e| Error::corpus(path, e))?;
        let metadata = header.metadata().clone().unwrap_or_default();

        let amplitudes = tensors
            .tensor(AMPLITUDES)
            .map_err(|e| Error::corpus(path, e))?;
        if amplitudes.dtype() != Dtype::F64 || amplitudes.shape().len() != 3 {
            return Err(Error::corpus(
                path,
                format!(
                    "`{AMPLITUDES}` must be a 3D F64 tensor, found {:?} {:?}",
                    amplitudes.dtype(),
                    amplitudes.shape()
                ),
            ));
        }
        let shape = (
            amplitudes.shape()[0],
            amplitudes.shape()[1],
            amplitudes.shape()[2],
        );
        let values = amplitudes
            .data()
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();
        let data = Array3::from_shape_vec(shape, values).map_err(|e| Error::corpus(path, e))?;

        let mut corpus = match tensors.tensor(LENGTHS) {
            Ok(view) => {
                let lengths = decode_lengths(path, &view)?;
                Corpus::new(data, lengths).map_err(|e| Error::corpus(path, e))?
            }
            Err(_) => Corpus::from_array(data),
        };

        if let Some(channels) = metadata.get(CHANNELS_KEY) {
            if channels.parse::<usize>().ok() != Some(shape.2) {
                return Err(Error::corpus(
                    path,
                    format!("metadata declares {channels} channels, tensor has {}", shape.2),
                ));
            }
        }
        corpus.sample_rate = metadata
            .get(SAMPLE_RATE_KEY)
            .and_then(|rate| rate.parse().ok());
        if let Some(sources) = metadata.get(SOURCES_KEY) {
            corpus.sources = serde_json::from_str(sources).map_err(|e| Error::corpus(path, e))?;
        }
        Ok(corpus)
    }

    /// Persist the corpus. The file appears under `path` only once complete.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let staging = staging_path(path);
        let bytes = self.to_bytes().map_err(|e| Error::corpus(path, e))?;
        fs::write(&staging, bytes).map_err(|e| Error::io(&staging, e))?;
        fs::rename(&staging, path).map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    fn to_bytes(&self) -> std::result::Result<Vec<u8>, safetensors::SafeTensorError> {
        let (examples, steps, channels) = self.shape();
        let amplitude_bytes: Vec<u8> = self
            .data
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect();
        let length_bytes: Vec<u8> = self
            .lengths
            .iter()
            .flat_map(|&len| (len as i64).to_le_bytes())
            .collect();

        let mut tensors = HashMap::new();
        tensors.insert(
            AMPLITUDES.to_string(),
            TensorView::new(
                Dtype::F64,
                vec![examples, steps, channels],
                &amplitude_bytes,
            )?,
        );
        tensors.insert(
            LENGTHS.to_string(),
            TensorView::new(Dtype::I64, vec![examples], &length_bytes)?,
        );

        let mut metadata = HashMap::new();
        metadata.insert(FORMAT_KEY.to_string(), FORMAT_VALUE.to_string());
        metadata.insert(CHANNELS_KEY.to_string(), channels.to_string());
        if let Some(rate) = self.sample_rate {
            metadata.insert(SAMPLE_RATE_KEY.to_string(), rate.to_string());
        }
        if !self.sources.is_empty() {
            let sources = serde_json::to_string(&self.sources).unwrap_or_default();
            metadata.insert(SOURCES_KEY.to_string(), sources);
        }

        safetensors::serialize(&tensors, &Some(metadata))
    }
}

/// Outcome of a [`materialize`] run.
#[derive(Debug)]
pub struct MaterializeReport {
    /// `(examples, time steps, channels)` of the written corpus.
    pub shape: (usize, usize, usize),
    /// Source file of each row, in row order.
    pub sources: Vec<PathBuf>,
    /// Files left out, with the reason.
    pub skipped: Vec<SkippedFile>,
}

/// Convert every usable audio file in `source_dir` into a corpus at `dest`.
///
/// # Errors
///
/// Fails if `source_dir` does not exist, if `dest` cannot be created, or if
/// no file passes validation. Problems with individual files are logged and
/// reported in [`MaterializeReport::skipped`].
pub fn materialize(
    source_dir: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    spec: AudioSpec,
) -> Result<MaterializeReport> {
    let source_dir = source_dir.as_ref();
    let dest = dest.as_ref();
    tracing::info!(
        "Materializing {} into {}",
        source_dir.display(),
        dest.display()
    );

    let files = list_audio_files(source_dir)?;

    // Fail on an unwritable destination before decoding anything.
    let staging = staging_path(dest);
    fs::File::create(&staging).map_err(|e| {
        Error::config(format!("cannot create {}: {e}", dest.display()))
    })?;

    let result = fill_corpus(&files, spec).and_then(|(corpus, sources, skipped)| {
        let bytes = corpus.to_bytes().map_err(|e| Error::corpus(dest, e))?;
        fs::write(&staging, bytes).map_err(|e| Error::io(&staging, e))?;
        fs::rename(&staging, dest).map_err(|e| Error::io(dest, e))?;
        Ok(MaterializeReport {
            shape: corpus.shape(),
            sources,
            skipped,
        })
    });
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    let report = result?;

    tracing::info!(
        "Wrote corpus of shape {:?} ({} files skipped)",
        report.shape,
        report.skipped.len()
    );
    Ok(report)
}

fn fill_corpus(
    files: &[PathBuf],
    spec: AudioSpec,
) -> Result<(Corpus, Vec<PathBuf>, Vec<SkippedFile>)> {
    let mut skipped = Vec::new();

    let mut usable: Vec<(PathBuf, usize)> = Vec::new();
    {
        let _span = perf::span(Metric::CorpusScan);
        for path in files {
            match read_or_skip(path, spec) {
                Ok(matrix) => usable.push((path.clone(), matrix.nrows())),
                Err(skip) => skipped.push(skip),
            }
        }
    }

    if usable.is_empty() {
        return Err(Error::config(format!(
            "no usable audio files ({} skipped)",
            skipped.len()
        )));
    }
    let max_length = usable.iter().map(|(_, len)| *len).max().unwrap_or(0);
    if max_length == 0 {
        return Err(Error::config("every usable audio file is empty"));
    }

    let _span = perf::span(Metric::CorpusFill);
    let mut data = Array3::zeros((usable.len(), max_length, spec.channels));
    let mut kept = Vec::with_capacity(usable.len());
    for (index, (path, length)) in usable.iter().enumerate() {
        let matrix = match read_or_skip(path, spec) {
            Ok(matrix) => matrix,
            Err(skip) => {
                skipped.push(skip);
                continue;
            }
        };
        if matrix.nrows() != *length {
            tracing::warn!(
                "Skipping {}: length changed from {length} to {} between passes",
                path.display(),
                matrix.nrows()
            );
            perf::add_count(Metric::FilesSkipped, 1);
            skipped.push(SkippedFile {
                path: path.clone(),
                error: Error::InvalidFormat {
                    path: path.clone(),
                    reason: "file changed while materializing".to_string(),
                },
            });
            continue;
        }
        data.slice_mut(s![index, ..*length, ..]).assign(&matrix);
        kept.push(index);
    }

    if kept.is_empty() {
        return Err(Error::config("every usable audio file disappeared during materialization"));
    }
    if kept.len() < usable.len() {
        data = data.select(Axis(0), &kept);
    }

    let sources: Vec<PathBuf> = kept.iter().map(|&i| usable[i].0.clone()).collect();
    let lengths = kept.iter().map(|&i| usable[i].1).collect();
    let names = sources
        .iter()
        .map(|p| {
            p.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .collect();
    let corpus = Corpus::new(data, lengths)?
        .with_sample_rate(spec.sample_rate)
        .with_sources(names);
    Ok((corpus, sources, skipped))
}

fn decode_lengths(path: &Path, view: &TensorView<'_>) -> Result<Vec<usize>> {
    if view.dtype() != Dtype::I64 || view.shape().len() != 1 {
        return Err(Error::corpus(
            path,
            format!("`{LENGTHS}` must be a 1D I64 tensor"),
        ));
    }
    view.data()
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            usize::try_from(i64::from_le_bytes(raw))
                .map_err(|_| Error::corpus(path, "negative example length"))
        })
        .collect()
}

/// Number of leading time steps before the trailing all-zero run.
fn trimmed_length(row: ArrayView2<'_, f64>) -> usize {
    row.outer_iter()
        .rposition(|step| step.iter().any(|&v| v != 0.0))
        .map_or(0, |last| last + 1)
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
