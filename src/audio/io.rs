//! Reading and writing audio files as time-major sample matrices.
//!
//! WAV files are decoded with `hound`; every other container, and WAV
//! variants hound does not support, goes through symphonia's probe. Both
//! decoders hand back interleaved frames, which map directly onto a
//! row-major `(time, channel)` matrix.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};
use ndarray::{s, Array2};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::config::AudioSpec;
use crate::perf::{self, Metric};
use crate::{Error, Result};

/// Amplitudes with axes `(time step, channel)`.
pub type SampleMatrix = Array2<f64>;

/// Sample layout of a written WAV file.
///
/// Integer PCM written from amplitudes that were read from integer PCM of
/// the same width reproduces the original samples exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    #[default]
    Float32,
    Int16,
    Int24,
    Int32,
}

impl SampleEncoding {
    fn wav_spec(self, channels: u16, sample_rate: u32) -> WavSpec {
        let (bits_per_sample, sample_format) = match self {
            SampleEncoding::Float32 => (32, SampleFormat::Float),
            SampleEncoding::Int16 => (16, SampleFormat::Int),
            SampleEncoding::Int24 => (24, SampleFormat::Int),
            SampleEncoding::Int32 => (32, SampleFormat::Int),
        };
        WavSpec {
            channels,
            sample_rate,
            bits_per_sample,
            sample_format,
        }
    }

    fn from_wav_spec(spec: WavSpec) -> Option<Self> {
        match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Float, 32) => Some(SampleEncoding::Float32),
            (SampleFormat::Int, 16) => Some(SampleEncoding::Int16),
            (SampleFormat::Int, 24) => Some(SampleEncoding::Int24),
            (SampleFormat::Int, 32) => Some(SampleEncoding::Int32),
            _ => None,
        }
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SampleEncoding::Float32 => "float32",
            SampleEncoding::Int16 => "int16",
            SampleEncoding::Int24 => "int24",
            SampleEncoding::Int32 => "int32",
        })
    }
}

impl FromStr for SampleEncoding {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float32" => Ok(SampleEncoding::Float32),
            "int16" => Ok(SampleEncoding::Int16),
            "int24" => Ok(SampleEncoding::Int24),
            "int32" => Ok(SampleEncoding::Int32),
            other => Err(format!(
                "unknown sample encoding {other:?} (expected float32, int16, int24 or int32)"
            )),
        }
    }
}

/// Interleaved frames straight out of a decoder.
struct Decoded {
    samples: Vec<f64>,
    sample_rate: u32,
    channels: usize,
}

/// Read an audio file and validate it against `spec`.
///
/// # Errors
///
/// - [`Error::NotFound`] if `path` does not exist.
/// - [`Error::InvalidFormat`] if the file cannot be decoded.
/// - [`Error::RateMismatch`] / [`Error::ChannelMismatch`] if the decoded
///   stream does not match `spec`.
pub fn read(path: impl AsRef<Path>, spec: AudioSpec) -> Result<SampleMatrix> {
    let path = path.as_ref();
    tracing::info!("Reading audio file {}", path.display());
    let _span = perf::span(Metric::AudioRead);

    if !path.exists() {
        return Err(Error::NotFound {
            path: path.to_path_buf(),
        });
    }

    let decoded = if is_wav(path) {
        match decode_wav(path) {
            Err(hound::Error::Unsupported) => {
                tracing::debug!("hound cannot decode {}; probing", path.display());
                decode_with_probe(path)?
            }
            other => other.map_err(|e| wav_error(path, e))?,
        }
    } else {
        decode_with_probe(path)?
    };

    if decoded.sample_rate != spec.sample_rate {
        return Err(Error::RateMismatch {
            path: path.to_path_buf(),
            found: decoded.sample_rate,
            expected: spec.sample_rate,
        });
    }
    if decoded.channels != spec.channels {
        return Err(Error::ChannelMismatch {
            path: path.to_path_buf(),
            found: decoded.channels,
            expected: spec.channels,
        });
    }

    let matrix = into_matrix(path, decoded)?;
    perf::add_count(Metric::FilesRead, 1);
    perf::add_count(Metric::SamplesRead, matrix.len() as u64);
    Ok(matrix)
}

/// Write a sample matrix as a 32-bit float WAV file.
///
/// Amplitudes are narrowed from `f64` to `f32`, so a later [`read`] returns
/// the nearest `f32` values. Use [`write_with`] to keep integer PCM exact.
pub fn write(path: impl AsRef<Path>, matrix: &SampleMatrix, sample_rate: u32) -> Result<()> {
    write_with(path, matrix, sample_rate, SampleEncoding::Float32)
}

/// Write a sample matrix as a WAV file with the given sample layout.
///
/// Integer encodings scale by `2^(bits - 1)` like [`read`] does, round to the
/// nearest step and clip to the representable range.
pub fn write_with(
    path: impl AsRef<Path>,
    matrix: &SampleMatrix,
    sample_rate: u32,
    encoding: SampleEncoding,
) -> Result<()> {
    let path = path.as_ref();
    let _span = perf::span(Metric::AudioWrite);
    let channels = u16::try_from(matrix.ncols())
        .ok()
        .filter(|&c| c > 0)
        .ok_or_else(|| {
            Error::config(format!(
                "cannot write {} channels to {}",
                matrix.ncols(),
                path.display()
            ))
        })?;

    let spec = encoding.wav_spec(channels, sample_rate);
    let mut writer = WavWriter::create(path, spec).map_err(|e| wav_error(path, e))?;
    // Logical iteration order of a (time, channel) matrix is interleaved order.
    match spec.sample_format {
        SampleFormat::Float => {
            for &value in matrix.iter() {
                writer
                    .write_sample(value as f32)
                    .map_err(|e| wav_error(path, e))?;
            }
        }
        SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f64;
            let (min, max) = (-scale, scale - 1.0);
            for &value in matrix.iter() {
                let step = (value * scale).round().clamp(min, max) as i32;
                writer.write_sample(step).map_err(|e| wav_error(path, e))?;
            }
        }
    }
    writer.finalize().map_err(|e| wav_error(path, e))?;
    Ok(())
}

/// Sample layout of a WAV file, when [`write_with`] can reproduce it.
pub fn wav_encoding(path: impl AsRef<Path>) -> Result<Option<SampleEncoding>> {
    let path = path.as_ref();
    let reader = WavReader::open(path).map_err(|e| wav_error(path, e))?;
    Ok(SampleEncoding::from_wav_spec(reader.spec()))
}

/// Zero-pad `matrix` at the tail of the time axis to `length` steps.
///
/// Matrices already at least `length` long are returned unchanged.
pub fn pad_to_length(matrix: &SampleMatrix, length: usize) -> SampleMatrix {
    let (frames, channels) = matrix.dim();
    if frames >= length {
        return matrix.clone();
    }
    let mut padded = Array2::zeros((length, channels));
    padded.slice_mut(s![..frames, ..]).assign(matrix);
    padded
}

/// Peak-normalize amplitudes to [-1, 1].
pub fn peak_normalize(matrix: &mut SampleMatrix) {
    let max_abs = matrix.iter().map(|s| s.abs()).fold(0.0f64, f64::max);
    if max_abs > 1e-8 {
        let scale = 1.0 / max_abs;
        matrix.mapv_inplace(|s| s * scale);
    }
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav") || ext.eq_ignore_ascii_case("wave"))
}

fn decode_wav(path: &Path) -> std::result::Result<Decoded, hound::Error> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();

    let samples = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .map(|s| s.map(f64::from))
            .collect::<std::result::Result<Vec<_>, _>>(),
        SampleFormat::Int => {
            let max = (1_i64 << (spec.bits_per_sample - 1)) as f64;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| f64::from(v) / max))
                .collect::<std::result::Result<Vec<_>, _>>()
        }
    }?;

    Ok(Decoded {
        samples,
        sample_rate: spec.sample_rate,
        channels: usize::from(spec.channels),
    })
}

fn decode_with_probe(path: &Path) -> Result<Decoded> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| invalid(path, e))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| invalid(path, "no decodable audio track"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| invalid(path, e))?;

    let mut sample_rate = codec_params.sample_rate;
    let mut channels = codec_params.channels.map(|c| c.count());
    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(e) => return Err(invalid(path, e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet).map_err(|e| invalid(path, e))?;
        let spec = *decoded.spec();
        sample_rate.get_or_insert(spec.rate);
        channels.get_or_insert(spec.channels.count());

        let mut buffer = SampleBuffer::<f64>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    Ok(Decoded {
        samples,
        sample_rate: sample_rate.ok_or_else(|| invalid(path, "unknown sample rate"))?,
        channels: channels.ok_or_else(|| invalid(path, "unknown channel layout"))?,
    })
}

fn into_matrix(path: &Path, decoded: Decoded) -> Result<SampleMatrix> {
    let Decoded {
        samples, channels, ..
    } = decoded;
    if channels == 0 || samples.len() % channels != 0 {
        return Err(invalid(path, "truncated frame"));
    }
    if samples.iter().any(|s| !s.is_finite()) {
        return Err(invalid(path, "non-finite sample"));
    }
    let frames = samples.len() / channels;
    Array2::from_shape_vec((frames, channels), samples).map_err(|e| invalid(path, e))
}

fn invalid(path: &Path, reason: impl ToString) -> Error {
    Error::InvalidFormat {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn wav_error(path: &Path, error: hound::Error) -> Error {
    match error {
        hound::Error::IoError(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Error::io(path, e)
        }
        other => invalid(path, other),
    }
}
