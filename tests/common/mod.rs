//! Shared test utilities for writing audio fixtures.

#![allow(dead_code)]

use hound::{SampleFormat, WavSpec, WavWriter};
use ndarray::Array2;
use std::path::Path;

/// Write a float WAV of `frames` x `channels` with a deterministic waveform.
pub fn write_tone(path: &Path, frames: usize, channels: usize, sample_rate: u32) -> Array2<f64> {
    let matrix = tone(frames, channels, 0.0);
    write_float_wav(path, &matrix, sample_rate);
    matrix
}

/// Deterministic `(frames, channels)` waveform, shifted by `phase`.
pub fn tone(frames: usize, channels: usize, phase: f64) -> Array2<f64> {
    Array2::from_shape_fn((frames, channels), |(t, c)| {
        // Round through f32 so the values survive a float WAV round trip.
        let value = 0.5 * ((t as f64) * 0.05 + (c as f64) * 0.7 + phase).sin();
        f64::from(value as f32)
    })
}

/// Write `matrix` as a 32-bit float WAV.
pub fn write_float_wav(path: &Path, matrix: &Array2<f64>, sample_rate: u32) {
    let spec = WavSpec {
        channels: matrix.ncols() as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec).expect("create wav");
    for value in matrix.iter() {
        writer.write_sample(*value as f32).expect("write sample");
    }
    writer.finalize().expect("finalize wav");
}

/// Write a 16-bit PCM WAV of silence.
pub fn write_pcm16(path: &Path, frames: usize, channels: u16, sample_rate: u32) {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).expect("create wav");
    for _ in 0..frames * usize::from(channels) {
        writer.write_sample(0_i16).expect("write sample");
    }
    writer.finalize().expect("finalize wav");
}

/// Write bytes that no decoder accepts.
pub fn write_garbage(path: &Path) {
    std::fs::write(path, b"this is not an audio file").expect("write garbage");
}
