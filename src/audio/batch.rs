//! Lazy, consume-once batching of a directory of audio files.
//!
//! [`DirectoryBatches::open`] snapshots the directory listing once. Files are
//! then read group by group as the iterator is advanced, so at most one batch
//! is held in memory. Files that fail ingestion are dropped from their batch
//! with a warning; they never abort the scan. Iterating again requires a new
//! `open`, which takes a fresh snapshot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::JoinHandle;

use ndarray::{s, Array3};

use super::io::{self, pad_to_length, SampleMatrix};
use crate::config::AudioSpec;
use crate::perf::{self, Metric};
use crate::{Error, Result};

/// A file that was left out of a batch or corpus, and why.
#[derive(Debug)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub error: Error,
}

/// Equal-length sample matrices read from one group of the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Members zero-padded to [`Batch::max_length`].
    pub members: Vec<SampleMatrix>,
    /// Length of each member before padding.
    pub lengths: Vec<usize>,
    /// Source file of each member.
    pub paths: Vec<PathBuf>,
}

impl Batch {
    /// Pad `members` to their common maximum length.
    ///
    /// Returns `None` when `members` is empty.
    pub fn from_members(members: Vec<(PathBuf, SampleMatrix)>) -> Option<Self> {
        let max_length = members.iter().map(|(_, m)| m.nrows()).max()?;
        let mut batch = Batch {
            members: Vec::with_capacity(members.len()),
            lengths: Vec::with_capacity(members.len()),
            paths: Vec::with_capacity(members.len()),
        };
        for (path, matrix) in members {
            batch.lengths.push(matrix.nrows());
            batch.members.push(pad_to_length(&matrix, max_length));
            batch.paths.push(path);
        }
        Some(batch)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Common time length of every member.
    pub fn max_length(&self) -> usize {
        self.members.first().map_or(0, |m| m.nrows())
    }

    pub fn channels(&self) -> usize {
        self.members.first().map_or(0, |m| m.ncols())
    }

    /// Stack members into a `(member, time, channel)` array.
    pub fn to_array(&self) -> Array3<f64> {
        let mut stacked = Array3::zeros((self.len(), self.max_length(), self.channels()));
        for (idx, member) in self.members.iter().enumerate() {
            stacked.slice_mut(s![idx, .., ..]).assign(member);
        }
        stacked
    }
}

/// Snapshot the regular files of `dir`, sorted by file name.
///
/// # Errors
///
/// [`Error::NotFound`] if `dir` does not exist, [`Error::Configuration`] if it
/// is not a directory.
pub fn list_audio_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Err(Error::NotFound {
            path: dir.to_path_buf(),
        });
    }
    if !dir.is_dir() {
        return Err(Error::config(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Read one file, turning any ingestion failure into a logged skip record.
pub fn read_or_skip(path: &Path, spec: AudioSpec) -> std::result::Result<SampleMatrix, SkippedFile> {
    io::read(path, spec).map_err(|error| {
        tracing::warn!("Skipping {}: {error}", path.display());
        perf::add_count(Metric::FilesSkipped, 1);
        SkippedFile {
            path: path.to_path_buf(),
            error,
        }
    })
}

/// Iterator over the batches of one directory snapshot.
#[derive(Debug)]
pub struct DirectoryBatches {
    spec: AudioSpec,
    groups: std::vec::IntoIter<Vec<PathBuf>>,
    skipped: Vec<SkippedFile>,
}

impl DirectoryBatches {
    /// Snapshot `dir` and partition it into groups of `batch_size` files.
    pub fn open(dir: impl AsRef<Path>, batch_size: usize, spec: AudioSpec) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("batch size must be at least 1"));
        }
        let files = list_audio_files(dir)?;
        let groups: Vec<Vec<PathBuf>> = files
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        Ok(Self {
            spec,
            groups: groups.into_iter(),
            skipped: Vec::new(),
        })
    }

    /// Files skipped so far, in the order they were encountered.
    pub fn skipped(&self) -> &[SkippedFile] {
        &self.skipped
    }

    pub fn into_skipped(self) -> Vec<SkippedFile> {
        self.skipped
    }

    /// Groups of the snapshot not yet read.
    pub fn remaining_groups(&self) -> usize {
        self.groups.len()
    }

    /// Move batch assembly onto a worker thread, keeping up to `depth`
    /// finished batches queued ahead of the consumer.
    pub fn prefetch(self, depth: usize) -> PrefetchedBatches {
        PrefetchedBatches::spawn(depth, move |tx| {
            let mut batches = self;
            for batch in batches.by_ref() {
                if tx.send(batch).is_err() {
                    break;
                }
            }
            batches.into_skipped()
        })
    }

    fn load_group(&mut self, group: Vec<PathBuf>) -> Option<Batch> {
        let mut members = Vec::with_capacity(group.len());
        for path in group {
            match read_or_skip(&path, self.spec) {
                Ok(matrix) => members.push((path, matrix)),
                Err(skip) => self.skipped.push(skip),
            }
        }
        Batch::from_members(members)
    }
}

impl Iterator for DirectoryBatches {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        loop {
            let group = self.groups.next()?;
            if let Some(batch) = self.load_group(group) {
                return Some(batch);
            }
        }
    }
}

/// Batches assembled on a background thread; ends when the scan is exhausted.
pub struct PrefetchedBatches {
    receiver: Receiver<Batch>,
    worker: JoinHandle<Vec<SkippedFile>>,
}

impl Iterator for PrefetchedBatches {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        self.receiver.recv().ok()
    }
}

impl PrefetchedBatches {
    fn spawn<F>(depth: usize, produce: F) -> Self
    where
        F: FnOnce(SyncSender<Batch>) -> Vec<SkippedFile> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(depth);
        PrefetchedBatches {
            receiver: rx,
            worker: std::thread::spawn(move || produce(tx)),
        }
    }

    /// Stop the worker and collect the files it skipped.
    ///
    /// # Errors
    ///
    /// [`Error::Worker`] if the worker panicked. The batches received before
    /// the panic are then an incomplete view of the directory.
    pub fn finish(self) -> Result<Vec<SkippedFile>> {
        let PrefetchedBatches { receiver, worker } = self;
        drop(receiver);
        worker.join().map_err(|payload| {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Error::Worker(format!("batch prefetch thread panicked: {reason}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn members_are_padded_to_group_max() {
        let batch = Batch::from_members(vec![
            (PathBuf::from("a"), array![[1.0, 1.0]]),
            (PathBuf::from("b"), array![[2.0, 2.0], [3.0, 3.0], [4.0, 4.0]]),
        ])
        .unwrap();
        assert_eq!(batch.lengths, vec![1, 3]);
        assert_eq!(batch.max_length(), 3);
        assert_eq!(batch.members[0], array![[1.0, 1.0], [0.0, 0.0], [0.0, 0.0]]);
        assert_eq!(batch.to_array().dim(), (2, 3, 2));
    }

    #[test]
    fn empty_member_list_yields_no_batch() {
        assert!(Batch::from_members(Vec::new()).is_none());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirectoryBatches::open(dir.path(), 0, AudioSpec::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn missing_directory_is_not_found() {
        let err = DirectoryBatches::open("no/such/dir", 2, AudioSpec::default()).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn listing_skips_subdirectories_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.wav"), b"").unwrap();
        fs::write(dir.path().join("a.wav"), b"").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        let files = list_audio_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.wav", "b.wav"]);
    }

    #[test]
    fn worker_panic_is_reported_by_finish() {
        let mut batches = PrefetchedBatches::spawn(1, |tx| {
            let batch = Batch::from_members(vec![(PathBuf::from("a"), array![[0.5]])]).unwrap();
            tx.send(batch).unwrap();
            panic!("decoder blew up");
        });
        assert_eq!(batches.by_ref().count(), 1);
        match batches.finish() {
            Err(Error::Worker(reason)) => assert!(reason.contains("decoder blew up")),
            other => panic!("expected a worker error, got {other:?}"),
        }
    }
}
