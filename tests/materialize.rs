mod common;

use common::{tone, write_float_wav, write_garbage, write_pcm16, write_tone};
use ndarray::s;
use nnmusic::audio::batch::DirectoryBatches;
use nnmusic::audio::read;
use nnmusic::{materialize, AudioSpec, Corpus, Error};

#[test]
fn mixed_rates_keep_only_matching_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = write_tone(&dir.path().join("a.wav"), 3000, 2, 44100);
    write_tone(&dir.path().join("b.wav"), 2000, 2, 22050);
    let c = write_tone(&dir.path().join("c.wav"), 2500, 2, 44100);
    let dest = dir.path().join("corpus.safetensors");

    let report = materialize(dir.path(), &dest, AudioSpec::default()).expect("materialize");
    assert_eq!(report.shape, (2, 3000, 2));
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].path.ends_with("b.wav"));
    assert!(matches!(
        report.skipped[0].error,
        Error::RateMismatch {
            found: 22050,
            expected: 44100,
            ..
        }
    ));

    let corpus = Corpus::open(&dest).expect("open corpus");
    assert_eq!(corpus.shape(), (2, 3000, 2));
    assert_eq!(corpus.lengths(), &[3000, 2500]);
    assert_eq!(corpus.sample_rate(), Some(44100));
    assert_eq!(corpus.sources(), &["a.wav".to_string(), "c.wav".to_string()]);
    assert_eq!(corpus.data().slice(s![0, .., ..]), a);
    assert_eq!(corpus.data().slice(s![1, ..2500, ..]), c);
    assert!(corpus.data().slice(s![1, 2500.., ..]).iter().all(|&v| v == 0.0));
}

#[test]
fn materializing_twice_is_deterministic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("songs");
    std::fs::create_dir(&source).unwrap();
    write_float_wav(&source.join("x.wav"), &tone(400, 2, 0.3), 44100);
    write_float_wav(&source.join("y.wav"), &tone(250, 2, 1.1), 44100);
    write_garbage(&source.join("z.wav"));

    let first = dir.path().join("first.safetensors");
    let second = dir.path().join("second.safetensors");
    materialize(&source, &first, AudioSpec::default()).unwrap();
    materialize(&source, &second, AudioSpec::default()).unwrap();

    let first = Corpus::open(&first).unwrap();
    let second = Corpus::open(&second).unwrap();
    assert_eq!(first.shape(), second.shape());
    assert_eq!(first.data(), second.data());
}

#[test]
fn directory_without_usable_files_is_a_configuration_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("empty");
    std::fs::create_dir(&source).unwrap();
    write_garbage(&source.join("broken.wav"));
    write_pcm16(&source.join("mono.wav"), 100, 1, 44100);
    let dest = dir.path().join("corpus.safetensors");

    let err = materialize(&source, &dest, AudioSpec::default()).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(!dest.exists());
}

#[test]
fn missing_source_and_unwritable_destination_fail_fast() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = materialize(
        dir.path().join("missing"),
        dir.path().join("out.safetensors"),
        AudioSpec::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    write_tone(&dir.path().join("a.wav"), 10, 2, 44100);
    let err = materialize(
        dir.path(),
        dir.path().join("no/such/parent/out.safetensors"),
        AudioSpec::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[test]
fn batches_contain_exactly_the_files_that_read_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = AudioSpec::default();
    write_tone(&dir.path().join("01.wav"), 120, 2, 44100);
    write_garbage(&dir.path().join("02.wav"));
    write_tone(&dir.path().join("03.wav"), 80, 2, 44100);
    write_tone(&dir.path().join("04.wav"), 90, 2, 48000);
    write_pcm16(&dir.path().join("05.wav"), 60, 2, 44100);
    write_pcm16(&dir.path().join("06.wav"), 60, 1, 44100);
    write_tone(&dir.path().join("07.wav"), 33, 2, 44100);

    let readable = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|entry| read(entry.as_ref().unwrap().path(), spec).is_ok())
        .count();

    let mut batches = DirectoryBatches::open(dir.path(), 3, spec).unwrap();
    let mut members = 0;
    for batch in batches.by_ref() {
        assert!(batch.len() <= 3);
        let max = *batch.lengths.iter().max().unwrap();
        for (member, &length) in batch.members.iter().zip(&batch.lengths) {
            assert_eq!(member.nrows(), max);
            assert_eq!(member.ncols(), 2);
            assert!(member.slice(s![length.., ..]).iter().all(|&v| v == 0.0));
        }
        assert!(batch
            .paths
            .iter()
            .all(|p| !p.ends_with("02.wav") && !p.ends_with("04.wav") && !p.ends_with("06.wav")));
        members += batch.len();
    }
    assert_eq!(members, readable);
    assert_eq!(members, 4);
    assert_eq!(batches.skipped().len(), 3);
}

#[test]
fn snapshot_ignores_later_changes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = AudioSpec::default();
    write_tone(&dir.path().join("a.wav"), 20, 2, 44100);
    write_tone(&dir.path().join("b.wav"), 20, 2, 44100);

    let mut batches = DirectoryBatches::open(dir.path(), 1, spec).unwrap();
    std::fs::remove_file(dir.path().join("b.wav")).unwrap();
    write_tone(&dir.path().join("c.wav"), 20, 2, 44100);

    let paths: Vec<_> = batches.by_ref().flat_map(|batch| batch.paths).collect();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].ends_with("a.wav"));
    assert!(matches!(batches.skipped()[0].error, Error::NotFound { .. }));
}

#[test]
fn prefetched_batches_match_direct_iteration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = AudioSpec::default();
    for (idx, frames) in [30, 10, 25, 5, 40].iter().enumerate() {
        write_tone(&dir.path().join(format!("{idx}.wav")), *frames, 2, 44100);
    }
    write_garbage(&dir.path().join("9.wav"));

    let direct: Vec<_> = DirectoryBatches::open(dir.path(), 2, spec).unwrap().collect();
    let mut prefetched = DirectoryBatches::open(dir.path(), 2, spec)
        .unwrap()
        .prefetch(1);
    let queued: Vec<_> = prefetched.by_ref().collect();
    assert_eq!(queued, direct);
    assert_eq!(prefetched.finish().unwrap().len(), 1);
}
