#[path = "../common/mod.rs"]
mod common;

use common::{tone, write_float_wav};
use nnmusic::audio::SampleEncoding;
use nnmusic::{AudioSpec, Corpus};
use std::path::Path;
use std::process::{Command, Output};

fn nnmusic() -> Command {
    Command::new(env!("CARGO_BIN_EXE_nnmusic"))
}

fn run(cmd: &mut Command) -> Output {
    let output = cmd.output().expect("run command");
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn cli_materialize_train_inspect_compose() {
    let dir = tempfile::tempdir().expect("tempdir");
    let songs = dir.path().join("songs");
    std::fs::create_dir(&songs).unwrap();
    write_float_wav(&songs.join("a.wav"), &tone(20, 2, 0.0), 8000);
    write_float_wav(&songs.join("b.wav"), &tone(12, 2, 0.5), 8000);

    let corpus = dir.path().join("songs.safetensors");
    let output = run(nnmusic().args([
        "materialize",
        arg(&songs),
        arg(&corpus),
        "--rate",
        "8000",
    ]));
    assert!(String::from_utf8_lossy(&output.stdout).contains("(2, 20, 2)"));
    assert_eq!(Corpus::open(&corpus).unwrap().shape(), (2, 20, 2));

    let checkpoint = dir.path().join("checkpoint");
    let output = run(nnmusic().args([
        "train",
        "--corpus",
        arg(&corpus),
        "--checkpoint",
        arg(&checkpoint),
        "--epochs",
        "2",
        "--hidden",
        "4",
    ]));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Trained 2 epochs (2 total)"));

    let output = run(nnmusic().args(["inspect", arg(&checkpoint)]));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("channels: 2"));
    assert!(stdout.contains("hidden size: 4"));
    assert!(stdout.contains("epochs completed: 2"));
    assert!(stdout.contains("sample rate: 8000"));

    let output = run(nnmusic().args(["inspect", arg(&corpus)]));
    assert!(String::from_utf8_lossy(&output.stdout).contains("a.wav: 20 steps"));

    let music = dir.path().join("music.wav");
    run(nnmusic().args([
        "compose",
        "--checkpoint",
        arg(&checkpoint),
        "--output",
        arg(&music),
        "--seed-corpus",
        arg(&corpus),
        "--seed-length",
        "6",
        "--duration",
        "7",
        "--quantize",
        "--encoding",
        "int16",
    ]));
    assert_eq!(
        nnmusic::audio::io::wav_encoding(&music).unwrap(),
        Some(SampleEncoding::Int16)
    );
    let decoded = nnmusic::audio::read(&music, AudioSpec::new(8000, 2)).unwrap();
    assert_eq!(decoded.dim(), (7, 2));
}

#[test]
fn cli_resume_continues_epoch_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let songs = dir.path().join("songs");
    std::fs::create_dir(&songs).unwrap();
    write_float_wav(&songs.join("a.wav"), &tone(10, 2, 0.0), 44100);

    let checkpoint = dir.path().join("checkpoint");
    let train = |extra: &[&str]| {
        let mut cmd = nnmusic();
        cmd.args([
            "train",
            "--dir",
            arg(&songs),
            "--checkpoint",
            arg(&checkpoint),
            "--hidden",
            "3",
        ])
        .args(extra);
        run(&mut cmd)
    };
    train(&["--until-exhausted"]);
    let output = train(&["--resume", "--epochs", "2"]);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Trained 2 epochs (3 total)"));
}
