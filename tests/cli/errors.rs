#[path = "../common/mod.rs"]
mod common;

use common::write_garbage;
use std::process::Command;

fn nnmusic() -> Command {
    Command::new(env!("CARGO_BIN_EXE_nnmusic"))
}

fn fails(cmd: &mut Command) -> String {
    let output = cmd.output().expect("run command");
    assert!(!output.status.success());
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn materialize_missing_directory_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stderr = fails(nnmusic().args([
        "materialize",
        dir.path().join("missing").to_str().unwrap(),
        dir.path().join("out.safetensors").to_str().unwrap(),
    ]));
    assert!(stderr.contains("does not exist"));
}

#[test]
fn materialize_unusable_directory_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_garbage(&dir.path().join("a.wav"));
    write_garbage(&dir.path().join("b.mp3"));
    let output = dir.path().join("out.safetensors");
    fails(nnmusic().args([
        "materialize",
        dir.path().to_str().unwrap(),
        output.to_str().unwrap(),
    ]));
    assert!(!output.exists());
}

#[test]
fn compose_without_checkpoint_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stderr = fails(nnmusic().args([
        "compose",
        "--checkpoint",
        dir.path().join("nothing").to_str().unwrap(),
        "--output",
        dir.path().join("out.wav").to_str().unwrap(),
        "--seed-audio",
        dir.path().join("seed.wav").to_str().unwrap(),
    ]));
    assert!(stderr.contains("no checkpoint found"));
}

#[test]
fn train_requires_a_source() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stderr = fails(nnmusic().args([
        "train",
        "--checkpoint",
        dir.path().join("checkpoint").to_str().unwrap(),
    ]));
    assert!(stderr.contains("--corpus or --dir"));
}

#[test]
fn invalid_config_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("config.yaml");
    std::fs::write(&config, "training: { unknown_key: 1 }\n").unwrap();
    fails(nnmusic().args([
        "--config",
        config.to_str().unwrap(),
        "inspect",
        dir.path().to_str().unwrap(),
    ]));
}
