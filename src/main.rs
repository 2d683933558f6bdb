//! Command-line interface for nnmusic.
//!
//! The CLI wraps the library pipeline: materialize a folder of audio into a
//! corpus, train a checkpoint on it, compose new audio from the checkpoint,
//! and inspect either artifact.

#![recursion_limit = "256"]

use anyhow::Result;
use burn::backend::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::{Args, Parser, Subcommand};
use nnmusic::audio::io::peak_normalize;
use nnmusic::audio::SampleEncoding;
use nnmusic::compose::{seed_from_corpus, truncate_seed};
use nnmusic::config::{load_config, AudioSpec, Config};
use nnmusic::model::checkpoint;
use nnmusic::train::configure_threads;
use nnmusic::{perf, Composer, Corpus, EpochBudget, Trainer, TrainingSource};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type TrainBackend = Autodiff<NdArray<f64>>;
type ComposeBackend = NdArray<f64>;

/// Top-level CLI options.
#[derive(Parser)]
#[command(name = "nnmusic")]
#[command(about = "Train an LSTM on raw audio and compose with it", long_about = None)]
struct Cli {
    /// Print performance summary at the end of the run.
    #[arg(long, short, global = true)]
    verbose: bool,
    /// YAML configuration file; command-line flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Expected shape of input audio.
#[derive(Args, Debug, Clone, Default)]
struct AudioArgs {
    /// Sample rate every file must have, in Hz.
    #[arg(long)]
    rate: Option<u32>,
    /// Channel count every file must have.
    #[arg(long)]
    channels: Option<usize>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Pack every usable audio file of a directory into a corpus file.
    Materialize {
        /// Directory of audio files.
        source: PathBuf,
        /// Corpus file to write.
        output: PathBuf,
        #[command(flatten)]
        audio: AudioArgs,
    },
    /// Train a model and write a checkpoint directory.
    Train(TrainArgs),
    /// Generate audio from a checkpoint.
    Compose(ComposeArgs),
    /// Describe a corpus file or checkpoint directory.
    Inspect {
        /// Corpus file or checkpoint directory.
        path: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct TrainArgs {
    /// Materialized corpus to train on.
    #[arg(long)]
    corpus: Option<PathBuf>,
    /// Directory of audio files to stream batches from.
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Checkpoint directory to write.
    #[arg(long)]
    checkpoint: PathBuf,
    /// Continue from the checkpoint already in `--checkpoint`.
    #[arg(long)]
    resume: bool,
    /// Number of epochs.
    #[arg(long)]
    epochs: Option<usize>,
    /// Make a single pass over the input instead of a fixed epoch count.
    #[arg(long, conflicts_with = "epochs")]
    until_exhausted: bool,
    /// Worker threads for tensor kernels.
    #[arg(long)]
    threads: Option<usize>,
    /// Files per batch when streaming from `--dir`.
    #[arg(long)]
    batch_size: Option<usize>,
    /// LSTM hidden width.
    #[arg(long)]
    hidden: Option<usize>,
    /// Adam learning rate.
    #[arg(long)]
    learning_rate: Option<f64>,
    /// Also checkpoint every N epochs.
    #[arg(long)]
    checkpoint_every: Option<usize>,
    /// Fraction of corpus examples held out for validation.
    #[arg(long)]
    validation_fraction: Option<f64>,
    /// Directory for per-epoch loss history.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[command(flatten)]
    audio: AudioArgs,
}

#[derive(Args, Debug, Clone)]
struct ComposeArgs {
    /// Checkpoint directory to compose with.
    #[arg(long)]
    checkpoint: PathBuf,
    /// Output WAV path.
    #[arg(long)]
    output: PathBuf,
    /// Number of time steps to generate.
    #[arg(long)]
    duration: Option<usize>,
    /// Audio file to use as seed.
    #[arg(long, conflicts_with = "seed_corpus")]
    seed_audio: Option<PathBuf>,
    /// Corpus to draw a random seed example from.
    #[arg(long)]
    seed_corpus: Option<PathBuf>,
    /// Use at most this many seed steps.
    #[arg(long)]
    seed_length: Option<usize>,
    /// Snap generated samples to amplitudes seen in training.
    #[arg(long)]
    quantize: bool,
    /// Peak-normalize the output.
    #[arg(long)]
    normalize: bool,
    /// Output sample rate; defaults to the rate the model was trained on.
    #[arg(long)]
    rate: Option<u32>,
    /// Output sample layout: float32, int16, int24 or int32.
    #[arg(long)]
    encoding: Option<SampleEncoding>,
}

/// Entry point for the CLI.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let verbose = cli.verbose;
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Materialize {
            source,
            output,
            audio,
        } => {
            apply_audio_args(&mut config, &audio);
            let report = nnmusic::materialize(&source, &output, config.audio)?;
            println!(
                "Wrote corpus {} with shape {:?}; {} files skipped",
                output.display(),
                report.shape,
                report.skipped.len()
            );
        }
        Commands::Train(args) => {
            let interrupted = Arc::new(AtomicBool::new(false));
            let interrupt_flag = Arc::clone(&interrupted);
            ctrlc::set_handler(move || {
                interrupt_flag.store(true, Ordering::SeqCst);
            })?;
            run_train(config, args, &interrupted)?;
        }
        Commands::Compose(args) => run_compose(config, args)?,
        Commands::Inspect { path } => run_inspect(&path)?,
    }

    if verbose {
        eprintln!("{}", perf::report());
    }

    Ok(())
}

fn apply_audio_args(config: &mut Config, audio: &AudioArgs) {
    if let Some(rate) = audio.rate {
        config.audio.sample_rate = rate;
    }
    if let Some(channels) = audio.channels {
        config.audio.channels = channels;
    }
}

fn apply_train_args(config: &mut Config, args: &TrainArgs) {
    apply_audio_args(config, &args.audio);
    let training = &mut config.training;
    if let Some(epochs) = args.epochs {
        training.epochs = epochs;
    }
    if let Some(threads) = args.threads {
        training.threads = threads;
    }
    if let Some(batch_size) = args.batch_size {
        training.batch_size = batch_size;
    }
    if let Some(learning_rate) = args.learning_rate {
        training.learning_rate = learning_rate;
    }
    if let Some(every) = args.checkpoint_every {
        training.checkpoint_every = Some(every);
    }
    if let Some(fraction) = args.validation_fraction {
        training.validation_fraction = fraction;
    }
    if let Some(log_dir) = &args.log_dir {
        training.log_dir = Some(log_dir.clone());
    }
    if let Some(hidden) = args.hidden {
        config.model.hidden_size = hidden;
    }
}

fn run_train(mut config: Config, args: TrainArgs, interrupted: &AtomicBool) -> Result<()> {
    apply_train_args(&mut config, &args);
    config.training.validate()?;
    if let Err(e) = configure_threads(config.training.threads) {
        tracing::warn!("{e}");
    }

    let device = NdArrayDevice::default();
    let mut trainer = if args.resume {
        Trainer::<TrainBackend>::resume(&args.checkpoint, config.training.clone(), device)?
    } else {
        Trainer::<TrainBackend>::new(config.training.clone(), config.model, device)?
            .with_checkpoint_dir(&args.checkpoint)
    };
    let budget = if args.until_exhausted {
        EpochBudget::UntilExhausted
    } else {
        EpochBudget::Fixed(config.training.epochs)
    };

    let summary = match (&args.corpus, &args.dir) {
        (Some(path), None) => {
            let corpus = Corpus::open(path)?;
            if !args.resume {
                trainer.build(&corpus)?;
            }
            trainer.train(TrainingSource::Corpus(&corpus), budget, interrupted)?
        }
        (None, Some(dir)) => {
            if !args.resume {
                trainer.build_streaming(config.audio)?;
            }
            let source = TrainingSource::Directory {
                dir: dir.as_path(),
                spec: config.audio,
            };
            trainer.train(source, budget, interrupted)?
        }
        _ => anyhow::bail!("exactly one of --corpus or --dir is required"),
    };

    if summary.cancelled {
        eprintln!("Interrupted; checkpoint saved");
    }
    println!(
        "Trained {} epochs ({} total) into {}",
        summary.epochs,
        trainer.epochs_completed(),
        args.checkpoint.display()
    );
    if let Some(loss) = summary.last_loss {
        println!("Final loss: {loss:.6}");
    }
    Ok(())
}

fn run_compose(config: Config, args: ComposeArgs) -> Result<()> {
    let composer = Composer::<ComposeBackend>::load(&args.checkpoint, NdArrayDevice::default())?
        .with_quantization(args.quantize || config.compose.quantize)?;
    let rate = args
        .rate
        .or(composer.sample_rate())
        .unwrap_or(config.audio.sample_rate);
    let spec = AudioSpec::new(rate, composer.channels());
    let seed_length = args.seed_length.or(config.compose.seed_length);

    let seed = match (&args.seed_audio, &args.seed_corpus) {
        (Some(path), None) => truncate_seed(nnmusic::audio::read(path, spec)?, seed_length),
        (None, Some(path)) => {
            let corpus = Corpus::open(path)?;
            seed_from_corpus(&corpus, &mut rand::thread_rng(), seed_length)?
        }
        _ => anyhow::bail!("exactly one of --seed-audio or --seed-corpus is required"),
    };

    let duration = args.duration.unwrap_or(config.compose.duration);
    let mut music = composer.compose(&seed, duration)?;
    if args.normalize || config.compose.normalize {
        peak_normalize(&mut music);
    }
    let encoding = args.encoding.unwrap_or(config.compose.encoding);
    nnmusic::audio::write_with(&args.output, &music, rate, encoding)?;
    println!(
        "Wrote {} steps of {}-channel audio to {}",
        music.nrows(),
        music.ncols(),
        args.output.display()
    );
    Ok(())
}

fn run_inspect(path: &Path) -> Result<()> {
    if path.is_dir() {
        let metadata = checkpoint::load_metadata(path)?;
        println!("checkpoint: {}", path.display());
        println!("format version: {}", metadata.format_version);
        println!("channels: {}", metadata.model.channels);
        println!("hidden size: {}", metadata.model.hidden_size);
        match metadata.model.unroll_length {
            Some(unroll) => println!("unroll length: {unroll}"),
            None => println!("unroll length: variable"),
        }
        println!("learning rate: {}", metadata.learning_rate);
        println!("epochs completed: {}", metadata.epochs_completed);
        if let Some(rate) = metadata.sample_rate {
            println!("sample rate: {rate}");
        }
        if let Some(dictionary) = &metadata.dictionary {
            println!("dictionary entries: {}", dictionary.len());
        }
    } else {
        let corpus = Corpus::open(path)?;
        let (examples, steps, channels) = corpus.shape();
        println!("corpus: {}", path.display());
        println!("shape: ({examples}, {steps}, {channels})");
        if let Some(rate) = corpus.sample_rate() {
            println!("sample rate: {rate}");
        }
        for (source, length) in corpus.sources().iter().zip(corpus.lengths()) {
            println!("  {source}: {length} steps");
        }
    }
    Ok(())
}
