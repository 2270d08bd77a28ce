#![recursion_limit = "256"]

use std::{path::PathBuf, process::ExitCode};

use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
use clap::Parser;
use digit_recognizer::training::{self, TrainingConfig, DEFAULT_ARTIFACT_DIR};

type TrainBackend = Autodiff<NdArray<f32>>;

/// Train the digit classifier on MNIST and write the model artifact.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct TrainArgs {
    /// Directory receiving the model artifact, the training config and the experiment logs.
    #[arg(long, default_value = DEFAULT_ARTIFACT_DIR)]
    artifact_dir: PathBuf,
}

fn main() -> ExitCode {
    let args = TrainArgs::parse();

    match training::train::<TrainBackend>(
        &args.artifact_dir,
        TrainingConfig::default(),
        NdArrayDevice::Cpu,
    ) {
        Ok((_, accuracy)) => {
            println!(
                "Model trained and saved as {} (validation accuracy {:.2}%)",
                training::artifact_path(&args.artifact_dir).display(),
                accuracy * 100.0
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
