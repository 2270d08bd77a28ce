use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use crate::{
    data::{MnistBatch, MnistBatcher},
    model::{ArtifactRecorder, Model, ModelConfig},
};
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::{
            vision::{MnistDataset, MnistItem},
            Dataset,
        },
    },
    module::AutodiffModule,
    optim::AdamConfig,
    prelude::*,
    record::RecorderError,
    tensor::{backend::AutodiffBackend, ElementConversion},
    train::{
        metric::{AccuracyMetric, LossMetric},
        renderer::{MetricState, MetricsRenderer, TrainingProgress},
        LearnerBuilder,
    },
};
use thiserror::Error;

/// Directory the `train` binary writes into when none is given.
pub const DEFAULT_ARTIFACT_DIR: &str = "artifacts";
/// File name of the model artifact inside the artifact directory.
pub const ARTIFACT_FILE: &str = "model.mpk";
const CONFIG_FILE: &str = "config.json";

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimizer: AdamConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::new(ModelConfig::new(), AdamConfig::new())
    }
}

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("failed to prepare artifact directory {path}: {source}")]
    ArtifactDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to save training config: {0}")]
    Config(#[source] std::io::Error),
    #[error("failed to save model artifact: {0:?}")]
    Artifact(RecorderError),
}

/// Path of the model artifact written by [train] into `artifact_dir`.
pub fn artifact_path(artifact_dir: &Path) -> PathBuf {
    artifact_dir.join(ARTIFACT_FILE)
}

/// Trains the model on the MNIST train split, validating on the test split, and overwrites
/// the artifact in `artifact_dir`.
///
/// Returns the trained model together with its final validation accuracy.
pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
) -> Result<(Model<B>, f64), TrainingError> {
    // The test split doubles as the validation set.
    fit::<B, _, _, LogRenderer>(
        artifact_dir,
        config,
        device,
        MnistDataset::train(),
        MnistDataset::test(),
        None,
    )
}

/// Runs the fixed number of epochs over `dataset_train` and writes the artifact.
///
/// Progress goes to burn's terminal dashboard unless a `renderer` is given. Only the final
/// model is persisted: no checkpoint is written between epochs.
pub fn fit<B, DT, DV, MR>(
    artifact_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
    dataset_train: DT,
    dataset_valid: DV,
    renderer: Option<MR>,
) -> Result<(Model<B>, f64), TrainingError>
where
    B: AutodiffBackend,
    DT: Dataset<MnistItem> + 'static,
    DV: Dataset<MnistItem> + 'static,
    MR: MetricsRenderer + 'static,
{
    std::fs::create_dir_all(artifact_dir).map_err(|source| TrainingError::ArtifactDir {
        path: artifact_dir.to_path_buf(),
        source,
    })?;
    config
        .save(artifact_dir.join(CONFIG_FILE))
        .map_err(TrainingError::Config)?;

    B::seed(config.seed);

    let batcher_train = MnistBatcher::<B>::new(device.clone());
    let batcher_valid = MnistBatcher::<B::InnerBackend>::new(device.clone());

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset_train);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(dataset_valid);

    let mut builder = LearnerBuilder::new(artifact_dir.to_string_lossy().as_ref())
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary();
    if let Some(renderer) = renderer {
        builder = builder.renderer(renderer);
    }
    let learner = builder.build(
        config.model.init::<B>(&device),
        config.optimizer.init(),
        config.learning_rate,
    );

    let now = Instant::now();
    let model_trained = learner.fit(dataloader_train, dataloader_valid.clone());
    let elapsed = now.elapsed().as_secs();
    log::info!("Training completed in {}m{}s", elapsed / 60, elapsed % 60);

    let path = artifact_path(artifact_dir);
    model_trained
        .clone()
        .save_file(path.clone(), &ArtifactRecorder::new())
        .map_err(TrainingError::Artifact)?;
    log::info!("Model artifact saved to {}", path.display());

    let accuracy = evaluate(&model_trained.valid(), dataloader_valid);

    Ok((model_trained, accuracy))
}

/// Sends training progress to the `log` facade instead of the terminal dashboard.
pub struct LogRenderer;

impl MetricsRenderer for LogRenderer {
    fn update_train(&mut self, _state: MetricState) {}

    fn update_valid(&mut self, _state: MetricState) {}

    fn render_train(&mut self, item: TrainingProgress) {
        log::debug!("train {item:?}");
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        log::debug!("valid {item:?}");
    }
}

/// Fraction of correctly classified items over every batch of `dataloader`.
pub fn evaluate<B: Backend>(
    model: &Model<B>,
    dataloader: Arc<dyn DataLoader<MnistBatch<B>>>,
) -> f64 {
    let mut correct = 0i64;
    let mut total = 0usize;

    for batch in dataloader.iter() {
        let [batch_size, _, _] = batch.images.dims();
        let predictions = model.forward(batch.images).argmax(1).flatten::<1>(0, 1);

        correct += predictions
            .equal(batch.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
        total += batch_size;
    }

    if total == 0 {
        return 0.0;
    }

    correct as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{Autodiff, NdArray},
        data::{dataloader::batcher::Batcher, dataset::InMemDataset},
    };

    type TestBackend = NdArray<f32>;

    #[test]
    fn default_config_matches_fixed_hyperparameters() {
        let config = TrainingConfig::default();

        assert_eq!(config.num_epochs, 10);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.seed, 42);
        assert_eq!(config.model.num_classes, 10);
        assert_eq!(config.model.hidden_size, 128);
    }

    #[test]
    fn config_round_trips_through_artifact_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        TrainingConfig::default().with_num_epochs(3).save(&path).unwrap();
        let loaded = TrainingConfig::load(&path).unwrap();

        assert_eq!(loaded.num_epochs, 3);
    }

    #[test]
    fn artifact_path_uses_fixed_file_name() {
        let path = artifact_path(Path::new("artifacts"));

        assert_eq!(path, Path::new("artifacts").join("model.mpk"));
    }

    #[test]
    fn errors_read_as_messages() {
        let err = TrainingError::ArtifactDir {
            path: PathBuf::from("/readonly/artifacts"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };

        assert_eq!(
            err.to_string(),
            "failed to prepare artifact directory /readonly/artifacts: denied"
        );
    }

    #[test]
    fn evaluate_counts_correct_predictions() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let items: Vec<MnistItem> = (0..5)
            .map(|i| MnistItem {
                image: [[(i * 40) as f32; 28]; 28],
                label: 0,
            })
            .collect();

        // Label every item with whatever the model predicts: accuracy must be 1.
        let batcher = MnistBatcher::<TestBackend>::new(device);
        let batch = batcher.batch(items.clone());
        let predicted = model
            .forward(batch.images)
            .argmax(1)
            .flatten::<1>(0, 1)
            .into_data()
            .to_vec::<i64>()
            .unwrap();
        let items: Vec<MnistItem> = items
            .into_iter()
            .zip(predicted)
            .map(|(item, label)| MnistItem {
                label: label as u8,
                ..item
            })
            .collect();

        let dataloader = DataLoaderBuilder::new(batcher)
            .batch_size(2)
            .build(InMemDataset::new(items));

        assert_eq!(evaluate(&model, dataloader), 1.0);
    }

    #[test]
    fn fit_persists_only_the_final_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<MnistItem> = (0..4)
            .map(|i| MnistItem {
                image: [[(i * 60) as f32; 28]; 28],
                label: i as u8,
            })
            .collect();
        let config = TrainingConfig::default()
            .with_num_epochs(2)
            .with_batch_size(2)
            .with_num_workers(1);

        let (_, accuracy) = fit::<Autodiff<TestBackend>, _, _, _>(
            dir.path(),
            config,
            Default::default(),
            InMemDataset::new(items.clone()),
            InMemDataset::new(items),
            Some(LogRenderer),
        )
        .unwrap();

        assert!(artifact_path(dir.path()).is_file());
        assert!(dir.path().join(CONFIG_FILE).is_file());
        assert!(!dir.path().join("checkpoint").exists());
        assert!((0.0..=1.0).contains(&accuracy));
    }
}
