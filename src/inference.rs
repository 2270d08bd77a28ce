use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use crate::model::{ArtifactRecorder, Model, ModelConfig, IMAGE_SIZE};
use burn::{
    prelude::*,
    record::{Recorder, RecorderError},
    tensor::ElementConversion,
};
use image::{imageops::FilterType, ImageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Model file '{}' not found. Ensure it's in the correct directory.", .0.display())]
    ArtifactMissing(PathBuf),
    #[error("Model file '{}' could not be decoded: {reason:?}", path.display())]
    Record {
        path: PathBuf,
        reason: RecorderError,
    },
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("{0}")]
    Decode(#[from] ImageError),
    #[error("expected {expected} pixels, got {actual}")]
    InputSize { expected: usize, actual: usize },
    #[error("model output has no class for index {0}")]
    Class(i64),
}

/// The digit predicted for one image.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prediction {
    pub predicted_digit: u8,
}

/// Decodes `bytes` as an image and turns it into the model's input layout: 28x28 grayscale,
/// row-major, values in [0, 1].
pub fn preprocess(bytes: &[u8]) -> Result<Vec<f32>, InferenceError> {
    let image = image::load_from_memory(bytes)?.to_luma8();
    let image = image::imageops::resize(
        &image,
        IMAGE_SIZE as u32,
        IMAGE_SIZE as u32,
        FilterType::CatmullRom,
    );

    Ok(image
        .into_raw()
        .into_iter()
        .map(|pixel| pixel as f32 / 255.0)
        .collect())
}

/// Read-only handle on a trained model.
///
/// Modules are `Send` but not necessarily `Sync`: the lock is only held to clone the module,
/// which shares the weight tensors, and every forward pass runs on its own clone.
pub struct Predictor<B: Backend> {
    model: Mutex<Model<B>>,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: Model<B>, device: B::Device) -> Self {
        Self {
            model: Mutex::new(model),
            device,
        }
    }

    /// Loads the artifact written by the trainer.
    pub fn load(path: &Path, device: B::Device) -> Result<Self, LoadError> {
        if !path.is_file() {
            return Err(LoadError::ArtifactMissing(path.to_path_buf()));
        }

        let record = ArtifactRecorder::new()
            .load(path.to_path_buf(), &device)
            .map_err(|reason| LoadError::Record {
                path: path.to_path_buf(),
                reason,
            })?;
        let model = ModelConfig::new().init::<B>(&device).load_record(record);
        log::info!("Loaded model from {}", path.display());

        Ok(Self::new(model, device))
    }

    /// Decodes, preprocesses and classifies one image.
    pub fn predict(&self, bytes: &[u8]) -> Result<Prediction, InferenceError> {
        let pixels = preprocess(bytes)?;
        self.predict_pixels(&pixels)
    }

    /// Classifies one preprocessed 28x28 image.
    pub fn predict_pixels(&self, pixels: &[f32]) -> Result<Prediction, InferenceError> {
        let expected = IMAGE_SIZE * IMAGE_SIZE;
        if pixels.len() != expected {
            return Err(InferenceError::InputSize {
                expected,
                actual: pixels.len(),
            });
        }

        let model = self
            .model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        // Add the batch dimension.
        let data = TensorData::new(pixels.to_vec(), [1, IMAGE_SIZE, IMAGE_SIZE]);
        let input = Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), &self.device);
        let output = model.forward(input);
        let class = output
            .argmax(1)
            .flatten::<1>(0, 1)
            .into_scalar()
            .elem::<i64>();

        let predicted_digit = u8::try_from(class).map_err(|_| InferenceError::Class(class))?;

        Ok(Prediction { predicted_digit })
    }
}
