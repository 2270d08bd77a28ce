use crate::data::MnistBatch;
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::AutodiffBackend,
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};

/// Recorder used to write the trained weights and read them back at serving time.
///
/// Weights are kept in full precision so the served model matches the trained one exactly.
pub type ArtifactRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Side length of the square grayscale images the model consumes.
pub const IMAGE_SIZE: usize = 28;

// Spatial size after two (conv 3x3 valid, max pool 2x2) stages: 28 -> 26 -> 13 -> 11 -> 5.
const FEATURE_SIZE: usize = 5;
const CONV1_CHANNELS: usize = 32;
const CONV2_CHANNELS: usize = 64;

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 10)]
    pub num_classes: usize,
    #[config(default = 128)]
    pub hidden_size: usize,
}

#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    linear1: Linear<B>,
    linear2: Linear<B>,
    activation: Relu,
}

impl ModelConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        Model {
            conv1: Conv2dConfig::new([1, CONV1_CHANNELS], [3, 3]).init(device),
            conv2: Conv2dConfig::new([CONV1_CHANNELS, CONV2_CHANNELS], [3, 3]).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            linear1: LinearConfig::new(
                CONV2_CHANNELS * FEATURE_SIZE * FEATURE_SIZE,
                self.hidden_size,
            )
            .init(device),
            linear2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> Model<B> {
    /// # Shapes
    ///   - Images [batch_size, height, width]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch_size, height, width] = images.dims();

        // Create a channel at the second dimension.
        let x = images.reshape([batch_size, 1, height, width]);

        let x = self.conv1.forward(x); // [batch_size, 32, 26, 26]
        let x = self.activation.forward(x);
        let x = self.pool.forward(x); // [batch_size, 32, 13, 13]

        let x = self.conv2.forward(x); // [batch_size, 64, 11, 11]
        let x = self.activation.forward(x);
        let x = self.pool.forward(x); // [batch_size, 64, 5, 5]

        let x = x.flatten::<2>(1, 3); // [batch_size, 1600]

        let x = self.linear1.forward(x);
        let x = self.activation.forward(x);

        self.linear2.forward(x) // [batch_size, num_classes]
    }

    pub fn forward_classification(
        &self,
        images: Tensor<B, 3>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

impl<B: AutodiffBackend> TrainStep<MnistBatch<B>, ClassificationOutput<B>> for Model<B> {
    fn step(&self, batch: MnistBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<MnistBatch<B>, ClassificationOutput<B>> for Model<B> {
    fn step(&self, batch: MnistBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}
