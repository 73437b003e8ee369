use clap::ValueEnum;
use ndarray::{Array2, Array4, ArrayD, Ix2, IxDyn};
use ndarray_rand::rand::Rng;
use serde::{Deserialize, Serialize};

use crate::checkpoint::TensorRecord;
use crate::config::{CHANNELS, IMAGE_SIZE, NUM_CLASSES};
use crate::error::{Error, Result};
use crate::loss::{argmax_rows, softmax};
use crate::nn::{Conv2d, Flatten, Layer, Linear, MaxPool2d, Parameter, Relu};

// The architectures the harness can train. All of them take [batch, 3, 32, 32] images and emit
// [batch, 10] logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    /// Fully connected 3072-512-256-10.
    Mlp,
    /// Two 5x5 conv/pool stages followed by 400-120-84-10.
    #[value(name = "lenet")]
    #[serde(rename = "lenet")]
    LeNet,
    /// VGG-11 convolution stack (3x3, padding 1) and a 512-10 classifier.
    Vgg11,
}

// VGG-11 feature extractor: a number is a 3x3 conv with that many output channels, `None` is a
// 2x2 max pool.
const VGG11: [Option<usize>; 13] = [
    Some(64),
    None,
    Some(128),
    None,
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    None,
    Some(512),
    Some(512),
    None,
];

impl Architecture {
    pub fn name(self) -> &'static str {
        match self {
            Architecture::Mlp => "mlp",
            Architecture::LeNet => "lenet",
            Architecture::Vgg11 => "vgg11",
        }
    }

    fn build<R: Rng + ?Sized>(self, rng: &mut R) -> Vec<Box<dyn Layer>> {
        let mut layers: Vec<Box<dyn Layer>> = Vec::new();
        match self {
            Architecture::Mlp => {
                let input = CHANNELS * IMAGE_SIZE * IMAGE_SIZE;
                layers.push(Box::new(Flatten::new()));
                layers.push(Box::new(Linear::new(input, 512, rng)));
                layers.push(Box::new(Relu::new()));
                layers.push(Box::new(Linear::new(512, 256, rng)));
                layers.push(Box::new(Relu::new()));
                layers.push(Box::new(Linear::new(256, NUM_CLASSES, rng)));
            }
            Architecture::LeNet => {
                // 32x32 -> conv5 -> 28x28 -> pool -> 14x14 -> conv5 -> 10x10 -> pool -> 5x5.
                layers.push(Box::new(Conv2d::new(CHANNELS, 6, 5, 0, rng)));
                layers.push(Box::new(Relu::new()));
                layers.push(Box::new(MaxPool2d::new()));
                layers.push(Box::new(Conv2d::new(6, 16, 5, 0, rng)));
                layers.push(Box::new(Relu::new()));
                layers.push(Box::new(MaxPool2d::new()));
                layers.push(Box::new(Flatten::new()));
                layers.push(Box::new(Linear::new(16 * 5 * 5, 120, rng)));
                layers.push(Box::new(Relu::new()));
                layers.push(Box::new(Linear::new(120, 84, rng)));
                layers.push(Box::new(Relu::new()));
                layers.push(Box::new(Linear::new(84, NUM_CLASSES, rng)));
            }
            Architecture::Vgg11 => {
                // Five pools bring 32x32 down to 1x1, leaving a 512-wide feature vector.
                let mut channels = CHANNELS;
                for stage in VGG11 {
                    match stage {
                        Some(out) => {
                            layers.push(Box::new(Conv2d::new(channels, out, 3, 1, rng)));
                            layers.push(Box::new(Relu::new()));
                            channels = out;
                        }
                        None => layers.push(Box::new(MaxPool2d::new())),
                    }
                }
                layers.push(Box::new(Flatten::new()));
                layers.push(Box::new(Linear::new(channels, NUM_CLASSES, rng)));
            }
        }
        layers
    }
}

pub struct Network {
    architecture: Architecture,
    layers: Vec<Box<dyn Layer>>,
}

impl Network {
    pub fn new<R: Rng + ?Sized>(architecture: Architecture, rng: &mut R) -> Network {
        Network {
            architecture,
            layers: architecture.build(rng),
        }
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    // Run a batch of [batch, 3, 32, 32] images through every layer, returning [batch, 10] logits.
    // With `train` set, each layer keeps what it needs for the following `backward`.
    pub fn forward(&mut self, images: &Array4<f32>, train: bool) -> Array2<f32> {
        let mut activation: ArrayD<f32> = images.clone().into_dyn();
        for layer in self.layers.iter_mut() {
            activation = layer.forward(activation, train);
        }
        activation
            .into_dimensionality::<Ix2>()
            .expect("every architecture ends in a linear layer")
    }

    // Backpropagate the gradient of the loss w.r.t. the logits, accumulating parameter gradients.
    pub fn backward(&mut self, grad_logits: Array2<f32>) {
        let mut grad = grad_logits.into_dyn();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(grad);
        }
    }

    // Softmax probabilities for a batch, without touching any training state.
    pub fn probabilities(&mut self, images: &Array4<f32>) -> Array2<f32> {
        softmax(self.forward(images, false).view())
    }

    // Predicted class of every image and the probability assigned to it.
    pub fn predict(&mut self, images: &Array4<f32>) -> (Vec<usize>, Vec<f32>) {
        let probs = self.probabilities(images);
        let preds = argmax_rows(probs.view());
        let confidences = preds
            .iter()
            .zip(probs.rows())
            .map(|(&pred, row)| row[pred])
            .collect();
        (preds, confidences)
    }

    pub fn zero_grad(&mut self) {
        for parameter in self.parameters_mut() {
            parameter.zero_grad();
        }
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        self.layers
            .iter()
            .flat_map(|layer| layer.parameters())
            .collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.layers
            .iter_mut()
            .flat_map(|layer| layer.parameters_mut())
            .collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|parameter| parameter.len()).sum()
    }

    pub fn describe(&self) -> Vec<String> {
        self.layers.iter().map(|layer| layer.describe()).collect()
    }

    // Snapshot of every parameter value, in layer order.
    pub fn state(&self) -> Vec<TensorRecord> {
        self.parameters()
            .into_iter()
            .map(|parameter| TensorRecord {
                shape: parameter.value.shape().to_vec(),
                data: parameter.value.iter().copied().collect(),
            })
            .collect()
    }

    // Restore parameter values from `state`. Nothing is modified unless every record matches the
    // network's parameter list in count and shape.
    pub fn load_state(&mut self, records: &[TensorRecord]) -> Result<()> {
        let mut parameters = self.parameters_mut();
        if parameters.len() != records.len() {
            return Err(Error::CheckpointMismatch(format!(
                "network has {} parameter tensors, checkpoint has {}",
                parameters.len(),
                records.len()
            )));
        }

        let mut values = Vec::with_capacity(records.len());
        for (index, (parameter, record)) in parameters.iter().zip(records).enumerate() {
            if parameter.value.shape() != record.shape.as_slice() {
                return Err(Error::CheckpointMismatch(format!(
                    "tensor {index}: network shape {:?}, checkpoint shape {:?}",
                    parameter.value.shape(),
                    record.shape
                )));
            }
            let value = ArrayD::from_shape_vec(IxDyn(&record.shape), record.data.clone())
                .map_err(|e| Error::CheckpointMismatch(format!("tensor {index}: {e}")))?;
            values.push(value);
        }

        for (parameter, value) in parameters.iter_mut().zip(values) {
            parameter.value = value;
            parameter.zero_grad();
        }
        Ok(())
    }
}
