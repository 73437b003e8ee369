use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::Architecture;

pub const CLASSES: [&str; 10] = [
    "plane", "car", "bird", "cat", "deer", "dog", "frog", "horse", "ship", "truck",
];
pub const NUM_CLASSES: usize = CLASSES.len();

pub const IMAGE_SIZE: usize = 32;
pub const CHANNELS: usize = 3;

pub const DEFAULT_LR: f32 = 0.1;
pub const TRAINING_EPOCHS: usize = 200;
pub const TRAIN_BATCH_SIZE: usize = 128;
pub const TEST_BATCH_SIZE: usize = 100;
pub const MOMENTUM: f32 = 0.9;
pub const WEIGHT_DECAY: f32 = 5e-4;
pub const PLATEAU_PATIENCE: usize = 10;

// Per-channel statistics of the CIFAR-10 training set, used to normalize every image.
pub const CIFAR_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
pub const CIFAR_STD: [f32; 3] = [0.2023, 0.1994, 0.2010];

// Every knob of a training run. Written to `config.json` in the run directory so a run can be
// inspected after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub data_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub run_dir: PathBuf,
    pub architecture: Architecture,
    pub lr: f32,
    pub epochs: usize,
    pub train_batch_size: usize,
    pub test_batch_size: usize,
    pub momentum: f32,
    pub weight_decay: f32,
    pub patience: usize,
    pub resume: bool,
    pub seed: u64,
    // Keep only the first N training records (quick experiments).
    pub train_limit: Option<usize>,
    pub test_limit: Option<usize>,
    // Log the running training loss every this many batches.
    pub log_interval: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            data_dir: PathBuf::from("data"),
            checkpoint_dir: PathBuf::from("checkpoint"),
            run_dir: PathBuf::from("runs/cifar10_experiment_1"),
            architecture: Architecture::LeNet,
            lr: DEFAULT_LR,
            epochs: TRAINING_EPOCHS,
            train_batch_size: TRAIN_BATCH_SIZE,
            test_batch_size: TEST_BATCH_SIZE,
            momentum: MOMENTUM,
            weight_decay: WEIGHT_DECAY,
            patience: PLATEAU_PATIENCE,
            resume: false,
            seed: 0,
            train_limit: None,
            test_limit: None,
            log_interval: 100,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.train_batch_size == 0 || self.test_batch_size == 0 {
            return Err(Error::InvalidConfig("batch sizes must be positive".into()));
        }
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.lr
            )));
        }
        if self.momentum < 0.0 || self.weight_decay < 0.0 {
            return Err(Error::InvalidConfig(
                "momentum and weight decay must not be negative".into(),
            ));
        }
        if self.log_interval == 0 {
            return Err(Error::InvalidConfig("log interval must be positive".into()));
        }
        Ok(())
    }
}

// Pick the learning rate to continue with after loading a checkpoint. The learning rate only
// ever shrinks during training, so a requested value equal to the default is read as "not set"
// and the checkpoint's value wins. Anything else is an explicit override.
pub fn resolve_resume_lr(requested: f32, checkpoint_lr: f32) -> f32 {
    if requested != DEFAULT_LR {
        requested
    } else {
        checkpoint_lr
    }
}
