use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::PathBuf,
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::{Architecture, Network};

pub const CHECKPOINT_FILE: &str = "ckpt.json.gz";

// A parameter tensor flattened in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

// Everything needed to pick training back up: the weights, the best test accuracy reached (in
// percent), the epoch it was reached in and the learning rate in effect at the time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub architecture: Architecture,
    pub parameters: Vec<TensorRecord>,
    pub acc: f64,
    pub epoch: usize,
    pub lr: f32,
}

impl Checkpoint {
    pub fn capture(network: &Network, acc: f64, epoch: usize, lr: f32) -> Checkpoint {
        Checkpoint {
            architecture: network.architecture(),
            parameters: network.state(),
            acc,
            epoch,
            lr,
        }
    }

    // Load the stored weights into `network`, which must be of the same architecture.
    pub fn restore(&self, network: &mut Network) -> Result<()> {
        if self.architecture != network.architecture() {
            return Err(Error::CheckpointMismatch(format!(
                "checkpoint holds a {} network, not {}",
                self.architecture.name(),
                network.architecture().name()
            )));
        }
        network.load_state(&self.parameters)
    }
}

// Stores the single best checkpoint of a run as gzip-compressed JSON.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> CheckpointStore {
        CheckpointStore { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if !self.dir.is_dir() {
            fs::create_dir_all(&self.dir).map_err(Error::io(&self.dir))?;
        }

        // Write next to the target and rename, so an interrupted save never clobbers the last
        // good checkpoint.
        let path = self.path();
        let partial = self.dir.join(format!("{CHECKPOINT_FILE}.partial"));
        let file = File::create(&partial).map_err(Error::io(&partial))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, checkpoint)?;
        encoder
            .finish()
            .and_then(|mut writer| writer.flush())
            .map_err(Error::io(&partial))?;
        fs::rename(&partial, &path).map_err(Error::io(&path))?;

        tracing::debug!(
            epoch = checkpoint.epoch,
            acc = checkpoint.acc,
            "wrote checkpoint to {}",
            path.display()
        );
        Ok(())
    }

    pub fn load(&self) -> Result<Checkpoint> {
        if !self.dir.is_dir() {
            return Err(Error::NoCheckpointDir(self.dir.clone()));
        }
        let path = self.path();
        let file = File::open(&path).map_err(Error::io(&path))?;
        let checkpoint = serde_json::from_reader(GzDecoder::new(BufReader::new(file)))?;
        Ok(checkpoint)
    }
}
