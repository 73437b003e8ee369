use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::checkpoint::CheckpointStore;
use crate::cifar::CifarData;
use crate::config::{
    DEFAULT_LR, MOMENTUM, PLATEAU_PATIENCE, TEST_BATCH_SIZE, TRAIN_BATCH_SIZE, TRAINING_EPOCHS,
    TrainConfig, WEIGHT_DECAY,
};
use crate::network::Architecture;
use crate::summary::{DEFAULT_LOG_DIR, SummaryWriter};
use crate::trainer::Trainer;

#[derive(Parser, Debug)]
#[command(name = "cifar-trainer", about = "Train and evaluate CIFAR-10 image classifiers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Train a network, checkpointing whenever test accuracy improves
    Train(TrainArgs),
    /// Evaluate the stored checkpoint on the test split
    Evaluate(EvaluateArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Learning rate. When resuming, leaving the default keeps the checkpoint's rate.
    #[arg(long, default_value_t = DEFAULT_LR)]
    pub lr: f32,
    /// Resume from the stored checkpoint
    #[arg(short, long)]
    pub resume: bool,
    #[arg(long, value_enum, default_value_t = Architecture::LeNet)]
    pub arch: Architecture,
    #[arg(long, default_value_t = TRAINING_EPOCHS)]
    pub epochs: usize,
    #[arg(long, default_value_t = TRAIN_BATCH_SIZE)]
    pub train_batch_size: usize,
    #[arg(long, default_value_t = TEST_BATCH_SIZE)]
    pub test_batch_size: usize,
    #[arg(long, default_value_t = MOMENTUM)]
    pub momentum: f32,
    #[arg(long, default_value_t = WEIGHT_DECAY)]
    pub weight_decay: f32,
    /// Epochs without a new best accuracy before the learning rate is cut
    #[arg(long, default_value_t = PLATEAU_PATIENCE)]
    pub patience: usize,
    /// Directory holding the CIFAR-10 binary batches
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,
    #[arg(long, default_value = "checkpoint")]
    pub checkpoint_dir: PathBuf,
    /// Where scalars, images and embeddings are written
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    pub run_dir: PathBuf,
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Only use the first N training images
    #[arg(long)]
    pub train_limit: Option<usize>,
    /// Only use the first N test images
    #[arg(long)]
    pub test_limit: Option<usize>,
    /// Log the running training loss every N batches
    #[arg(long, default_value_t = 100)]
    pub log_interval: usize,
}

impl From<TrainArgs> for TrainConfig {
    fn from(args: TrainArgs) -> Self {
        TrainConfig {
            data_dir: args.data_dir,
            checkpoint_dir: args.checkpoint_dir,
            run_dir: args.run_dir,
            architecture: args.arch,
            lr: args.lr,
            epochs: args.epochs,
            train_batch_size: args.train_batch_size,
            test_batch_size: args.test_batch_size,
            momentum: args.momentum,
            weight_decay: args.weight_decay,
            patience: args.patience,
            resume: args.resume,
            seed: args.seed,
            train_limit: args.train_limit,
            test_limit: args.test_limit,
            log_interval: args.log_interval,
        }
    }
}

#[derive(Args, Debug)]
pub struct EvaluateArgs {
    #[arg(long, default_value = "checkpoint")]
    pub checkpoint_dir: PathBuf,
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    pub run_dir: PathBuf,
    #[arg(long, default_value_t = TEST_BATCH_SIZE)]
    pub test_batch_size: usize,
    #[arg(long)]
    pub test_limit: Option<usize>,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Command::Train(args) => train(args.into()),
            Command::Evaluate(args) => evaluate(args),
        }
    }
}

fn train(config: TrainConfig) -> Result<()> {
    tracing::info!("==> Preparing data..");
    let data = CifarData::load(&config.data_dir, config.train_limit, config.test_limit)
        .with_context(|| format!("loading CIFAR-10 from {}", config.data_dir.display()))?;

    let writer = SummaryWriter::new(&config.run_dir)?;
    let mut trainer = Trainer::new(config, writer).context("setting up training")?;
    trainer.save_config()?;
    let best = trainer.fit(&data)?;
    tracing::info!("best test accuracy {best:.3}%");
    Ok(())
}

fn evaluate(args: EvaluateArgs) -> Result<()> {
    // The network has to be built with the architecture it was trained with. The run's
    // config.json is left alone: it describes how the checkpoint was trained.
    let checkpoint = CheckpointStore::new(&args.checkpoint_dir)
        .load()
        .context("no checkpoint to evaluate")?;

    let config = TrainConfig {
        architecture: checkpoint.architecture,
        checkpoint_dir: args.checkpoint_dir,
        data_dir: args.data_dir,
        run_dir: args.run_dir,
        test_batch_size: args.test_batch_size,
        test_limit: args.test_limit,
        train_limit: Some(0),
        resume: true,
        ..TrainConfig::default()
    };

    let data = CifarData::load(&config.data_dir, config.train_limit, config.test_limit)
        .with_context(|| format!("loading CIFAR-10 from {}", config.data_dir.display()))?;
    let writer = SummaryWriter::new(&config.run_dir)?;
    let mut trainer = Trainer::new(config, writer)?;

    let evaluation = trainer.evaluate(&data.test_data)?;
    tracing::info!("test {}", evaluation.stats.summary());
    trainer.report(&data.test_data, &evaluation, trainer.start_epoch())?;
    Ok(())
}
