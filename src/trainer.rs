use std::{fs, time::Instant};

use ndarray::{Array2, Axis, concatenate};
use ndarray_rand::rand::{SeedableRng, rngs::StdRng};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::cifar::{CifarData, Sample};
use crate::config::{CHANNELS, CLASSES, IMAGE_SIZE, NUM_CLASSES, TrainConfig, resolve_resume_lr};
use crate::error::{Error, Result};
use crate::loader::{DataLoader, collate_samples};
use crate::loss::{CrossEntropyLoss, argmax_rows, softmax};
use crate::metrics::{ClassReport, ProgressBar, RunningStats, format_time};
use crate::network::Network;
use crate::optim::{Optimizer, Sgd};
use crate::scheduler::{PlateauMode, ReduceLrOnPlateau};
use crate::summary::SummaryWriter;
use crate::viz::{FIGURE_IMAGES, plot_classes_preds, select_n_random, to_rgb_image};

pub const CONFIG_FILE: &str = "config.json";
// Number of test images projected into the embedding view after training.
pub const EMBEDDING_SAMPLES: usize = 100;

const FIGURE_TAG: &str = "predictions vs. actuals";

// Outputs of running the network over a whole split without updating it.
pub struct Evaluation {
    pub stats: RunningStats,
    // Softmax probabilities, one row per sample.
    pub probs: Array2<f32>,
    pub preds: Vec<usize>,
    pub labels: Vec<usize>,
}

pub struct Trainer {
    config: TrainConfig,
    network: Network,
    optimizer: Sgd,
    scheduler: ReduceLrOnPlateau,
    store: CheckpointStore,
    writer: SummaryWriter,
    rng: StdRng,
    best_acc: f64,
    start_epoch: usize,
}

impl Trainer {
    // Build the network and optimizer for `config`. With `config.resume` set, weights, best
    // accuracy, starting epoch and learning rate are taken from the stored checkpoint.
    pub fn new(config: TrainConfig, writer: SummaryWriter) -> Result<Trainer> {
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut network = Network::new(config.architecture, &mut rng);
        let store = CheckpointStore::new(&config.checkpoint_dir);

        let mut lr = config.lr;
        let mut best_acc = 0.0;
        let mut start_epoch = 0;
        if config.resume {
            tracing::info!("==> Resuming from checkpoint..");
            let checkpoint = store.load()?;
            checkpoint.restore(&mut network)?;
            best_acc = checkpoint.acc;
            start_epoch = checkpoint.epoch;
            lr = resolve_resume_lr(config.lr, checkpoint.lr);
            tracing::info!(
                epoch = start_epoch,
                best_acc,
                lr,
                "restored {} from {}",
                network.architecture().name(),
                store.path().display()
            );
        }

        tracing::info!(
            parameters = network.parameter_count(),
            "==> Building model {}",
            network.architecture().name()
        );
        for line in network.describe() {
            tracing::debug!("{line}");
        }

        Ok(Trainer {
            optimizer: Sgd::new(lr, config.momentum, config.weight_decay),
            scheduler: ReduceLrOnPlateau::new(PlateauMode::Max).with_patience(config.patience),
            config,
            network,
            store,
            writer,
            rng,
            best_acc,
            start_epoch,
        })
    }

    // Record the training configuration next to the rest of the run's output.
    pub fn save_config(&self) -> Result<()> {
        let path = self.writer.log_dir().join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(&self.config)?).map_err(Error::io(&path))
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn best_acc(&self) -> f64 {
        self.best_acc
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn lr(&self) -> f32 {
        self.optimizer.lr()
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    // Train from the starting epoch through `start_epoch + epochs` inclusive, then log the
    // post-training figures. Returns the best test accuracy reached.
    pub fn fit(&mut self, data: &CifarData) -> Result<f64> {
        tracing::info!(
            "training on {} images, testing on {}",
            data.training_data.len(),
            data.test_data.len()
        );
        let started = Instant::now();
        let last_epoch = self.start_epoch + self.config.epochs;

        for epoch in self.start_epoch..=last_epoch {
            let epoch_started = Instant::now();
            tracing::info!("Epoch: {epoch}");

            let train = self.train_epoch(epoch, &data.training_data)?;
            let test = self.test_epoch(epoch, &data.test_data)?;
            let epoch_time = epoch_started.elapsed();
            let lr = self.optimizer.lr();

            let scalars = [
                ("train/loss", train.avg_loss()),
                ("train/acc", train.accuracy()),
                ("test/loss", test.avg_loss()),
                ("test/acc", test.accuracy()),
                ("best_acc", self.best_acc),
                ("lr", f64::from(lr)),
                ("epoch_time", epoch_time.as_secs_f64()),
            ];
            for (tag, value) in scalars {
                self.writer.add_scalar(tag, value, epoch)?;
            }

            tracing::info!(
                "best_acc: {:.3} | cost_time: {:.2}s | lr: {lr}",
                self.best_acc,
                epoch_time.as_secs_f64()
            );
            self.scheduler.step(self.best_acc, &mut self.optimizer);
        }

        tracing::info!("finished training in {}", format_time(started.elapsed()));
        let evaluation = self.evaluate(&data.test_data)?;
        self.report(&data.test_data, &evaluation, last_epoch)?;
        Ok(self.best_acc)
    }

    // One pass over shuffled, augmented training batches with a parameter update per batch.
    pub fn train_epoch(&mut self, epoch: usize, samples: &[Sample]) -> Result<RunningStats> {
        let loader = DataLoader::train(self.config.train_batch_size);
        let total = loader.len(samples.len());
        let log_interval = self.config.log_interval;
        let mut progress = ProgressBar::new(total);
        let mut stats = RunningStats::default();
        let mut running_loss = 0.0;

        for (index, batch) in loader.batches(samples, &mut self.rng).enumerate() {
            self.network.zero_grad();
            let logits = self.network.forward(&batch.images, true);
            let (loss, grad) = CrossEntropyLoss.forward(logits.view(), &batch.labels);
            self.network.backward(grad);
            self.optimizer.step(self.network.parameters_mut());

            stats.update(loss, &argmax_rows(logits.view()), &batch.labels);
            progress.update(index, &stats.summary());

            running_loss += f64::from(loss);
            if (index + 1) % log_interval == 0 {
                let step = epoch * total + index;
                self.writer
                    .add_scalar("training loss", running_loss / log_interval as f64, step)?;
                running_loss = 0.0;
            }
        }

        tracing::debug!(epoch, "train {}", stats.summary());
        Ok(stats)
    }

    // Evaluate on the test split and checkpoint the network when it beats the best accuracy so
    // far.
    pub fn test_epoch(&mut self, epoch: usize, samples: &[Sample]) -> Result<RunningStats> {
        let stats = self.evaluate(samples)?.stats;
        tracing::debug!(epoch, "test {}", stats.summary());

        let acc = stats.accuracy();
        if acc > self.best_acc {
            tracing::info!("Saving..");
            let checkpoint = Checkpoint::capture(&self.network, acc, epoch, self.optimizer.lr());
            self.store.save(&checkpoint)?;
            self.best_acc = acc;
        }
        Ok(stats)
    }

    pub fn evaluate(&mut self, samples: &[Sample]) -> Result<Evaluation> {
        let loader = DataLoader::test(self.config.test_batch_size);
        let mut progress = ProgressBar::new(loader.len(samples.len()));
        let mut stats = RunningStats::default();
        let mut batch_probs = Vec::new();
        let mut preds = Vec::with_capacity(samples.len());
        let mut labels = Vec::with_capacity(samples.len());

        for (index, batch) in loader.batches(samples, &mut self.rng).enumerate() {
            let logits = self.network.forward(&batch.images, false);
            let (loss, _) = CrossEntropyLoss.forward(logits.view(), &batch.labels);
            let batch_preds = argmax_rows(logits.view());

            stats.update(loss, &batch_preds, &batch.labels);
            progress.update(index, &stats.summary());

            batch_probs.push(softmax(logits.view()));
            preds.extend(batch_preds);
            labels.extend(batch.labels);
        }

        let probs = if batch_probs.is_empty() {
            Array2::zeros((0, NUM_CLASSES))
        } else {
            let views: Vec<_> = batch_probs.iter().map(|probs| probs.view()).collect();
            concatenate(Axis(0), &views).expect("every batch has one column per class")
        };

        Ok(Evaluation {
            stats,
            probs,
            preds,
            labels,
        })
    }

    // Log the figures that summarize a trained network on `samples`: a prediction figure, an
    // embedding of raw images, one PR curve per class and the per-class accuracy. `evaluation`
    // must come from `evaluate` over the same samples.
    pub fn report(
        &mut self,
        samples: &[Sample],
        evaluation: &Evaluation,
        step: usize,
    ) -> Result<ClassReport> {
        if samples.is_empty() {
            tracing::warn!("no test images, skipping the report");
            return Ok(ClassReport::from_predictions(&[], &[]));
        }

        let shown: Vec<&Sample> = samples.iter().take(FIGURE_IMAGES).collect();
        let (figure, caption) = plot_classes_preds(&mut self.network, &collate_samples(&shown));
        self.writer.add_image(FIGURE_TAG, &figure, step)?;
        self.writer.add_text(FIGURE_TAG, &caption, step)?;

        self.log_embedding(samples, step)?;

        for (class, name) in CLASSES.iter().enumerate() {
            let truth: Vec<bool> = evaluation.labels.iter().map(|&label| label == class).collect();
            let probs: Vec<f32> = evaluation.probs.column(class).to_vec();
            let curve = self.writer.add_pr_curve(name, &truth, &probs, step)?;
            tracing::debug!(class = *name, "average precision {:.4}", curve.average_precision());
        }

        let report = ClassReport::from_predictions(&evaluation.preds, &evaluation.labels);
        for line in report.to_string().lines() {
            tracing::info!("{line}");
        }
        Ok(report)
    }

    fn log_embedding(&mut self, samples: &[Sample], step: usize) -> Result<()> {
        let picked = select_n_random(samples, EMBEDDING_SAMPLES, &mut self.rng);
        let width = CHANNELS * IMAGE_SIZE * IMAGE_SIZE;

        let values: Vec<f32> = picked
            .iter()
            .flat_map(|sample| sample.image.iter().map(|&byte| f32::from(byte) / 255.0))
            .collect();
        let features = Array2::from_shape_vec((picked.len(), width), values)
            .expect("every image has the same number of pixels");
        let metadata: Vec<String> = picked
            .iter()
            .map(|sample| CLASSES[usize::from(sample.label)].to_string())
            .collect();
        let thumbnails: Vec<_> = picked
            .iter()
            .map(|sample| to_rgb_image(sample.image.view()))
            .collect();

        self.writer
            .add_embedding("test images", features.view(), &metadata, Some(&thumbnails), step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Architecture;
    use ndarray::Array3;
    use std::path::Path;

    fn samples(count: usize) -> Vec<Sample> {
        (0..count)
            .map(|index| {
                let label = (index % NUM_CLASSES) as u8;
                Sample {
                    image: Array3::from_elem((CHANNELS, IMAGE_SIZE, IMAGE_SIZE), label * 25),
                    label,
                }
            })
            .collect()
    }

    // Every image appears once with each label, so any network scores exactly 10%.
    fn every_label(images: usize) -> Vec<Sample> {
        (0..images)
            .flat_map(|image| {
                let pixel = image as u8 * 60;
                (0..NUM_CLASSES as u8).map(move |label| Sample {
                    image: Array3::from_elem((CHANNELS, IMAGE_SIZE, IMAGE_SIZE), pixel),
                    label,
                })
            })
            .collect()
    }

    fn config(root: &Path) -> TrainConfig {
        TrainConfig {
            data_dir: root.join("data"),
            checkpoint_dir: root.join("checkpoint"),
            run_dir: root.join("run"),
            architecture: Architecture::Mlp,
            lr: 0.01,
            epochs: 1,
            train_batch_size: 4,
            test_batch_size: 5,
            log_interval: 1,
            seed: 7,
            ..TrainConfig::default()
        }
    }

    fn count_lines(path: &Path, needle: &str) -> usize {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|line| line.contains(needle))
            .count()
    }

    #[test]
    fn fit_runs_one_epoch_past_the_count_and_logs_everything() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let writer = SummaryWriter::new(&config.run_dir).unwrap();
        let mut trainer = Trainer::new(config.clone(), writer).unwrap();
        let data = CifarData {
            training_data: samples(8),
            test_data: samples(10),
        };

        let best = trainer.fit(&data).unwrap();

        let run = &config.run_dir;
        assert!(!run.join(CONFIG_FILE).exists());
        let scalars = run.join("scalars.jsonl");
        // Epochs 0 and 1, each with two training batches.
        assert_eq!(count_lines(&scalars, "\"train/loss\""), 2);
        assert_eq!(count_lines(&scalars, "\"training loss\""), 4);
        assert_eq!(count_lines(&run.join("pr_curves.jsonl"), "\"tag\""), NUM_CLASSES);
        assert_eq!(count_lines(&run.join("images.jsonl"), FIGURE_TAG), 1);
        assert!(run.join("projector/test_images_1/tensors.tsv").is_file());

        assert_eq!(trainer.checkpoint_store().exists(), best > 0.0);
        assert_eq!(trainer.best_acc(), best);
    }

    #[test]
    fn save_config_writes_the_training_settings() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let writer = SummaryWriter::new(&config.run_dir).unwrap();
        let trainer = Trainer::new(config.clone(), writer).unwrap();

        trainer.save_config().unwrap();
        let written = fs::read_to_string(config.run_dir.join(CONFIG_FILE)).unwrap();
        let restored: TrainConfig = serde_json::from_str(&written).unwrap();
        assert_eq!(restored.lr, config.lr);
        assert_eq!(restored.epochs, config.epochs);
        assert_eq!(restored.architecture, Architecture::Mlp);
    }

    #[test]
    fn new_best_is_checkpointed_with_epoch_and_current_lr() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let writer = SummaryWriter::new(&config.run_dir).unwrap();
        let mut trainer = Trainer::new(config, writer).unwrap();
        let test = every_label(3);

        let stats = trainer.test_epoch(5, &test).unwrap();
        assert_eq!(stats.accuracy(), 10.0);
        assert_eq!(trainer.best_acc(), 10.0);

        let saved = trainer.checkpoint_store().load().unwrap();
        assert_eq!(saved.epoch, 5);
        assert_eq!(saved.acc, 10.0);
        assert_eq!(saved.lr, trainer.lr());
        assert_eq!(saved.parameters, trainer.network().state());

        // Matching the best is not an improvement.
        trainer.test_epoch(6, &test).unwrap();
        assert_eq!(trainer.checkpoint_store().load().unwrap().epoch, 5);
    }

    #[test]
    fn epoch_below_best_keeps_existing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut rng = StdRng::seed_from_u64(3);
        let saved = Network::new(Architecture::Mlp, &mut rng);
        let store = CheckpointStore::new(&config.checkpoint_dir);
        store
            .save(&Checkpoint::capture(&saved, 50.0, 2, 0.01))
            .unwrap();
        let before = fs::read(store.path()).unwrap();

        let writer = SummaryWriter::new(&config.run_dir).unwrap();
        let mut trainer = Trainer::new(TrainConfig { resume: true, ..config }, writer).unwrap();
        let stats = trainer.test_epoch(9, &every_label(2)).unwrap();

        assert_eq!(stats.accuracy(), 10.0);
        assert_eq!(trainer.best_acc(), 50.0);
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn fit_cuts_lr_once_best_stalls_past_patience() {
        // Accuracy is 10% every epoch, so only epoch 0 sets a new best.
        for (patience, expected_lr) in [(0, 0.001), (1, 0.01)] {
            let dir = tempfile::tempdir().unwrap();
            let config = TrainConfig {
                patience,
                ..config(dir.path())
            };
            let writer = SummaryWriter::new(&config.run_dir).unwrap();
            let mut trainer = Trainer::new(config, writer).unwrap();
            let data = CifarData {
                training_data: every_label(1),
                test_data: every_label(2),
            };

            trainer.fit(&data).unwrap();
            approx::assert_abs_diff_eq!(trainer.lr(), expected_lr, epsilon = 1e-7);
            assert_eq!(trainer.checkpoint_store().load().unwrap().epoch, 0);
        }
    }

    #[test]
    fn evaluate_keeps_sample_order_and_probabilities() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let writer = SummaryWriter::new(&config.run_dir).unwrap();
        let mut trainer = Trainer::new(config, writer).unwrap();
        let test = samples(12);

        let evaluation = trainer.evaluate(&test).unwrap();
        assert_eq!(evaluation.probs.dim(), (12, NUM_CLASSES));
        assert_eq!(evaluation.labels, (0..12).map(|i| i % NUM_CLASSES).collect::<Vec<_>>());
        assert_eq!(evaluation.preds.len(), 12);
        for row in evaluation.probs.rows() {
            approx::assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
        assert_eq!(evaluation.stats.total, 12);
        assert_eq!(evaluation.stats.batches, 3);
    }

    #[test]
    fn resume_restores_checkpoint_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig {
            lr: crate::config::DEFAULT_LR,
            ..config(dir.path())
        };

        let mut rng = StdRng::seed_from_u64(99);
        let saved = Network::new(Architecture::Mlp, &mut rng);
        CheckpointStore::new(&config.checkpoint_dir)
            .save(&Checkpoint::capture(&saved, 42.0, 3, 0.05))
            .unwrap();

        let writer = SummaryWriter::new(&config.run_dir).unwrap();
        let trainer = Trainer::new(TrainConfig { resume: true, ..config }, writer).unwrap();
        assert_eq!(trainer.best_acc(), 42.0);
        assert_eq!(trainer.start_epoch(), 3);
        assert_eq!(trainer.lr(), 0.05);
        assert_eq!(trainer.network().state(), saved.state());
    }

    #[test]
    fn explicit_lr_overrides_checkpoint_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut rng = StdRng::seed_from_u64(1);
        let saved = Network::new(Architecture::Mlp, &mut rng);
        CheckpointStore::new(&config.checkpoint_dir)
            .save(&Checkpoint::capture(&saved, 10.0, 1, 0.05))
            .unwrap();

        let writer = SummaryWriter::new(&config.run_dir).unwrap();
        let trainer = Trainer::new(TrainConfig { resume: true, ..config }, writer).unwrap();
        assert_eq!(trainer.lr(), 0.01);
    }

    #[test]
    fn resume_without_checkpoint_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig {
            resume: true,
            ..config(dir.path())
        };
        let writer = SummaryWriter::new(&config.run_dir).unwrap();
        assert!(matches!(
            Trainer::new(config, writer),
            Err(Error::NoCheckpointDir(_))
        ));
    }
}
