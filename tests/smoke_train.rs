use std::{fs, path::Path};

use cifar_trainer::checkpoint::{Checkpoint, CheckpointStore};
use cifar_trainer::cifar::{Sample, TEST_FILE, TRAINING_FILES};
use cifar_trainer::cli::Cli;
use cifar_trainer::config::{CHANNELS, IMAGE_SIZE, NUM_CLASSES};
use cifar_trainer::network::{Architecture, Network};
use clap::Parser;
use ndarray::Array3;
use ndarray_rand::rand::{SeedableRng, rngs::StdRng};

fn write_split(path: &Path, count: usize) {
    let bytes: Vec<u8> = (0..count)
        .flat_map(|index| {
            let label = (index % NUM_CLASSES) as u8;
            Sample {
                image: Array3::from_elem((CHANNELS, IMAGE_SIZE, IMAGE_SIZE), label * 20 + 10),
                label,
            }
            .to_record_bytes()
        })
        .collect();
    fs::write(path, bytes).unwrap();
}

fn write_dataset(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    for name in TRAINING_FILES {
        write_split(&dir.join(name), 6);
    }
    write_split(&dir.join(TEST_FILE), 10);
}

fn run(args: &[&str]) -> anyhow::Result<()> {
    let argv = std::iter::once("cifar-trainer").chain(args.iter().copied());
    Cli::try_parse_from(argv).unwrap().run()
}

#[test]
fn train_writes_run_directory() {
    let root = tempfile::tempdir().unwrap();
    let data = root.path().join("data");
    let runs = root.path().join("runs");
    let checkpoints = root.path().join("checkpoint");
    write_dataset(&data);

    run(&[
        "train",
        "--arch",
        "mlp",
        "--epochs",
        "1",
        "--lr",
        "0.01",
        "--train-batch-size",
        "8",
        "--test-batch-size",
        "5",
        "--log-interval",
        "2",
        "--data-dir",
        data.to_str().unwrap(),
        "--checkpoint-dir",
        checkpoints.to_str().unwrap(),
        "--run-dir",
        runs.to_str().unwrap(),
    ])
    .unwrap();

    for file in ["config.json", "scalars.jsonl", "images.jsonl", "text.jsonl", "pr_curves.jsonl"] {
        assert!(runs.join(file).is_file(), "missing {file}");
    }
    assert!(runs.join("projector/projector_config.pbtxt").is_file());

    let config: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(runs.join("config.json")).unwrap()).unwrap();
    assert_eq!(config["architecture"], "mlp");
    assert_eq!(config["epochs"], 1);
}

#[test]
fn evaluate_uses_stored_checkpoint() {
    let root = tempfile::tempdir().unwrap();
    let data = root.path().join("data");
    let runs = root.path().join("runs");
    let checkpoints = root.path().join("checkpoint");
    write_dataset(&data);

    let mut rng = StdRng::seed_from_u64(3);
    let network = Network::new(Architecture::LeNet, &mut rng);
    CheckpointStore::new(&checkpoints)
        .save(&Checkpoint::capture(&network, 12.5, 4, 0.01))
        .unwrap();

    run(&[
        "evaluate",
        "--data-dir",
        data.to_str().unwrap(),
        "--checkpoint-dir",
        checkpoints.to_str().unwrap(),
        "--run-dir",
        runs.to_str().unwrap(),
    ])
    .unwrap();

    let curves = fs::read_to_string(runs.join("pr_curves.jsonl")).unwrap();
    assert_eq!(curves.lines().count(), NUM_CLASSES);
    assert!(fs::read_dir(runs.join("images")).unwrap().next().is_some());
}

#[test]
fn evaluate_leaves_training_config_untouched() {
    let root = tempfile::tempdir().unwrap();
    let data = root.path().join("data");
    let runs = root.path().join("runs");
    let checkpoints = root.path().join("checkpoint");
    write_dataset(&data);
    let dirs = [
        "--data-dir",
        data.to_str().unwrap(),
        "--checkpoint-dir",
        checkpoints.to_str().unwrap(),
        "--run-dir",
        runs.to_str().unwrap(),
    ];

    let mut train = vec!["train", "--arch", "mlp", "--epochs", "1", "--lr", "0.01"];
    train.extend(dirs);
    run(&train).unwrap();
    let store = CheckpointStore::new(&checkpoints);
    if !store.exists() {
        // A run that never beat 0% accuracy leaves no checkpoint behind.
        let network = Network::new(Architecture::Mlp, &mut StdRng::seed_from_u64(0));
        store.save(&Checkpoint::capture(&network, 1.0, 1, 0.01)).unwrap();
    }
    let before = fs::read_to_string(runs.join("config.json")).unwrap();

    let mut evaluate = vec!["evaluate"];
    evaluate.extend(dirs);
    run(&evaluate).unwrap();

    assert_eq!(fs::read_to_string(runs.join("config.json")).unwrap(), before);
    let config: serde_json::Value = serde_json::from_str(&before).unwrap();
    assert_eq!(config["epochs"], 1);
    assert_eq!(config["resume"], false);
}

#[test]
fn evaluate_without_checkpoint_fails() {
    let root = tempfile::tempdir().unwrap();
    let missing = root.path().join("nowhere");
    let result = run(&["evaluate", "--checkpoint-dir", missing.to_str().unwrap()]);
    let message = format!("{:#}", result.unwrap_err());
    assert!(message.contains("no checkpoint directory found"));
}

#[test]
fn missing_dataset_is_reported() {
    let root = tempfile::tempdir().unwrap();
    let result = run(&[
        "train",
        "--data-dir",
        root.path().join("empty").to_str().unwrap(),
        "--run-dir",
        root.path().join("runs").to_str().unwrap(),
    ]);
    assert!(result.is_err());
}
