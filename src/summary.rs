// Experiment-tracking output.
//
// A `SummaryWriter` owns a run directory and appends everything logged during training to plain
// files inside it, so any dashboard (or a script) can pick them up later:
//
// ```text
// <log_dir>/
//   scalars.jsonl        {"tag", "step", "value", "wall_time"} per line
//   text.jsonl           {"tag", "step", "text", "wall_time"}
//   images.jsonl         {"tag", "step", "path", "wall_time"}, PNGs under images/
//   pr_curves.jsonl      {"tag", "step", "curve", "wall_time"}
//   projector/
//     projector_config.pbtxt
//     <tag>_<step>/tensors.tsv, metadata.tsv, sprite.png
// ```

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use image::{RgbImage, imageops};
use itertools::Itertools;
use ndarray::ArrayView2;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::pr_curve::{DEFAULT_NUM_THRESHOLDS, PrCurve};
use crate::viz::image_grid;

pub const DEFAULT_LOG_DIR: &str = "runs/cifar10_experiment_1";

const SCALARS: &str = "scalars.jsonl";
const TEXT: &str = "text.jsonl";
const IMAGES: &str = "images.jsonl";
const PR_CURVES: &str = "pr_curves.jsonl";
const PROJECTOR: &str = "projector";
const PROJECTOR_CONFIG: &str = "projector_config.pbtxt";

#[derive(Serialize)]
struct Event<'a, T: Serialize> {
    tag: &'a str,
    step: usize,
    #[serde(flatten)]
    payload: T,
    wall_time: f64,
}

#[derive(Serialize)]
struct Scalar {
    value: f64,
}

#[derive(Serialize)]
struct Text<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct ImageRef {
    path: String,
}

#[derive(Serialize)]
struct Curve<'a> {
    curve: &'a PrCurve,
    average_precision: f64,
}

pub struct SummaryWriter {
    log_dir: PathBuf,
}

impl SummaryWriter {
    pub fn new(log_dir: impl Into<PathBuf>) -> Result<SummaryWriter> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir).map_err(Error::io(&log_dir))?;
        tracing::debug!("logging run to {}", log_dir.display());
        Ok(SummaryWriter { log_dir })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn add_scalar(&self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.append(SCALARS, tag, step, Scalar { value })
    }

    pub fn add_text(&self, tag: &str, text: &str, step: usize) -> Result<()> {
        self.append(TEXT, tag, step, Text { text })
    }

    pub fn add_image(&self, tag: &str, image: &RgbImage, step: usize) -> Result<()> {
        let relative = PathBuf::from("images").join(format!("{}_{step}.png", file_stem(tag)));
        let path = self.log_dir.join(&relative);
        create_parent(&path)?;
        image.save(&path)?;
        self.append(
            IMAGES,
            tag,
            step,
            ImageRef {
                path: relative.to_string_lossy().into_owned(),
            },
        )
    }

    // Log a precision-recall curve for one class. `labels[i]` says whether sample `i` truly
    // belongs to the class, `probs[i]` is the predicted probability that it does.
    pub fn add_pr_curve(
        &self,
        tag: &str,
        labels: &[bool],
        probs: &[f32],
        step: usize,
    ) -> Result<PrCurve> {
        let curve = PrCurve::compute(labels, probs, DEFAULT_NUM_THRESHOLDS);
        self.append(
            PR_CURVES,
            tag,
            step,
            Curve {
                curve: &curve,
                average_precision: curve.average_precision(),
            },
        )?;
        Ok(curve)
    }

    // Write an embedding in the projector layout: one row of `features` per point, one
    // `metadata` label per point and optionally one thumbnail per point for the sprite sheet.
    pub fn add_embedding(
        &self,
        tag: &str,
        features: ArrayView2<f32>,
        metadata: &[String],
        label_images: Option<&[RgbImage]>,
        step: usize,
    ) -> Result<()> {
        if metadata.len() != features.nrows() {
            return Err(Error::InvalidConfig(format!(
                "embedding has {} points but {} metadata labels",
                features.nrows(),
                metadata.len()
            )));
        }

        let name = format!("{}_{step}", file_stem(tag));
        let dir = self.log_dir.join(PROJECTOR).join(&name);
        fs::create_dir_all(&dir).map_err(Error::io(&dir))?;

        let tensors: String = features
            .rows()
            .into_iter()
            .map(|row| row.iter().join("\t") + "\n")
            .collect();
        write_file(&dir.join("tensors.tsv"), &tensors)?;

        let labels: String = metadata.iter().map(|label| format!("{label}\n")).collect();
        write_file(&dir.join("metadata.tsv"), &labels)?;

        let mut config = format!(
            "embeddings {{\n  tensor_name: \"{tag}:{step}\"\n  \
             tensor_path: \"{name}/tensors.tsv\"\n  \
             metadata_path: \"{name}/metadata.tsv\"\n"
        );
        if let Some(images) = label_images.filter(|images| !images.is_empty()) {
            // The projector expects a square sprite sheet of equally sized thumbnails.
            let side = (images.len() as f64).sqrt().ceil() as u32;
            let (width, height) = images[0].dimensions();
            let mut sprite = RgbImage::new(side * width, side * height);
            imageops::replace(&mut sprite, &image_grid(images, side as usize, 0), 0, 0);
            sprite.save(dir.join("sprite.png"))?;
            config.push_str(&format!(
                "  sprite {{\n    image_path: \"{name}/sprite.png\"\n    \
                 single_image_dim: {width}\n    single_image_dim: {height}\n  }}\n"
            ));
        }
        config.push_str("}\n");

        let config_path = self.log_dir.join(PROJECTOR).join(PROJECTOR_CONFIG);
        append_file(&config_path, &config)
    }

    fn append<T: Serialize>(&self, file: &str, tag: &str, step: usize, payload: T) -> Result<()> {
        let event = Event {
            tag,
            step,
            payload,
            wall_time: wall_time(),
        };
        let line = serde_json::to_string(&event)? + "\n";
        append_file(&self.log_dir.join(file), &line)
    }
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

// Tags use '/' as a namespace separator; keep file names flat.
fn file_stem(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(Error::io(parent))?;
    }
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).map_err(Error::io(path))
}

fn append_file(path: &Path, contents: &str) -> Result<()> {
    create_parent(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(Error::io(path))?;
    file.write_all(contents.as_bytes()).map_err(Error::io(path))
}
