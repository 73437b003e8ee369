// Turning tensors and predictions into pictures for the dashboard.

use image::{Rgb, RgbImage, imageops};
use itertools::Itertools;
use ndarray::{Array4, ArrayView3, Axis};
use ndarray_rand::rand::{Rng, seq::SliceRandom};

use crate::cifar::Sample;
use crate::config::{CIFAR_MEAN, CIFAR_STD, CLASSES};
use crate::loader::Batch;
use crate::network::Network;

pub const GRID_PADDING: u32 = 2;
// How many images of a batch go into the prediction figure.
pub const FIGURE_IMAGES: usize = 4;

const RIGHT: Rgb<u8> = Rgb([0, 160, 0]);
const WRONG: Rgb<u8> = Rgb([200, 0, 0]);
const FRAME_THICKNESS: u32 = 2;

// Convert a raw `(channel, row, column)` byte image.
pub fn to_rgb_image(image: ArrayView3<u8>) -> RgbImage {
    let (_, height, width) = image.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([image[[0, y, x]], image[[1, y, x]], image[[2, y, x]]])
    })
}

// Undo the per-channel normalization of a network input and quantize it back to bytes.
pub fn unnormalize(image: ArrayView3<f32>) -> RgbImage {
    let (_, height, width) = image.dim();
    let byte = |channel: usize, y: usize, x: usize| {
        let value = image[[channel, y, x]] * CIFAR_STD[channel] + CIFAR_MEAN[channel];
        (value.clamp(0.0, 1.0) * 255.0).round() as u8
    };
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([byte(0, y, x), byte(1, y, x), byte(2, y, x)])
    })
}

// Lay images out row by row, `columns` per row, with `padding` black pixels around each one.
// All images are assumed to have the size of the first.
pub fn image_grid(images: &[RgbImage], columns: usize, padding: u32) -> RgbImage {
    let Some(first) = images.first() else {
        return RgbImage::new(0, 0);
    };
    let columns = columns.clamp(1, images.len());
    let rows = images.len().div_ceil(columns);
    let (width, height) = first.dimensions();
    let (cell_width, cell_height) = (width + padding, height + padding);

    let mut grid = RgbImage::new(
        columns as u32 * cell_width + padding,
        rows as u32 * cell_height + padding,
    );
    for (index, image) in images.iter().enumerate() {
        let x = padding + (index % columns) as u32 * cell_width;
        let y = padding + (index / columns) as u32 * cell_height;
        imageops::replace(&mut grid, image, i64::from(x), i64::from(y));
    }
    grid
}

// Draw a rectangle outline of the given thickness inside `image`.
pub fn draw_frame(image: &mut RgbImage, color: Rgb<u8>, thickness: u32) {
    let (width, height) = image.dimensions();
    for y in 0..height {
        for x in 0..width {
            let edge = x.min(y).min(width - 1 - x).min(height - 1 - y);
            if edge < thickness {
                image.put_pixel(x, y, color);
            }
        }
    }
}

// Pick `n` distinct samples at random, or all of them when there are fewer than `n`.
pub fn select_n_random<'a, R: Rng + ?Sized>(
    samples: &'a [Sample],
    n: usize,
    rng: &mut R,
) -> Vec<&'a Sample> {
    samples.choose_multiple(rng, n).collect()
}

// Predicted class of every image together with the probability the network assigns to it.
pub fn images_to_probs(network: &mut Network, images: &Array4<f32>) -> (Vec<usize>, Vec<f32>) {
    network.predict(images)
}

// Figure of the first few images of a batch, each framed green when the network classifies it
// correctly and red otherwise, and one caption per image.
pub fn plot_classes_preds(network: &mut Network, batch: &Batch) -> (RgbImage, String) {
    let (preds, probs) = images_to_probs(network, &batch.images);

    let shown = batch.len().min(FIGURE_IMAGES);
    let tiles: Vec<RgbImage> = (0..shown)
        .map(|index| {
            let mut tile = unnormalize(batch.images.index_axis(Axis(0), index));
            let color = if preds[index] == batch.labels[index] { RIGHT } else { WRONG };
            draw_frame(&mut tile, color, FRAME_THICKNESS);
            tile
        })
        .collect();

    let caption = (0..shown)
        .map(|index| {
            format!(
                "{}, {:.1}%\n(label: {})",
                CLASSES[preds[index]],
                probs[index] * 100.0,
                CLASSES[batch.labels[index]]
            )
        })
        .join("\n");

    (image_grid(&tiles, FIGURE_IMAGES, GRID_PADDING), caption)
}
