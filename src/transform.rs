// Image preprocessing and augmentation.
//
// Training images go through `random_crop` → `random_horizontal_flip` → `to_tensor` →
// `normalize`; test images skip the two random steps.

use ndarray::{Array3, ArrayView3, Axis, s};
use ndarray_rand::rand::Rng;

use crate::config::{CIFAR_MEAN, CIFAR_STD};

pub const CROP_PADDING: usize = 4;

// Scale raw bytes into `[0, 1]`.
pub fn to_tensor(image: ArrayView3<u8>) -> Array3<f32> {
    image.mapv(|value| f32::from(value) / 255.0)
}

// Per-channel `(x - mean) / std` with the CIFAR-10 statistics.
pub fn normalize(mut image: Array3<f32>) -> Array3<f32> {
    for (channel, mut plane) in image.axis_iter_mut(Axis(0)).enumerate() {
        let (mean, std) = (CIFAR_MEAN[channel], CIFAR_STD[channel]);
        plane.mapv_inplace(|x| (x - mean) / std);
    }
    image
}

// Zero-pad every side by `padding` pixels, then cut a random window of the original size.
pub fn random_crop<R: Rng + ?Sized>(
    image: ArrayView3<u8>,
    padding: usize,
    rng: &mut R,
) -> Array3<u8> {
    let (channels, height, width) = image.dim();
    let mut padded = Array3::<u8>::zeros((channels, height + 2 * padding, width + 2 * padding));
    padded
        .slice_mut(s![.., padding..padding + height, padding..padding + width])
        .assign(&image);

    let top = rng.gen_range(0..=2 * padding);
    let left = rng.gen_range(0..=2 * padding);
    padded
        .slice(s![.., top..top + height, left..left + width])
        .to_owned()
}

pub fn horizontal_flip(image: ArrayView3<u8>) -> Array3<u8> {
    image.slice(s![.., .., ..;-1]).to_owned()
}

pub fn random_horizontal_flip<R: Rng + ?Sized>(image: Array3<u8>, rng: &mut R) -> Array3<u8> {
    if rng.gen_bool(0.5) {
        horizontal_flip(image.view())
    } else {
        image
    }
}

pub fn train_transform<R: Rng + ?Sized>(image: ArrayView3<u8>, rng: &mut R) -> Array3<f32> {
    let cropped = random_crop(image, CROP_PADDING, rng);
    let flipped = random_horizontal_flip(cropped, rng);
    normalize(to_tensor(flipped.view()))
}

pub fn test_transform(image: ArrayView3<u8>) -> Array3<f32> {
    normalize(to_tensor(image))
}
