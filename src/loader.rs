use itertools::Itertools;
use ndarray::{Array3, Array4, ArrayView3, Axis, stack};
use ndarray_rand::rand::{Rng, seq::SliceRandom};

use crate::cifar::Sample;
use crate::transform::{test_transform, train_transform};

// A mini-batch ready for the network: images in [batch, channel, row, column] layout and the
// matching class indices.
pub struct Batch {
    pub images: Array4<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DataLoader {
    pub batch_size: usize,
    pub shuffle: bool,
    pub augment: bool,
}

impl DataLoader {
    pub fn train(batch_size: usize) -> DataLoader {
        DataLoader {
            batch_size,
            shuffle: true,
            augment: true,
        }
    }

    pub fn test(batch_size: usize) -> DataLoader {
        DataLoader {
            batch_size,
            shuffle: false,
            augment: false,
        }
    }

    // Number of batches an epoch over `samples` items yields, counting a short final batch.
    pub fn len(&self, samples: usize) -> usize {
        samples.div_ceil(self.batch_size)
    }

    // Build every batch of one epoch. The index order is drawn up front so the batches can be
    // produced lazily while still sharing the caller's rng for augmentation.
    pub fn batches<'a, R: Rng + ?Sized>(
        self,
        samples: &'a [Sample],
        rng: &'a mut R,
    ) -> impl Iterator<Item = Batch> + 'a {
        let mut order: Vec<usize> = (0..samples.len()).collect();
        if self.shuffle {
            order.shuffle(rng);
        }

        let chunks: Vec<Vec<usize>> = order
            .into_iter()
            .chunks(self.batch_size)
            .into_iter()
            .map(|chunk| chunk.collect())
            .collect();

        chunks.into_iter().map(move |indices| {
            let batch: Vec<&Sample> = indices.iter().map(|&index| &samples[index]).collect();
            if self.augment {
                collate(&batch, |image| train_transform(image, rng))
            } else {
                collate(&batch, test_transform)
            }
        })
    }
}

fn collate(
    samples: &[&Sample],
    mut transform: impl FnMut(ArrayView3<u8>) -> Array3<f32>,
) -> Batch {
    let images: Vec<Array3<f32>> = samples
        .iter()
        .map(|sample| transform(sample.image.view()))
        .collect();
    let views: Vec<_> = images.iter().map(|image| image.view()).collect();

    Batch {
        // Every image shares the same (3, 32, 32) shape, so stacking cannot fail.
        images: stack(Axis(0), &views).expect("images in a batch share one shape"),
        labels: samples.iter().map(|sample| usize::from(sample.label)).collect(),
    }
}

// Batch a list of samples in their given order without augmentation.
pub fn collate_samples(samples: &[&Sample]) -> Batch {
    collate(samples, test_transform)
}
