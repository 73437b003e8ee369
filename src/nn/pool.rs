use ndarray::{Array4, ArrayD, Ix4};

use super::{Layer, MISSING_CACHE};

// 2x2 max pooling with stride 2. An odd trailing row or column is dropped.
pub struct MaxPool2d {
    cache: Option<PoolCache>,
}

struct PoolCache {
    // For every output cell, the (row, column) offset inside its window that held the maximum.
    winners: Array4<(u8, u8)>,
    input_dim: (usize, usize, usize, usize),
}

impl MaxPool2d {
    pub fn new() -> MaxPool2d {
        MaxPool2d { cache: None }
    }
}

impl Default for MaxPool2d {
    fn default() -> Self {
        MaxPool2d::new()
    }
}

impl Layer for MaxPool2d {
    fn forward(&mut self, input: ArrayD<f32>, train: bool) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("max pool takes [batch, channels, rows, columns]");
        let (batch, channels, height, width) = input.dim();
        let out_dim = (batch, channels, height / 2, width / 2);

        let mut winners = Array4::from_elem(out_dim, (0u8, 0u8));
        let output = Array4::from_shape_fn(out_dim, |(n, c, i, j)| {
            let mut best = f32::NEG_INFINITY;
            for di in 0..2 {
                for dj in 0..2 {
                    let value = input[[n, c, 2 * i + di, 2 * j + dj]];
                    if value > best {
                        best = value;
                        winners[[n, c, i, j]] = (di as u8, dj as u8);
                    }
                }
            }
            best
        });

        if train {
            self.cache = Some(PoolCache {
                winners,
                input_dim: (batch, channels, height, width),
            });
        }
        output.into_dyn()
    }

    fn backward(&mut self, grad_output: ArrayD<f32>) -> ArrayD<f32> {
        let cache = self.cache.take().expect(MISSING_CACHE);
        let grad_output = grad_output
            .into_dimensionality::<Ix4>()
            .expect("max pool gradient is [batch, channels, rows, columns]");

        // Only the winning input of each window receives gradient.
        let mut grad_input = Array4::<f32>::zeros(cache.input_dim);
        for ((n, c, i, j), &(di, dj)) in cache.winners.indexed_iter() {
            grad_input[[n, c, 2 * i + usize::from(di), 2 * j + usize::from(dj)]] =
                grad_output[[n, c, i, j]];
        }
        grad_input.into_dyn()
    }

    fn describe(&self) -> String {
        "MaxPool2d(2x2)".to_string()
    }
}
