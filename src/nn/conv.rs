use ndarray::{Array2, Array3, Array4, ArrayD, ArrayView3, Axis, Ix4};
use ndarray_rand::rand::Rng;

use super::{Layer, MISSING_CACHE, Parameter, view1, view4};

// 2D convolution with a square kernel, stride 1 and symmetric zero padding. Input and output are
// [batch, channels, rows, columns].
//
// Each image is unrolled into a column matrix (one column per output pixel, one row per
// kernel tap), which turns the convolution into a single matrix product with the weights viewed
// as [out_channels, in_channels * kernel * kernel].
pub struct Conv2d {
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    padding: usize,
    weight: Parameter,
    bias: Parameter,
    cache: Option<ConvCache>,
}

struct ConvCache {
    columns: Vec<Array2<f32>>,
    input_dim: (usize, usize, usize, usize),
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        padding: usize,
        rng: &mut R,
    ) -> Conv2d {
        let fan_in = in_channels * kernel * kernel;
        Conv2d {
            in_channels,
            out_channels,
            kernel,
            padding,
            weight: Parameter::fan_in_uniform(
                &[out_channels, in_channels, kernel, kernel],
                fan_in,
                rng,
            ),
            bias: Parameter::fan_in_uniform(&[out_channels], fan_in, rng),
            cache: None,
        }
    }

    pub fn output_size(&self, input_size: usize) -> usize {
        input_size + 2 * self.padding + 1 - self.kernel
    }

    fn weight_matrix(&self) -> Array2<f32> {
        let taps = self.in_channels * self.kernel * self.kernel;
        view4(&self.weight.value)
            .to_shape((self.out_channels, taps))
            .expect("conv weight has out_channels * taps elements")
            .into_owned()
    }
}

impl Layer for Conv2d {
    fn forward(&mut self, input: ArrayD<f32>, train: bool) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("conv layer takes [batch, channels, rows, columns]");
        let (batch, channels, height, width) = input.dim();
        assert_eq!(channels, self.in_channels, "conv input channel mismatch");

        let (out_h, out_w) = (self.output_size(height), self.output_size(width));
        let weights = self.weight_matrix();
        let bias = view1(&self.bias.value).insert_axis(Axis(1));

        let mut output = Array4::<f32>::zeros((batch, self.out_channels, out_h, out_w));
        let mut columns = Vec::with_capacity(if train { batch } else { 0 });
        for (image, mut out) in input.outer_iter().zip(output.outer_iter_mut()) {
            let cols = im2col(image, self.kernel, self.padding);
            let result = weights.dot(&cols) + &bias;
            out.assign(
                &result
                    .to_shape((self.out_channels, out_h, out_w))
                    .expect("one column per output pixel"),
            );
            if train {
                columns.push(cols);
            }
        }

        if train {
            self.cache = Some(ConvCache {
                columns,
                input_dim: (batch, channels, height, width),
            });
        }
        output.into_dyn()
    }

    fn backward(&mut self, grad_output: ArrayD<f32>) -> ArrayD<f32> {
        let cache = self.cache.take().expect(MISSING_CACHE);
        let grad_output = grad_output
            .into_dimensionality::<Ix4>()
            .expect("conv gradient is [batch, channels, rows, columns]");
        let (_, _, out_h, out_w) = grad_output.dim();
        let (batch, channels, height, width) = cache.input_dim;

        let weights = self.weight_matrix();
        let mut grad_weights = Array2::<f32>::zeros(weights.raw_dim());
        let mut grad_input = Array4::<f32>::zeros((batch, channels, height, width));

        for ((grad, cols), mut grad_image) in grad_output
            .outer_iter()
            .zip(&cache.columns)
            .zip(grad_input.outer_iter_mut())
        {
            let grad = grad
                .to_shape((self.out_channels, out_h * out_w))
                .expect("gradient matches output shape");
            grad_weights += &grad.dot(&cols.t());
            self.bias.grad += &grad.sum_axis(Axis(1)).into_dyn();
            let grad_cols = weights.t().dot(&grad);
            grad_image.assign(&col2im(
                &grad_cols,
                (channels, height, width),
                self.kernel,
                self.padding,
            ));
        }

        self.weight.grad += &grad_weights
            .to_shape(self.weight.value.raw_dim())
            .expect("weight gradient has the weight's element count");
        grad_input.into_dyn()
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }

    fn describe(&self) -> String {
        format!(
            "Conv2d({} -> {}, kernel {}, padding {})",
            self.in_channels, self.out_channels, self.kernel, self.padding
        )
    }
}

// Row index of a kernel tap in the column matrix.
fn tap(channel: usize, ki: usize, kj: usize, kernel: usize) -> usize {
    (channel * kernel + ki) * kernel + kj
}

fn im2col(image: ArrayView3<f32>, kernel: usize, padding: usize) -> Array2<f32> {
    let (channels, height, width) = image.dim();
    let out_h = height + 2 * padding + 1 - kernel;
    let out_w = width + 2 * padding + 1 - kernel;
    let mut cols = Array2::<f32>::zeros((channels * kernel * kernel, out_h * out_w));

    for c in 0..channels {
        for ki in 0..kernel {
            for kj in 0..kernel {
                let row = tap(c, ki, kj, kernel);
                for oi in 0..out_h {
                    // Coordinates in the padded image; anything outside the source is zero.
                    let i = oi + ki;
                    if i < padding || i >= height + padding {
                        continue;
                    }
                    for oj in 0..out_w {
                        let j = oj + kj;
                        if j < padding || j >= width + padding {
                            continue;
                        }
                        cols[[row, oi * out_w + oj]] = image[[c, i - padding, j - padding]];
                    }
                }
            }
        }
    }
    cols
}

// Adjoint of `im2col`: scatter-add every column entry back onto the pixel it was read from.
fn col2im(
    cols: &Array2<f32>,
    (channels, height, width): (usize, usize, usize),
    kernel: usize,
    padding: usize,
) -> Array3<f32> {
    let out_h = height + 2 * padding + 1 - kernel;
    let out_w = width + 2 * padding + 1 - kernel;
    let mut image = Array3::<f32>::zeros((channels, height, width));

    for c in 0..channels {
        for ki in 0..kernel {
            for kj in 0..kernel {
                let row = tap(c, ki, kj, kernel);
                for oi in 0..out_h {
                    let i = oi + ki;
                    if i < padding || i >= height + padding {
                        continue;
                    }
                    for oj in 0..out_w {
                        let j = oj + kj;
                        if j < padding || j >= width + padding {
                            continue;
                        }
                        image[[c, i - padding, j - padding]] += cols[[row, oi * out_w + oj]];
                    }
                }
            }
        }
    }
    image
}
