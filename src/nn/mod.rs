// The handful of layers the model zoo is built from.
//
// Every layer works on dynamically-shaped `f32` arrays so a network is just a `Vec` of boxed
// layers: `forward` runs them front to back, `backward` runs them back to front, each layer
// caching whatever it needs from its training-mode forward pass.

mod activation;
mod conv;
mod linear;
mod pool;

pub use activation::{Flatten, Relu};
pub use conv::Conv2d;
pub use linear::Linear;
pub use pool::MaxPool2d;

use ndarray::{ArrayD, ArrayView1, ArrayView2, ArrayView4, Ix1, Ix2, Ix4};
use ndarray_rand::{RandomExt, rand::Rng, rand_distr::Uniform};

// A trainable tensor together with the gradient accumulated for it by `backward`.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub value: ArrayD<f32>,
    pub grad: ArrayD<f32>,
}

impl Parameter {
    pub fn new(value: ArrayD<f32>) -> Parameter {
        let grad = ArrayD::zeros(value.raw_dim());
        Parameter { value, grad }
    }

    // Uniform in [-1/sqrt(fan_in), 1/sqrt(fan_in)], the default initialisation for both the
    // weights and biases of linear and convolutional layers.
    pub fn fan_in_uniform<R: Rng + ?Sized>(
        shape: &[usize],
        fan_in: usize,
        rng: &mut R,
    ) -> Parameter {
        let bound = 1.0 / (fan_in as f32).sqrt();
        Parameter::new(ArrayD::random_using(
            shape.to_vec(),
            Uniform::new_inclusive(-bound, bound),
            rng,
        ))
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

pub trait Layer: Send {
    // Compute the layer output. With `train` set the layer keeps what `backward` needs.
    fn forward(&mut self, input: ArrayD<f32>, train: bool) -> ArrayD<f32>;

    // Accumulate parameter gradients and return the gradient w.r.t. the layer input.
    //
    // Must follow a `forward` call made with `train` set.
    fn backward(&mut self, grad_output: ArrayD<f32>) -> ArrayD<f32>;

    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }

    fn describe(&self) -> String;
}

// Rank conversions. Each layer documents the rank it expects; handing it anything else is a bug
// in how the network was assembled, not a runtime condition.
pub(crate) fn view1(array: &ArrayD<f32>) -> ArrayView1<'_, f32> {
    array.view().into_dimensionality::<Ix1>().expect("rank-1 array")
}

pub(crate) fn view2(array: &ArrayD<f32>) -> ArrayView2<'_, f32> {
    array.view().into_dimensionality::<Ix2>().expect("rank-2 array")
}

pub(crate) fn view4(array: &ArrayD<f32>) -> ArrayView4<'_, f32> {
    array.view().into_dimensionality::<Ix4>().expect("rank-4 array")
}

const MISSING_CACHE: &str = "backward called without a training-mode forward pass";
