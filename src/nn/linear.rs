use ndarray::{Array2, ArrayD, Axis, Ix2};
use ndarray_rand::rand::Rng;

use super::{Layer, MISSING_CACHE, Parameter, view1, view2};

// Fully connected layer: output = input . weightᵀ + bias, with input [batch, in_features] and
// weight [out_features, in_features].
pub struct Linear {
    in_features: usize,
    out_features: usize,
    weight: Parameter,
    bias: Parameter,
    input: Option<Array2<f32>>,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Linear {
        Linear {
            in_features,
            out_features,
            weight: Parameter::fan_in_uniform(&[out_features, in_features], in_features, rng),
            bias: Parameter::fan_in_uniform(&[out_features], in_features, rng),
            input: None,
        }
    }
}

impl Layer for Linear {
    fn forward(&mut self, input: ArrayD<f32>, train: bool) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix2>()
            .expect("linear layer takes [batch, features]");
        let output = input.dot(&view2(&self.weight.value).t()) + &view1(&self.bias.value);
        if train {
            self.input = Some(input);
        }
        output.into_dyn()
    }

    fn backward(&mut self, grad_output: ArrayD<f32>) -> ArrayD<f32> {
        let input = self.input.take().expect(MISSING_CACHE);
        let grad_output = grad_output
            .into_dimensionality::<Ix2>()
            .expect("linear gradient is [batch, features]");

        self.weight.grad += &grad_output.t().dot(&input).into_dyn();
        self.bias.grad += &grad_output.sum_axis(Axis(0)).into_dyn();

        grad_output.dot(&view2(&self.weight.value)).into_dyn()
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }

    fn describe(&self) -> String {
        format!("Linear({} -> {})", self.in_features, self.out_features)
    }
}
