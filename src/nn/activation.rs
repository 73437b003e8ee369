use ndarray::{ArrayD, IxDyn, Zip};

use super::{Layer, MISSING_CACHE};

pub struct Relu {
    // 1.0 where the input was positive, 0.0 elsewhere.
    mask: Option<ArrayD<f32>>,
}

impl Relu {
    pub fn new() -> Relu {
        Relu { mask: None }
    }
}

impl Default for Relu {
    fn default() -> Self {
        Relu::new()
    }
}

impl Layer for Relu {
    fn forward(&mut self, mut input: ArrayD<f32>, train: bool) -> ArrayD<f32> {
        if train {
            self.mask = Some(input.mapv(|x| if x > 0.0 { 1.0 } else { 0.0 }));
        }
        input.mapv_inplace(|x| x.max(0.0));
        input
    }

    fn backward(&mut self, mut grad_output: ArrayD<f32>) -> ArrayD<f32> {
        let mask = self.mask.take().expect(MISSING_CACHE);
        Zip::from(&mut grad_output)
            .and(&mask)
            .for_each(|grad, &keep| *grad *= keep);
        grad_output
    }

    fn describe(&self) -> String {
        "ReLU".to_string()
    }
}

// Collapses everything after the batch axis: [batch, d1, d2, ...] -> [batch, d1 * d2 * ...].
pub struct Flatten {
    input_shape: Option<Vec<usize>>,
}

impl Flatten {
    pub fn new() -> Flatten {
        Flatten { input_shape: None }
    }
}

impl Default for Flatten {
    fn default() -> Self {
        Flatten::new()
    }
}

impl Layer for Flatten {
    fn forward(&mut self, input: ArrayD<f32>, train: bool) -> ArrayD<f32> {
        let shape = input.shape().to_vec();
        let batch = shape[0];
        let features = shape[1..].iter().product::<usize>();
        if train {
            self.input_shape = Some(shape);
        }
        input
            .to_shape(IxDyn(&[batch, features]))
            .expect("flatten preserves the element count")
            .into_owned()
    }

    fn backward(&mut self, grad_output: ArrayD<f32>) -> ArrayD<f32> {
        let shape = self.input_shape.take().expect(MISSING_CACHE);
        grad_output
            .to_shape(IxDyn(&shape))
            .expect("flatten gradient preserves the element count")
            .into_owned()
    }

    fn describe(&self) -> String {
        "Flatten".to_string()
    }
}
