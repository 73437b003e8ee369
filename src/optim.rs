// Parameter update rules.

use ndarray::{ArrayD, Zip};

use crate::nn::Parameter;

pub trait Optimizer {
    // Apply one update to `params` using their accumulated gradients.
    //
    // The parameter list must come in the same order on every call; per-parameter state such as
    // momentum buffers is matched up by position.
    fn step(&mut self, params: Vec<&mut Parameter>);

    fn lr(&self) -> f32;

    fn set_lr(&mut self, lr: f32);
}

// SGD with momentum and L2 weight decay.
//
// For each parameter `p` with gradient `g`:
//
// ```text
// g = g + weight_decay * p
// v = momentum * v + g        (v = g on the first step)
// p = p - lr * v
// ```
pub struct Sgd {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    velocities: Vec<Option<ArrayD<f32>>>,
}

impl Sgd {
    pub fn new(lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            velocities: Vec::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: Vec<&mut Parameter>) {
        if self.velocities.len() != params.len() {
            self.velocities = params.iter().map(|_| None).collect();
        }

        let (lr, momentum, weight_decay) = (self.lr, self.momentum, self.weight_decay);
        for (param, velocity) in params.into_iter().zip(self.velocities.iter_mut()) {
            let mut grad = param.grad.clone();
            if weight_decay != 0.0 {
                grad.scaled_add(weight_decay, &param.value);
            }

            let direction = if momentum != 0.0 {
                match velocity {
                    Some(v) => {
                        Zip::from(&mut *v)
                            .and(&grad)
                            .for_each(|v, &g| *v = momentum * *v + g);
                        v.clone()
                    }
                    None => {
                        *velocity = Some(grad.clone());
                        grad
                    }
                }
            } else {
                grad
            };

            param.value.scaled_add(-lr, &direction);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayD, IxDyn};

    fn param(value: f32, grad: f32) -> Parameter {
        let mut p = Parameter::new(ArrayD::from_elem(IxDyn(&[1]), value));
        p.grad.fill(grad);
        p
    }

    #[test]
    fn plain_sgd_step() {
        let mut p = param(1.0, 0.5);
        let mut sgd = Sgd::new(0.1, 0.0, 0.0);
        sgd.step(vec![&mut p]);
        assert_abs_diff_eq!(p.value[[0]], 0.95);
    }

    #[test]
    fn momentum_accumulates_across_steps() {
        let mut p = param(1.0, 1.0);
        let mut sgd = Sgd::new(0.1, 0.9, 0.0);

        // v = 1.0, p = 1.0 - 0.1
        sgd.step(vec![&mut p]);
        assert_abs_diff_eq!(p.value[[0]], 0.9, epsilon = 1e-6);

        // v = 0.9 * 1.0 + 1.0 = 1.9, p = 0.9 - 0.19
        sgd.step(vec![&mut p]);
        assert_abs_diff_eq!(p.value[[0]], 0.71, epsilon = 1e-6);
    }

    #[test]
    fn weight_decay_pulls_towards_zero() {
        let mut p = param(2.0, 0.0);
        let mut sgd = Sgd::new(0.1, 0.9, 0.5);
        // g = 0 + 0.5 * 2.0 = 1.0, p = 2.0 - 0.1
        sgd.step(vec![&mut p]);
        assert_abs_diff_eq!(p.value[[0]], 1.9, epsilon = 1e-6);
    }

    #[test]
    fn set_lr_changes_step_size() {
        let mut p = param(0.0, 1.0);
        let mut sgd = Sgd::new(0.1, 0.0, 0.0);
        sgd.set_lr(0.01);
        assert_abs_diff_eq!(sgd.lr(), 0.01);
        sgd.step(vec![&mut p]);
        assert_abs_diff_eq!(p.value[[0]], -0.01, epsilon = 1e-7);
    }
}
