use ndarray::{Array2, Zip};

use crate::duration_model::layers::Param;

/// Adam optimizer. Moment buffers are indexed by parameter order, so the
/// caller must pass parameters in the same order on every step.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    iterations: i32,
    first_moments: Vec<Array2<f64>>,
    second_moments: Vec<Array2<f64>>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            iterations: 0,
            first_moments: Vec::new(),
            second_moments: Vec::new(),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    pub fn step(&mut self, params: Vec<&mut Param>) {
        if self.first_moments.len() != params.len() {
            self.first_moments = params.iter().map(|p| Array2::zeros(p.value.raw_dim())).collect();
            self.second_moments = self.first_moments.clone();
        }
        self.iterations += 1;
        let correction1 = 1.0 - self.beta1.powi(self.iterations);
        let correction2 = 1.0 - self.beta2.powi(self.iterations);
        let step_size = self.learning_rate * correction2.sqrt() / correction1;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        for ((param, m), v) in params.into_iter().zip(&mut self.first_moments).zip(&mut self.second_moments) {
            if param.grad().raw_dim() != param.value.raw_dim() {
                continue;
            }
            let grad = param.grad().clone();
            Zip::from(&mut param.value).and(&mut *m).and(&mut *v).and(&grad).for_each(|w, m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                *w -= step_size * *m / (v.sqrt() + epsilon);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_first_step_moves_each_weight_by_learning_rate() {
        let mut param = Param::row(2, 1.0);
        param.accumulate(&array![[0.5, -2.0]]);
        let mut adam = Adam::new(0.01);
        adam.step(vec![&mut param]);

        assert!((param.value[[0, 0]] - 0.99).abs() < 1e-6);
        assert!((param.value[[0, 1]] - 1.01).abs() < 1e-6);
    }

    #[test]
    fn test_minimizes_quadratic() {
        let mut param = Param::row(1, 5.0);
        let mut adam = Adam::new(0.1);
        for _ in 0..500 {
            param.zero_grad();
            let grad = param.value.mapv(|w| 2.0 * (w - 2.0));
            param.accumulate(&grad);
            adam.step(vec![&mut param]);
        }
        assert!((param.value[[0, 0]] - 2.0).abs() < 5e-2);
    }
}
