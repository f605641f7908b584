use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// A trainable weight matrix and its accumulated gradient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub value: Array2<f64>,
    #[serde(skip)]
    grad: Array2<f64>,
    /// Kernels take part in the L2 penalty; biases and norm scales do not.
    pub regularized: bool,
}

impl Param {
    /// Glorot-uniform kernel of shape `(fan_in, fan_out)`.
    pub fn glorot(fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
        let value = Array2::from_shape_fn((fan_in, fan_out), |_| rng.random_range(-limit..limit));
        Param { grad: Array2::zeros(value.raw_dim()), value, regularized: true }
    }

    /// Row vector `(1, width)` filled with `fill`, excluded from L2.
    pub fn row(width: usize, fill: f64) -> Self {
        let value = Array2::from_elem((1, width), fill);
        Param { grad: Array2::zeros(value.raw_dim()), value, regularized: false }
    }

    pub fn grad(&self) -> &Array2<f64> {
        &self.grad
    }

    pub fn zero_grad(&mut self) {
        self.grad = Array2::zeros(self.value.raw_dim());
    }

    pub fn accumulate(&mut self, grad: &Array2<f64>) {
        if self.grad.raw_dim() != self.value.raw_dim() {
            self.zero_grad();
        }
        self.grad += grad;
    }

    /// Adds the gradient of `l2 * sum(w^2)`.
    pub fn add_l2_grad(&mut self, l2: f64) {
        if self.regularized && l2 > 0.0 {
            if self.grad.raw_dim() != self.value.raw_dim() {
                self.zero_grad();
            }
            self.grad.scaled_add(2.0 * l2, &self.value);
        }
    }

    pub fn l2_penalty(&self, l2: f64) -> f64 {
        if self.regularized { l2 * self.value.iter().map(|w| w * w).sum::<f64>() } else { 0.0 }
    }
}

pub(crate) fn sum_rows(x: &Array2<f64>) -> Array2<f64> {
    x.sum_axis(Axis(0)).insert_axis(Axis(0))
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Tanh,
    Sigmoid,
    Linear,
}

impl Activation {
    pub fn apply(self, z: Array2<f64>) -> Array2<f64> {
        match self {
            Activation::Relu => z.mapv_into(|v| v.max(0.0)),
            Activation::Tanh => z.mapv_into(f64::tanh),
            Activation::Sigmoid => z.mapv_into(sigmoid),
            Activation::Linear => z,
        }
    }

    /// Derivative expressed through the activation's output.
    pub fn derivative(self, output: &Array2<f64>) -> Array2<f64> {
        match self {
            Activation::Relu => output.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
            Activation::Tanh => output.mapv(|v| 1.0 - v * v),
            Activation::Sigmoid => output.mapv(|v| v * (1.0 - v)),
            Activation::Linear => Array2::ones(output.raw_dim()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    pub kernel: Param,
    pub bias: Param,
    pub activation: Activation,
}

pub struct DenseCache {
    input: Array2<f64>,
    output: Array2<f64>,
}

impl Dense {
    pub fn new(inputs: usize, units: usize, activation: Activation, regularized: bool, rng: &mut StdRng) -> Self {
        let mut kernel = Param::glorot(inputs, units, rng);
        kernel.regularized = regularized;
        Dense { kernel, bias: Param::row(units, 0.0), activation }
    }

    pub fn units(&self) -> usize {
        self.kernel.value.ncols()
    }

    pub fn infer(&self, x: &Array2<f64>) -> Array2<f64> {
        self.activation.apply(x.dot(&self.kernel.value) + &self.bias.value)
    }

    pub fn forward(&self, x: Array2<f64>) -> (Array2<f64>, DenseCache) {
        let output = self.infer(&x);
        (output.clone(), DenseCache { input: x, output })
    }

    /// Accumulates parameter gradients and returns the gradient w.r.t. the input.
    pub fn backward(&mut self, cache: &DenseCache, grad: &Array2<f64>) -> Array2<f64> {
        let delta = grad * &self.activation.derivative(&cache.output);
        self.kernel.accumulate(&cache.input.t().dot(&delta));
        self.bias.accumulate(&sum_rows(&delta));
        delta.dot(&self.kernel.value.t())
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.kernel, &mut self.bias]
    }
}

/// Batch normalization with moving statistics for inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm {
    pub gamma: Param,
    pub beta: Param,
    moving_mean: Array1<f64>,
    moving_var: Array1<f64>,
    momentum: f64,
    epsilon: f64,
}

pub struct BatchNormCache {
    x_hat: Array2<f64>,
    inv_std: Array1<f64>,
}

impl BatchNorm {
    pub fn new(width: usize) -> Self {
        BatchNorm {
            gamma: Param::row(width, 1.0),
            beta: Param::row(width, 0.0),
            moving_mean: Array1::zeros(width),
            moving_var: Array1::ones(width),
            momentum: 0.99,
            epsilon: 1e-3,
        }
    }

    pub fn infer(&self, x: &Array2<f64>) -> Array2<f64> {
        let inv_std = self.moving_var.mapv(|v| 1.0 / (v + self.epsilon).sqrt());
        (x - &self.moving_mean) * &inv_std * &self.gamma.value + &self.beta.value
    }

    /// Normalizes with batch statistics and updates the moving averages.
    pub fn forward(&mut self, x: &Array2<f64>) -> (Array2<f64>, BatchNormCache) {
        let n = x.nrows().max(1) as f64;
        let mean = x.sum_axis(Axis(0)) / n;
        let centered = x - &mean;
        let var = centered.mapv(|v| v * v).sum_axis(Axis(0)) / n;
        let inv_std = var.mapv(|v| 1.0 / (v + self.epsilon).sqrt());
        let x_hat = centered * &inv_std;

        self.moving_mean = &self.moving_mean * self.momentum + &mean * (1.0 - self.momentum);
        self.moving_var = &self.moving_var * self.momentum + &var * (1.0 - self.momentum);

        let output = &x_hat * &self.gamma.value + &self.beta.value;
        (output, BatchNormCache { x_hat, inv_std })
    }

    pub fn backward(&mut self, cache: &BatchNormCache, grad: &Array2<f64>) -> Array2<f64> {
        let n = grad.nrows().max(1) as f64;
        self.gamma.accumulate(&sum_rows(&(grad * &cache.x_hat)));
        self.beta.accumulate(&sum_rows(grad));

        let dx_hat = grad * &self.gamma.value;
        let sum_dx_hat = dx_hat.sum_axis(Axis(0));
        let sum_dx_hat_x_hat = (&dx_hat * &cache.x_hat).sum_axis(Axis(0));
        (dx_hat * n - &sum_dx_hat - &cache.x_hat * &sum_dx_hat_x_hat) * &cache.inv_std / n
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

/// Inverted dropout: surviving units are scaled by `1 / (1 - rate)` at train
/// time, so inference is the identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Dropout {
    pub rate: f64,
}

impl Dropout {
    pub fn forward(&self, x: Array2<f64>, rng: &mut StdRng) -> (Array2<f64>, Array2<f64>) {
        if self.rate <= 0.0 {
            let mask = Array2::ones(x.raw_dim());
            return (x, mask);
        }
        let keep = 1.0 - self.rate;
        let mask = Array2::from_shape_fn(x.raw_dim(), |_| if rng.random::<f64>() < keep { 1.0 / keep } else { 0.0 });
        (x * &mask, mask)
    }

    pub fn backward(&self, mask: &Array2<f64>, grad: &Array2<f64>) -> Array2<f64> {
        grad * mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    fn numeric_grad(f: impl Fn(&Array2<f64>) -> f64, x: &Array2<f64>) -> Array2<f64> {
        let h = 1e-6;
        let mut grad = Array2::zeros(x.raw_dim());
        for idx in 0..x.len() {
            let (r, c) = (idx / x.ncols(), idx % x.ncols());
            let mut plus = x.clone();
            plus[[r, c]] += h;
            let mut minus = x.clone();
            minus[[r, c]] -= h;
            grad[[r, c]] = (f(&plus) - f(&minus)) / (2.0 * h);
        }
        grad
    }

    #[test]
    fn test_dense_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut dense = Dense::new(3, 2, Activation::Tanh, true, &mut rng);
        let x = array![[0.5, -1.0, 0.25], [1.5, 0.3, -0.7]];

        let (_, cache) = dense.forward(x.clone());
        let input_grad = dense.backward(&cache, &Array2::ones((2, 2)));

        let candidate = dense.clone();
        let expected = numeric_grad(|x| candidate.infer(x).sum(), &x);
        for (a, b) in input_grad.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn test_batch_norm_backward_matches_finite_differences() {
        let x = array![[0.5, 2.0], [1.5, -1.0], [-0.5, 0.0]];
        let weights = array![[1.0, -2.0], [0.5, 3.0], [-1.5, 1.0]];
        let mut norm = BatchNorm::new(2);
        norm.gamma.value = array![[1.3, 0.7]];

        let (_, cache) = norm.forward(&x);
        let input_grad = norm.backward(&cache, &weights);

        let expected = numeric_grad(
            |x| {
                let mut candidate = BatchNorm::new(2);
                candidate.gamma.value = array![[1.3, 0.7]];
                (candidate.forward(x).0 * &weights).sum()
            },
            &x,
        );
        for (a, b) in input_grad.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn test_dropout_preserves_expected_scale() {
        let mut rng = StdRng::seed_from_u64(11);
        let dropout = Dropout { rate: 0.5 };
        let (out, mask) = dropout.forward(Array2::ones((200, 50)), &mut rng);
        assert!(mask.iter().all(|&m| m == 0.0 || m == 2.0));
        assert!((out.mean().unwrap() - 1.0).abs() < 0.1);
    }

    #[test]
    fn test_l2_grad_skips_biases() {
        let mut bias = Param::row(3, 0.5);
        bias.add_l2_grad(0.1);
        assert!(bias.grad().iter().all(|&g| g == 0.0));
        assert_eq!(bias.l2_penalty(0.1), 0.0);

        let mut rng = StdRng::seed_from_u64(1);
        let mut kernel = Param::glorot(2, 2, &mut rng);
        kernel.add_l2_grad(0.1);
        assert_eq!(kernel.grad(), &(kernel.value.clone() * 0.2));
    }
}
