use ndarray::{Array2, Axis, concatenate, s};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::duration_model::layers::{Param, sigmoid, sum_rows};
use crate::duration_model::model_config::RnnType;
use crate::errors::ModelError;

/// Input kernel, recurrent kernel and bias of one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Gate {
    kernel: Param,
    recurrent: Param,
    bias: Param,
}

impl Gate {
    fn new(inputs: usize, units: usize, bias_fill: f64, rng: &mut StdRng) -> Self {
        Gate {
            kernel: Param::glorot(inputs, units, rng),
            recurrent: Param::glorot(units, units, rng),
            bias: Param::row(units, bias_fill),
        }
    }

    fn input_part(&self, x: &Array2<f64>) -> Array2<f64> {
        x.dot(&self.kernel.value) + &self.bias.value
    }

    fn recurrent_part(&self, h: &Array2<f64>) -> Array2<f64> {
        h.dot(&self.recurrent.value)
    }

    fn backward_input(&mut self, x: &Array2<f64>, delta: &Array2<f64>) -> Array2<f64> {
        self.kernel.accumulate(&x.t().dot(delta));
        self.bias.accumulate(&sum_rows(delta));
        delta.dot(&self.kernel.value.t())
    }

    fn backward_recurrent(&mut self, h: &Array2<f64>, delta: &Array2<f64>) -> Array2<f64> {
        self.recurrent.accumulate(&h.t().dot(delta));
        delta.dot(&self.recurrent.value.t())
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.kernel, &mut self.recurrent, &mut self.bias]
    }
}

/// GRU with the reset gate applied after the recurrent matmul:
///
/// ```text
/// z  = σ(x·Wz + h·Uz + bz)
/// r  = σ(x·Wr + h·Ur + br)
/// n  = tanh(x·Wn + bn + r ⊙ (h·Un + bhn))
/// h' = (1 - z) ⊙ n + z ⊙ h
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GruCell {
    update: Gate,
    reset: Gate,
    candidate: Gate,
    candidate_recurrent_bias: Param,
}

pub struct GruStep {
    x: Array2<f64>,
    h_prev: Array2<f64>,
    z: Array2<f64>,
    r: Array2<f64>,
    n: Array2<f64>,
    hn: Array2<f64>,
}

impl GruCell {
    pub fn new(inputs: usize, units: usize, rng: &mut StdRng) -> Self {
        GruCell {
            update: Gate::new(inputs, units, 0.0, rng),
            reset: Gate::new(inputs, units, 0.0, rng),
            candidate: Gate::new(inputs, units, 0.0, rng),
            candidate_recurrent_bias: Param::row(units, 0.0),
        }
    }

    fn units(&self) -> usize {
        self.update.bias.value.ncols()
    }

    fn step(&self, x: &Array2<f64>, h: &Array2<f64>) -> (Array2<f64>, GruStep) {
        let z = (self.update.input_part(x) + self.update.recurrent_part(h)).mapv_into(sigmoid);
        let r = (self.reset.input_part(x) + self.reset.recurrent_part(h)).mapv_into(sigmoid);
        let hn = self.candidate.recurrent_part(h) + &self.candidate_recurrent_bias.value;
        let n = (self.candidate.input_part(x) + &r * &hn).mapv_into(f64::tanh);
        let h_new = (1.0 - &z) * &n + &z * h;
        (h_new, GruStep { x: x.clone(), h_prev: h.clone(), z, r, n, hn })
    }

    fn step_backward(&mut self, step: &GruStep, dh: &Array2<f64>) -> (Array2<f64>, Array2<f64>) {
        let dn = dh * &(1.0 - &step.z);
        let dz = dh * &(&step.h_prev - &step.n);
        let mut dh_prev = dh * &step.z;

        let da_n = dn * &step.n.mapv(|v| 1.0 - v * v);
        let mut dx = self.candidate.backward_input(&step.x, &da_n);
        let dr = &da_n * &step.hn;
        let dhn = &da_n * &step.r;
        self.candidate_recurrent_bias.accumulate(&sum_rows(&dhn));
        dh_prev += &self.candidate.backward_recurrent(&step.h_prev, &dhn);

        let da_z = dz * &step.z.mapv(|v| v * (1.0 - v));
        dx += &self.update.backward_input(&step.x, &da_z);
        dh_prev += &self.update.backward_recurrent(&step.h_prev, &da_z);

        let da_r = dr * &step.r.mapv(|v| v * (1.0 - v));
        dx += &self.reset.backward_input(&step.x, &da_r);
        dh_prev += &self.reset.backward_recurrent(&step.h_prev, &da_r);

        (dx, dh_prev)
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.update.params_mut();
        params.extend(self.reset.params_mut());
        params.extend(self.candidate.params_mut());
        params.push(&mut self.candidate_recurrent_bias);
        params
    }
}

/// LSTM with the forget-gate bias initialised to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmCell {
    input: Gate,
    forget: Gate,
    cell: Gate,
    output: Gate,
}

pub struct LstmStep {
    x: Array2<f64>,
    h_prev: Array2<f64>,
    c_prev: Array2<f64>,
    i: Array2<f64>,
    f: Array2<f64>,
    g: Array2<f64>,
    o: Array2<f64>,
    c_tanh: Array2<f64>,
}

impl LstmCell {
    pub fn new(inputs: usize, units: usize, rng: &mut StdRng) -> Self {
        LstmCell {
            input: Gate::new(inputs, units, 0.0, rng),
            forget: Gate::new(inputs, units, 1.0, rng),
            cell: Gate::new(inputs, units, 0.0, rng),
            output: Gate::new(inputs, units, 0.0, rng),
        }
    }

    fn units(&self) -> usize {
        self.input.bias.value.ncols()
    }

    fn step(&self, x: &Array2<f64>, h: &Array2<f64>, c: &Array2<f64>) -> (Array2<f64>, Array2<f64>, LstmStep) {
        let gate = |g: &Gate| g.input_part(x) + g.recurrent_part(h);
        let i = gate(&self.input).mapv_into(sigmoid);
        let f = gate(&self.forget).mapv_into(sigmoid);
        let g = gate(&self.cell).mapv_into(f64::tanh);
        let o = gate(&self.output).mapv_into(sigmoid);
        let c_new = &f * c + &i * &g;
        let c_tanh = c_new.mapv(f64::tanh);
        let h_new = &o * &c_tanh;
        let step = LstmStep { x: x.clone(), h_prev: h.clone(), c_prev: c.clone(), i, f, g, o, c_tanh };
        (h_new, c_new, step)
    }

    /// Returns `(dx, dh_prev, dc_prev)`.
    fn step_backward(
        &mut self,
        step: &LstmStep,
        dh: &Array2<f64>,
        dc_next: &Array2<f64>,
    ) -> (Array2<f64>, Array2<f64>, Array2<f64>) {
        let d_o = dh * &step.c_tanh;
        let dc = dc_next + &(dh * &step.o * &step.c_tanh.mapv(|v| 1.0 - v * v));
        let df = &dc * &step.c_prev;
        let di = &dc * &step.g;
        let dg = &dc * &step.i;
        let dc_prev = &dc * &step.f;

        let deltas = [
            di * &step.i.mapv(|v| v * (1.0 - v)),
            df * &step.f.mapv(|v| v * (1.0 - v)),
            dg * &step.g.mapv(|v| 1.0 - v * v),
            d_o * &step.o.mapv(|v| v * (1.0 - v)),
        ];
        let mut dx = Array2::zeros(step.x.raw_dim());
        let mut dh_prev = Array2::zeros(step.h_prev.raw_dim());
        let gates = [&mut self.input, &mut self.forget, &mut self.cell, &mut self.output];
        for (gate, delta) in gates.into_iter().zip(&deltas) {
            dx += &gate.backward_input(&step.x, delta);
            dh_prev += &gate.backward_recurrent(&step.h_prev, delta);
        }
        (dx, dh_prev, dc_prev)
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.input.params_mut();
        params.extend(self.forget.params_mut());
        params.extend(self.cell.params_mut());
        params.extend(self.output.params_mut());
        params
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RecurrentCell {
    Gru(GruCell),
    Lstm(LstmCell),
}

pub enum SequenceCache {
    Gru(Vec<GruStep>),
    Lstm(Vec<LstmStep>),
}

impl RecurrentCell {
    pub fn new(rnn_type: RnnType, inputs: usize, units: usize, rng: &mut StdRng) -> Self {
        match rnn_type {
            RnnType::Gru => RecurrentCell::Gru(GruCell::new(inputs, units, rng)),
            RnnType::Lstm => RecurrentCell::Lstm(LstmCell::new(inputs, units, rng)),
        }
    }

    pub fn units(&self) -> usize {
        match self {
            RecurrentCell::Gru(cell) => cell.units(),
            RecurrentCell::Lstm(cell) => cell.units(),
        }
    }

    /// Runs over `sequence` from zero state and returns the last hidden state.
    pub fn forward(&self, sequence: &[Array2<f64>]) -> Result<(Array2<f64>, SequenceCache), ModelError> {
        let batch = sequence.first().map(|x| x.nrows()).ok_or(ModelError::EmptyTrainingSet)?;
        let mut h = Array2::zeros((batch, self.units()));
        match self {
            RecurrentCell::Gru(cell) => {
                let mut steps = Vec::with_capacity(sequence.len());
                for x in sequence {
                    let (h_new, step) = cell.step(x, &h);
                    steps.push(step);
                    h = h_new;
                }
                Ok((h, SequenceCache::Gru(steps)))
            }
            RecurrentCell::Lstm(cell) => {
                let mut c = Array2::zeros((batch, self.units()));
                let mut steps = Vec::with_capacity(sequence.len());
                for x in sequence {
                    let (h_new, c_new, step) = cell.step(x, &h, &c);
                    steps.push(step);
                    h = h_new;
                    c = c_new;
                }
                Ok((h, SequenceCache::Lstm(steps)))
            }
        }
    }

    /// Backpropagates through time from the gradient on the last hidden
    /// state. Returns the gradient for each input step.
    pub fn backward(&mut self, cache: &SequenceCache, grad: &Array2<f64>) -> Result<Vec<Array2<f64>>, ModelError> {
        let mut dh = grad.clone();
        match (self, cache) {
            (RecurrentCell::Gru(cell), SequenceCache::Gru(steps)) => {
                let mut dxs = Vec::with_capacity(steps.len());
                for step in steps.iter().rev() {
                    let (dx, dh_prev) = cell.step_backward(step, &dh);
                    dxs.push(dx);
                    dh = dh_prev;
                }
                dxs.reverse();
                Ok(dxs)
            }
            (RecurrentCell::Lstm(cell), SequenceCache::Lstm(steps)) => {
                let mut dc = Array2::zeros(grad.raw_dim());
                let mut dxs = Vec::with_capacity(steps.len());
                for step in steps.iter().rev() {
                    let (dx, dh_prev, dc_prev) = cell.step_backward(step, &dh, &dc);
                    dxs.push(dx);
                    dh = dh_prev;
                    dc = dc_prev;
                }
                dxs.reverse();
                Ok(dxs)
            }
            _ => Err(ModelError::InvalidConfig("sequence cache does not match cell type".to_string())),
        }
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        match self {
            RecurrentCell::Gru(cell) => cell.params_mut(),
            RecurrentCell::Lstm(cell) => cell.params_mut(),
        }
    }
}

/// A recurrent cell, optionally paired with a second cell reading the
/// sequence in reverse. Outputs are concatenated forward-then-backward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrentEncoder {
    forward: RecurrentCell,
    backward: Option<RecurrentCell>,
}

pub struct RecurrentCache {
    forward: SequenceCache,
    backward: Option<SequenceCache>,
}

impl RecurrentEncoder {
    pub fn new(rnn_type: RnnType, bidirectional: bool, inputs: usize, units: usize, rng: &mut StdRng) -> Self {
        let forward = RecurrentCell::new(rnn_type, inputs, units, rng);
        let backward = bidirectional.then(|| RecurrentCell::new(rnn_type, inputs, units, rng));
        RecurrentEncoder { forward, backward }
    }

    pub fn output_width(&self) -> usize {
        self.forward.units() * if self.backward.is_some() { 2 } else { 1 }
    }

    pub fn forward(&self, sequence: &[Array2<f64>]) -> Result<(Array2<f64>, RecurrentCache), ModelError> {
        let (h_forward, forward_cache) = self.forward.forward(sequence)?;
        match &self.backward {
            None => Ok((h_forward, RecurrentCache { forward: forward_cache, backward: None })),
            Some(cell) => {
                let reversed: Vec<Array2<f64>> = sequence.iter().rev().cloned().collect();
                let (h_backward, backward_cache) = cell.forward(&reversed)?;
                let output = concatenate(Axis(1), &[h_forward.view(), h_backward.view()])?;
                Ok((output, RecurrentCache { forward: forward_cache, backward: Some(backward_cache) }))
            }
        }
    }

    pub fn backward(&mut self, cache: &RecurrentCache, grad: &Array2<f64>) -> Result<Vec<Array2<f64>>, ModelError> {
        let units = self.forward.units();
        let mut dxs = self.forward.backward(&cache.forward, &grad.slice(s![.., ..units]).to_owned())?;
        if let (Some(cell), Some(backward_cache)) = (self.backward.as_mut(), cache.backward.as_ref()) {
            let reversed = cell.backward(backward_cache, &grad.slice(s![.., units..]).to_owned())?;
            for (dx, dx_reversed) in dxs.iter_mut().zip(reversed.iter().rev()) {
                *dx += dx_reversed;
            }
        }
        Ok(dxs)
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.forward.params_mut();
        if let Some(cell) = self.backward.as_mut() {
            params.extend(cell.params_mut());
        }
        params
    }
}
