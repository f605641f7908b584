use std::path::Path;

use ndarray::{Array1, Array2, Axis, concatenate, s};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::duration_model::adam::Adam;
use crate::duration_model::layers::{Activation, BatchNorm, BatchNormCache, Dense, DenseCache, Dropout, Param};
use crate::duration_model::model_config::ModelConfig;
use crate::duration_model::recurrent::{RecurrentCache, RecurrentEncoder};
use crate::errors::{ArtifactLoadError, ModelError, PersistenceError};
use crate::feature_encoding::standard_scaler::StandardScaler;
use crate::feature_encoding::{EncodedFeatures, FeatureSchema};
use crate::utils::{read_json, write_json_atomic};

/// Predictions are floored here; a task never takes less than one hour.
pub const MIN_DURATION_HOURS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxEpochs,
    EarlyStopping,
}

/// Per-epoch record of a training run. `val_loss` is empty when no
/// validation set was given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub loss: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub learning_rate: Vec<f64>,
    pub best_epoch: usize,
    pub stop_reason: StopReason,
}

impl TrainingHistory {
    pub fn epochs_trained(&self) -> usize {
        self.loss.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HiddenBlock {
    dense: Dense,
    norm: BatchNorm,
    dropout: Dropout,
}

struct ForwardTape {
    recurrent: RecurrentCache,
    task_type: DenseCache,
    phase: DenseCache,
    hidden: Vec<(DenseCache, BatchNormCache, Array2<f64>)>,
    output: DenseCache,
}

/// Tracks epochs since the monitored loss last improved, for early stopping
/// and learning-rate reduction.
#[derive(Debug)]
struct PlateauMonitor {
    best: f64,
    stale_epochs: usize,
    stale_since_lr_change: usize,
}

impl PlateauMonitor {
    fn new() -> Self {
        PlateauMonitor { best: f64::INFINITY, stale_epochs: 0, stale_since_lr_change: 0 }
    }

    /// Returns true when `loss` is a new best.
    fn observe(&mut self, loss: f64) -> bool {
        if loss < self.best {
            self.best = loss;
            self.stale_epochs = 0;
            self.stale_since_lr_change = 0;
            true
        } else {
            self.stale_epochs += 1;
            self.stale_since_lr_change += 1;
            false
        }
    }

    fn should_stop(&self, patience: usize) -> bool {
        self.stale_epochs >= patience
    }

    fn should_reduce_lr(&mut self, patience: usize) -> bool {
        if self.stale_since_lr_change >= patience {
            self.stale_since_lr_change = 0;
            return true;
        }
        false
    }
}

/// Recurrent regressor over encoded task features.
///
/// The numeric block is fed to the recurrent encoder as a one-step sequence,
/// each one-hot block passes through its own dense branch, and the
/// concatenation runs through the dense/batch-norm/dropout stack down to a
/// single output. Targets are standardized internally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RnnEstimator {
    schema: FeatureSchema,
    config: ModelConfig,
    recurrent: RecurrentEncoder,
    task_type_branch: Dense,
    phase_branch: Dense,
    hidden: Vec<HiddenBlock>,
    output: Dense,
    target_scaler: Option<StandardScaler>,
}

fn seeded_rng(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
        None => StdRng::from_os_rng(),
    }
}

impl RnnEstimator {
    pub fn build(schema: FeatureSchema, config: ModelConfig) -> Result<Self, ModelError> {
        config.validate()?;
        let mut rng = seeded_rng(config.seed, 0);

        let recurrent =
            RecurrentEncoder::new(config.rnn_type, config.use_bidirectional, schema.numeric(), config.rnn_units, &mut rng);
        let task_type_branch = Dense::new(schema.task_type(), config.branch_units, config.activation, true, &mut rng);
        let phase_branch = Dense::new(schema.phase(), config.branch_units, config.activation, true, &mut rng);

        let mut width = recurrent.output_width() + 2 * config.branch_units;
        let mut hidden = Vec::with_capacity(config.dense_units.len());
        for &units in &config.dense_units {
            hidden.push(HiddenBlock {
                dense: Dense::new(width, units, config.activation, true, &mut rng),
                norm: BatchNorm::new(units),
                dropout: Dropout { rate: config.dropout_rate },
            });
            width = units;
        }
        let output = Dense::new(width, 1, Activation::Linear, false, &mut rng);

        tracing::debug!(%schema, rnn_type = ?config.rnn_type, bidirectional = config.use_bidirectional, "built duration model");
        Ok(RnnEstimator { schema, config, recurrent, task_type_branch, phase_branch, hidden, output, target_scaler: None })
    }

    pub fn schema(&self) -> FeatureSchema {
        self.schema
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn split(&self, x: &Array2<f64>) -> Result<(Array2<f64>, Array2<f64>, Array2<f64>), ModelError> {
        self.schema.check_width(x.ncols())?;
        Ok((
            x.slice(s![.., self.schema.numeric_range()]).to_owned(),
            x.slice(s![.., self.schema.task_type_range()]).to_owned(),
            x.slice(s![.., self.schema.phase_range()]).to_owned(),
        ))
    }

    /// Inference pass in standardized target units.
    fn infer(&self, x: &Array2<f64>) -> Result<Array2<f64>, ModelError> {
        let (numeric, task_type, phase) = self.split(x)?;
        let (recurrent, _) = self.recurrent.forward(&[numeric])?;
        let task_type = self.task_type_branch.infer(&task_type);
        let phase = self.phase_branch.infer(&phase);
        let mut activations = concatenate(Axis(1), &[recurrent.view(), task_type.view(), phase.view()])?;
        for block in &self.hidden {
            activations = block.norm.infer(&block.dense.infer(&activations));
        }
        Ok(self.output.infer(&activations))
    }

    fn forward_train(&mut self, x: &Array2<f64>, rng: &mut StdRng) -> Result<(Array2<f64>, ForwardTape), ModelError> {
        let (numeric, task_type, phase) = self.split(x)?;
        let (recurrent_out, recurrent) = self.recurrent.forward(&[numeric])?;
        let (task_type_out, task_type) = self.task_type_branch.forward(task_type);
        let (phase_out, phase) = self.phase_branch.forward(phase);
        let mut activations = concatenate(Axis(1), &[recurrent_out.view(), task_type_out.view(), phase_out.view()])?;

        let mut hidden = Vec::with_capacity(self.hidden.len());
        for block in self.hidden.iter_mut() {
            let (dense_out, dense_cache) = block.dense.forward(activations);
            let (norm_out, norm_cache) = block.norm.forward(&dense_out);
            let (dropped, mask) = block.dropout.forward(norm_out, rng);
            hidden.push((dense_cache, norm_cache, mask));
            activations = dropped;
        }
        let (prediction, output) = self.output.forward(activations);
        Ok((prediction, ForwardTape { recurrent, task_type, phase, hidden, output }))
    }

    fn backward(&mut self, tape: &ForwardTape, grad: &Array2<f64>) -> Result<(), ModelError> {
        let mut grad = self.output.backward(&tape.output, grad);
        for (block, (dense_cache, norm_cache, mask)) in self.hidden.iter_mut().zip(&tape.hidden).rev() {
            grad = block.dropout.backward(mask, &grad);
            grad = block.norm.backward(norm_cache, &grad);
            grad = block.dense.backward(dense_cache, &grad);
        }
        let recurrent_width = self.recurrent.output_width();
        let phase_start = recurrent_width + self.task_type_branch.units();
        self.phase_branch.backward(&tape.phase, &grad.slice(s![.., phase_start..]).to_owned());
        self.task_type_branch
            .backward(&tape.task_type, &grad.slice(s![.., recurrent_width..phase_start]).to_owned());
        self.recurrent.backward(&tape.recurrent, &grad.slice(s![.., ..recurrent_width]).to_owned())?;
        Ok(())
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.recurrent.params_mut();
        params.extend(self.task_type_branch.params_mut());
        params.extend(self.phase_branch.params_mut());
        for block in self.hidden.iter_mut() {
            params.extend(block.dense.params_mut());
            params.extend(block.norm.params_mut());
        }
        params.extend(self.output.params_mut());
        params
    }

    fn l2_penalty(&mut self) -> f64 {
        let l2 = self.config.l2_reg;
        self.params_mut().iter().map(|p| p.l2_penalty(l2)).sum()
    }

    fn scaled_mse(&self, x: &Array2<f64>, y_scaled: &Array2<f64>) -> Result<f64, ModelError> {
        let prediction = self.infer(x)?;
        Ok((prediction - y_scaled).mapv(|d| d * d).mean().unwrap_or(0.0))
    }

    /// Fits the network with mini-batch Adam on MSE.
    ///
    /// The monitored loss is the validation loss when a validation set is
    /// given, the training loss otherwise. The learning rate is halved after
    /// `lr_patience` epochs without improvement, and training stops after
    /// `early_stopping_patience` such epochs. The best weights seen are
    /// restored before returning.
    pub fn train(
        &mut self,
        x_train: &Array2<f64>,
        y_train: &[f64],
        validation: Option<(&Array2<f64>, &[f64])>,
    ) -> Result<TrainingHistory, ModelError> {
        if x_train.nrows() == 0 {
            return Err(ModelError::EmptyTrainingSet);
        }
        if x_train.nrows() != y_train.len() {
            return Err(ModelError::LengthMismatch { features: x_train.nrows(), targets: y_train.len() });
        }
        self.schema.check_width(x_train.ncols())?;

        let target_scaler = StandardScaler::fit_column(y_train)?;
        let to_column = |y: &[f64]| Array2::from_shape_fn((y.len(), 1), |(i, _)| target_scaler.transform_value(y[i]));
        let y_scaled = to_column(y_train);
        let validation = match validation {
            Some((x_val, y_val)) if x_val.nrows() > 0 => {
                if x_val.nrows() != y_val.len() {
                    return Err(ModelError::LengthMismatch { features: x_val.nrows(), targets: y_val.len() });
                }
                Some((x_val, to_column(y_val)))
            }
            _ => None,
        };
        self.target_scaler = Some(target_scaler);

        let mut rng = seeded_rng(self.config.seed, 1);
        let mut optimizer = Adam::new(self.config.learning_rate);
        let mut indices: Vec<usize> = (0..x_train.nrows()).collect();
        let mut history = TrainingHistory {
            loss: Vec::new(),
            val_loss: Vec::new(),
            learning_rate: Vec::new(),
            best_epoch: 0,
            stop_reason: StopReason::MaxEpochs,
        };
        let mut monitor = PlateauMonitor::new();
        let mut best_model: Option<RnnEstimator> = None;

        for epoch in 0..self.config.epochs {
            indices.shuffle(&mut rng);
            let mut loss_sum = 0.0;
            for batch in indices.chunks(self.config.batch_size) {
                let x_batch = x_train.select(Axis(0), batch);
                let y_batch = y_scaled.select(Axis(0), batch);
                for param in self.params_mut() {
                    param.zero_grad();
                }
                let (prediction, tape) = self.forward_train(&x_batch, &mut rng)?;
                let diff = prediction - &y_batch;
                loss_sum += diff.iter().map(|d| d * d).sum::<f64>();
                let grad = diff * (2.0 / batch.len() as f64);
                self.backward(&tape, &grad)?;
                let l2 = self.config.l2_reg;
                for param in self.params_mut() {
                    param.add_l2_grad(l2);
                }
                optimizer.step(self.params_mut());
            }

            let penalty = self.l2_penalty();
            let loss = loss_sum / x_train.nrows() as f64 + penalty;
            if !loss.is_finite() {
                return Err(ModelError::Diverged { epoch });
            }
            history.loss.push(loss);
            history.learning_rate.push(optimizer.learning_rate());

            let monitored = match &validation {
                Some((x_val, y_val)) => {
                    let val_loss = self.scaled_mse(x_val, y_val)? + penalty;
                    history.val_loss.push(val_loss);
                    val_loss
                }
                None => loss,
            };
            tracing::debug!(epoch, loss, monitored, lr = optimizer.learning_rate(), "epoch finished");

            if monitor.observe(monitored) {
                best_model = Some(self.clone());
                history.best_epoch = epoch;
            }
            if monitor.should_stop(self.config.early_stopping_patience) {
                tracing::info!(epoch, best_epoch = history.best_epoch, "early stopping");
                history.stop_reason = StopReason::EarlyStopping;
                break;
            }
            if monitor.should_reduce_lr(self.config.lr_patience) {
                let reduced = (optimizer.learning_rate() * self.config.lr_factor).max(self.config.min_learning_rate);
                if reduced < optimizer.learning_rate() {
                    tracing::info!(epoch, learning_rate = reduced, "reducing learning rate on plateau");
                    optimizer.set_learning_rate(reduced);
                }
            }
        }

        if let Some(best_model) = best_model {
            *self = best_model;
        }
        tracing::info!(
            epochs = history.epochs_trained(),
            best_epoch = history.best_epoch,
            stop_reason = ?history.stop_reason,
            "training finished"
        );
        Ok(history)
    }

    /// Predicted durations in hours, floored at `MIN_DURATION_HOURS`.
    pub fn predict_batch(&self, x: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        let scaled = self.infer(x)?;
        Ok(scaled.column(0).mapv(|value| {
            let hours = match &self.target_scaler {
                Some(scaler) => scaler.inverse_transform_value(value),
                None => value,
            };
            hours.max(MIN_DURATION_HOURS)
        }))
    }

    pub fn predict(&self, features: &EncodedFeatures) -> Result<f64, ModelError> {
        self.schema.ensure_matches(&features.schema)?;
        let x = features.values.view().insert_axis(Axis(0)).to_owned();
        let predictions = self.predict_batch(&x)?;
        Ok(predictions[0])
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        write_json_atomic(path, self)
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactLoadError> {
        read_json(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duration_model::model_config::RnnType;

    fn small_config(seed: u64) -> ModelConfig {
        ModelConfig {
            rnn_units: 8,
            dense_units: vec![16, 8],
            branch_units: 4,
            epochs: 40,
            batch_size: 8,
            learning_rate: 0.01,
            dropout_rate: 0.1,
            seed: Some(seed),
            ..ModelConfig::default()
        }
    }

    /// Rows with a linear duration signal in the first numeric column.
    fn toy_data(schema: FeatureSchema, rows: usize) -> (Array2<f64>, Vec<f64>) {
        let mut x = Array2::zeros((rows, schema.width()));
        let mut y = Vec::with_capacity(rows);
        for i in 0..rows {
            let signal = (i % 10) as f64 / 3.0 - 1.5;
            x[[i, 0]] = signal;
            x[[i, 1]] = ((i * 7) % 5) as f64 / 5.0;
            x[[i, schema.numeric() + i % 2]] = 1.0;
            x[[i, schema.numeric() + schema.task_type() + i % 3]] = 1.0;
            y.push(10.0 + 4.0 * signal);
        }
        (x, y)
    }

    #[test]
    fn test_training_reduces_loss_and_predictions_are_floored() {
        let schema = FeatureSchema::new(4, 3, 4);
        let (x, y) = toy_data(schema, 60);
        let mut model = RnnEstimator::build(schema, small_config(42)).unwrap();
        let history = model.train(&x, &y, None).unwrap();

        assert!(history.epochs_trained() > 0);
        assert!(history.loss.iter().all(|l| l.is_finite()));
        let best = history.loss[history.best_epoch];
        assert!(best < history.loss[0]);

        let predictions = model.predict_batch(&x).unwrap();
        assert!(predictions.iter().all(|&p| p >= MIN_DURATION_HOURS));
    }

    #[test]
    fn test_same_seed_gives_identical_models() {
        let schema = FeatureSchema::new(4, 3, 4);
        let (x, y) = toy_data(schema, 30);
        let config = ModelConfig { epochs: 5, ..small_config(7) };

        let mut first = RnnEstimator::build(schema, config.clone()).unwrap();
        let mut second = RnnEstimator::build(schema, config).unwrap();
        first.train(&x, &y, None).unwrap();
        second.train(&x, &y, None).unwrap();
        assert_eq!(first.predict_batch(&x).unwrap(), second.predict_batch(&x).unwrap());
    }

    #[test]
    fn test_save_load_predictions_are_identical() -> Result<(), Box<dyn std::error::Error>> {
        let schema = FeatureSchema::new(4, 3, 4);
        let (x, y) = toy_data(schema, 30);
        let config = ModelConfig { epochs: 3, rnn_type: RnnType::Lstm, ..small_config(3) };
        let mut model = RnnEstimator::build(schema, config)?;
        model.train(&x, &y, Some((&x, &y)))?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.json");
        model.save(&path)?;
        let restored = RnnEstimator::load(&path)?;
        assert_eq!(model.predict_batch(&x)?, restored.predict_batch(&x)?);
        Ok(())
    }

    #[test]
    fn test_validation_loss_is_recorded() {
        let schema = FeatureSchema::new(4, 3, 4);
        let (x, y) = toy_data(schema, 40);
        let config = ModelConfig { epochs: 4, ..small_config(1) };
        let mut model = RnnEstimator::build(schema, config).unwrap();
        let history = model.train(&x, &y, Some((&x, &y))).unwrap();
        assert_eq!(history.val_loss.len(), history.loss.len());
        assert_eq!(history.learning_rate.len(), history.loss.len());
    }

    #[test]
    fn test_plateau_monitor_counts_stale_epochs() {
        let mut monitor = PlateauMonitor::new();
        assert!(monitor.observe(1.0));
        assert!(monitor.observe(0.8));
        assert!(!monitor.observe(0.8));
        assert!(!monitor.observe(0.9));
        assert!(!monitor.should_stop(3));
        assert!(monitor.should_reduce_lr(2));
        // the learning-rate counter restarts, the stopping counter does not
        assert!(!monitor.should_reduce_lr(2));
        assert!(!monitor.observe(0.85));
        assert!(monitor.should_stop(3));
        assert!(monitor.observe(0.1));
        assert!(!monitor.should_stop(3));
    }

    #[test]
    fn test_short_patience_stops_before_max_epochs() {
        let schema = FeatureSchema::new(4, 3, 4);
        let (x, y) = toy_data(schema, 20);
        let config = ModelConfig { epochs: 300, early_stopping_patience: 1, lr_patience: 1, ..small_config(2) };
        let mut model = RnnEstimator::build(schema, config).unwrap();
        let history = model.train(&x, &y, Some((&x, &y))).unwrap();
        assert_eq!(history.stop_reason, StopReason::EarlyStopping);
        assert!(history.epochs_trained() < 300);
        assert!(history.best_epoch + 1 < history.epochs_trained());
    }

    #[test]
    fn test_mismatched_inputs_are_rejected() {
        let schema = FeatureSchema::new(4, 3, 4);
        let mut model = RnnEstimator::build(schema, small_config(0)).unwrap();
        let (x, y) = toy_data(schema, 10);

        assert!(matches!(model.train(&x, &y[..5], None), Err(ModelError::LengthMismatch { .. })));
        assert!(matches!(model.train(&Array2::zeros((0, 11)), &[], None), Err(ModelError::EmptyTrainingSet)));
        assert!(matches!(model.predict_batch(&Array2::zeros((1, 7))), Err(ModelError::Encoding(_))));

        let foreign = EncodedFeatures { values: Array1::zeros(12), schema: FeatureSchema::new(4, 4, 4) };
        assert!(model.predict(&foreign).is_err());
    }
}
