use serde::{Deserialize, Serialize};

use crate::duration_model::layers::Activation;
use crate::errors::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RnnType {
    #[default]
    Gru,
    Lstm,
}

fn default_rnn_units() -> usize {
    64
}
fn default_dense_units() -> Vec<usize> {
    vec![128, 64, 32]
}
fn default_branch_units() -> usize {
    32
}
fn default_dropout_rate() -> f64 {
    0.3
}
fn default_learning_rate() -> f64 {
    0.001
}
fn default_l2_reg() -> f64 {
    0.001
}
fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    32
}
fn default_epochs() -> usize {
    100
}
fn default_early_stopping_patience() -> usize {
    30
}
fn default_lr_patience() -> usize {
    10
}
fn default_lr_factor() -> f64 {
    0.5
}
fn default_min_learning_rate() -> f64 {
    1e-6
}

/// Network topology and optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_rnn_units")]
    pub rnn_units: usize,
    #[serde(default = "default_dense_units")]
    pub dense_units: Vec<usize>,
    /// Width of the dense layers applied to each one-hot block.
    #[serde(default = "default_branch_units")]
    pub branch_units: usize,
    #[serde(default = "default_dropout_rate")]
    pub dropout_rate: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_l2_reg")]
    pub l2_reg: f64,
    #[serde(default = "default_true")]
    pub use_bidirectional: bool,
    #[serde(default)]
    pub rnn_type: RnnType,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_early_stopping_patience")]
    pub early_stopping_patience: usize,
    #[serde(default = "default_lr_patience")]
    pub lr_patience: usize,
    #[serde(default = "default_lr_factor")]
    pub lr_factor: f64,
    #[serde(default = "default_min_learning_rate")]
    pub min_learning_rate: f64,
    /// Fixed seed for weight init, shuffling and dropout. `None` draws from the OS.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            rnn_units: default_rnn_units(),
            dense_units: default_dense_units(),
            branch_units: default_branch_units(),
            dropout_rate: default_dropout_rate(),
            learning_rate: default_learning_rate(),
            l2_reg: default_l2_reg(),
            use_bidirectional: true,
            rnn_type: RnnType::Gru,
            activation: Activation::Relu,
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            early_stopping_patience: default_early_stopping_patience(),
            lr_patience: default_lr_patience(),
            lr_factor: default_lr_factor(),
            min_learning_rate: default_min_learning_rate(),
            seed: None,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.rnn_units == 0 || self.branch_units == 0 || self.dense_units.iter().any(|&u| u == 0) {
            return Err(ModelError::InvalidConfig("layer widths must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(ModelError::InvalidConfig(format!("dropout rate {} outside [0, 1)", self.dropout_rate)));
        }
        if self.batch_size == 0 || self.epochs == 0 {
            return Err(ModelError::InvalidConfig("batch size and epochs must be positive".to_string()));
        }
        if !(self.learning_rate > 0.0) || !(self.l2_reg >= 0.0) {
            return Err(ModelError::InvalidConfig("learning rate must be positive and l2 non-negative".to_string()));
        }
        if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            return Err(ModelError::InvalidConfig(format!("lr factor {} outside (0, 1)", self.lr_factor)));
        }
        Ok(())
    }
}
