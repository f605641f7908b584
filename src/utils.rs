use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::duration_model::ModelConfig;
use crate::errors::{ArtifactLoadError, PersistenceError};
use crate::training::TrainingConfig;

pub const CONFIG_PATH: &str = "config.yaml";
const DEFAULT_LOG_FILTER: &str = "task_duration_estimator=info,train_model=info,predict=info,actix_web=info";

fn default_bind_address() -> String {
    "[::]:8080".to_string()
}
fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}
fn default_model_name() -> String {
    "rnn_duration_estimator".to_string()
}
fn default_task_store_path() -> Option<PathBuf> {
    Some(PathBuf::from("data/tasks.json"))
}
fn default_model_refresh_secs() -> u64 {
    30
}

/// Settings read from `config.yaml`. Every field has a default, so a partial
/// file is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// JSON snapshot backing the local task store. `None` keeps tasks in memory only.
    #[serde(default = "default_task_store_path")]
    pub task_store_path: Option<PathBuf>,
    /// How often the server re-reads `CURRENT` for a newly promoted version.
    #[serde(default = "default_model_refresh_secs")]
    pub model_refresh_secs: u64,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_address: default_bind_address(),
            model_dir: default_model_dir(),
            model_name: default_model_name(),
            task_store_path: default_task_store_path(),
            model_refresh_secs: default_model_refresh_secs(),
            training: TrainingConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

pub fn load_config() -> Config {
    load_config_from(Path::new(CONFIG_PATH))
}

/// Loads the configuration file, falling back to defaults when it is missing
/// or malformed.
pub fn load_config_from(path: &Path) -> Config {
    match fs::read_to_string(path) {
        Ok(config_content) => match serde_yaml::from_str::<Config>(&config_content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse config, using defaults");
                Config::default()
            }
        },
        Err(_) => {
            tracing::warn!(path = %path.display(), "config not found, using defaults");
            Config::default()
        }
    }
}

/// Installs the global fmt subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Serializes `value` next to `path` and renames it into place, so readers
/// see either the old file or the complete new one.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let tmp_path = tmp_path_for(path);
    let io_err = |source| PersistenceError::Io { path: tmp_path.clone(), source };
    let file = fs::File::create(&tmp_path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|source| PersistenceError::Serialization { path: path.to_path_buf(), source })?;
    writer.flush().map_err(io_err)?;
    writer.get_ref().sync_all().map_err(io_err)?;
    drop(writer);

    fs::rename(&tmp_path, path).map_err(|source| PersistenceError::Io { path: path.to_path_buf(), source })
}

/// Same replace-by-rename as [`write_json_atomic`] for a plain text file.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<(), PersistenceError> {
    let tmp_path = tmp_path_for(path);
    let io_err = |source| PersistenceError::Io { path: tmp_path.clone(), source };
    let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
    file.write_all(content.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|source| PersistenceError::Io { path: path.to_path_buf(), source })
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    path.with_file_name(tmp_name)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactLoadError> {
    let content = fs::read_to_string(path).map_err(|source| match source.kind() {
        ErrorKind::NotFound => ArtifactLoadError::Missing { path: path.to_path_buf() },
        _ => ArtifactLoadError::Io { path: path.to_path_buf(), source },
    })?;
    serde_json::from_str(&content).map_err(|source| ArtifactLoadError::Corrupt { path: path.to_path_buf(), source })
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
