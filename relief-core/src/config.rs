use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::distance::{CostFunction, DistanceModel, GreatCircle, Planar};
use crate::events::ReconcilerConfig;
use crate::plan::{PlannerOptions, RoundingPolicy};
use crate::rational::Ratio;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid config {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct ReliefConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    #[serde(default)]
    pub distance: DistanceSection,
    #[serde(default)]
    pub planning: PlanningSection,
    #[serde(default)]
    pub events: EventsSection,
    #[serde(default)]
    pub server: ServerSection,
}

impl ReliefConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir)
    }

    pub fn store_path(&self) -> PathBuf {
        let file = Path::new(&self.paths.store_file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.data_dir().join(file)
        }
    }

    pub fn seed_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.seed_dir)
    }

    pub fn planner_options(&self) -> PlannerOptions {
        PlannerOptions {
            rounding: self.planning.rounding,
            reserve_ratio: self.planning.reserve_ratio,
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            reorder_window: chrono::Duration::seconds(self.events.reorder_window_secs as i64),
            max_clock_skew: chrono::Duration::seconds(self.events.max_clock_skew_secs as i64),
        }
    }

    pub fn cost_function(&self) -> Arc<dyn CostFunction> {
        match self.distance.model {
            DistanceModel::GreatCircle => Arc::new(GreatCircle::new(self.distance.speed_kmph)),
            DistanceModel::Planar => Arc::new(Planar::new(self.distance.cost_per_unit)),
        }
    }

    pub fn flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.events.flush_interval_ms.max(10))
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if !(self.distance.speed_kmph.is_finite() && self.distance.speed_kmph > 0.0) {
            return Err(format!(
                "distance.speed_kmph must be positive, got {}",
                self.distance.speed_kmph
            ));
        }
        if !(self.distance.cost_per_unit.is_finite() && self.distance.cost_per_unit >= 0.0) {
            return Err(format!(
                "distance.cost_per_unit must be non-negative, got {}",
                self.distance.cost_per_unit
            ));
        }
        let reserve = self.planning.reserve_ratio;
        if reserve < Ratio::ZERO || reserve >= Ratio::ONE {
            return Err(format!(
                "planning.reserve_ratio must lie in [0, 1), got {reserve}"
            ));
        }
        if self.paths.store_file.trim().is_empty() {
            return Err("paths.store_file must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            node_name: "relief-local".to_string(),
            environment: default_environment(),
            log_level: default_log_level(),
        }
    }
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
    pub store_file: String,
    pub seed_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: ".".to_string(),
            data_dir: "data".to_string(),
            store_file: "relief.sqlite".to_string(),
            seed_dir: "data/seed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DistanceSection {
    #[serde(default)]
    pub model: DistanceModel,
    pub speed_kmph: f64,
    #[serde(default = "default_cost_per_unit")]
    pub cost_per_unit: f64,
}

impl Default for DistanceSection {
    fn default() -> Self {
        Self {
            model: DistanceModel::GreatCircle,
            speed_kmph: 35.0,
            cost_per_unit: default_cost_per_unit(),
        }
    }
}

fn default_cost_per_unit() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlanningSection {
    #[serde(default)]
    pub rounding: RoundingPolicy,
    #[serde(default)]
    pub reserve_ratio: Ratio,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsSection {
    pub reorder_window_secs: u64,
    pub max_clock_skew_secs: u64,
    pub flush_interval_ms: u64,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            reorder_window_secs: 5,
            max_clock_skew_secs: 300,
            flush_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

pub fn load_relief_config<P: AsRef<Path>>(path: P) -> ConfigResult<ReliefConfig> {
    let path = path.as_ref();
    let config: ReliefConfig = load_toml(path)?;
    config.validate().map_err(|reason| ConfigError::Invalid {
        path: path.to_path_buf(),
        reason,
    })?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> ConfigResult<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
