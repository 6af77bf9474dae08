use crate::monitor::MonitorSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Which backend detection records are written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Sqlite,
    Rest,
}

impl FromStr for StoreKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(StoreKind::Sqlite),
            "rest" => Ok(StoreKind::Rest),
            other => Err(ConfigError::Invalid(format!("unknown store: {other}"))),
        }
    }
}

/// Which D-Bus bus the service is exported on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(ConfigError::Invalid(format!("unknown bus: {other}"))),
        }
    }
}

/// Optional TOML base layer; every field may be overridden by a `FACEWATCH_*`
/// environment variable.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub model_dir: Option<PathBuf>,
    pub gallery_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub screenshot_dir: Option<PathBuf>,
    pub camera: Option<String>,
    pub match_distance: Option<f32>,
    pub cooldown_secs: Option<u64>,
    pub live_interval_ms: Option<u64>,
    pub snapshot_interval_ms: Option<u64>,
    pub max_records: Option<usize>,
    pub store: Option<StoreKind>,
    pub rest_url: Option<String>,
    pub rest_token: Option<String>,
    pub bus: Option<BusKind>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Reference photos plus the optional `students.toml` roster.
    pub gallery_dir: PathBuf,
    pub db_path: PathBuf,
    pub screenshot_dir: PathBuf,
    /// Camera used when a start request names none.
    pub camera: String,
    /// Maximum descriptor distance for a positive match.
    pub match_distance: f32,
    pub cooldown_secs: u64,
    pub live_interval_ms: u64,
    pub snapshot_interval_ms: u64,
    /// SQLite store retention.
    pub max_records: usize,
    pub store: StoreKind,
    pub rest_url: Option<String>,
    pub rest_token: Option<String>,
    pub bus: BusKind,
}

impl Config {
    /// Load `FACEWATCH_CONFIG` (if set) and apply `FACEWATCH_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("FACEWATCH_CONFIG") {
            Some(path) => FileConfig::load(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge a file layer with an environment lookup.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facewatch");

        let path = |key: &str, file_value: Option<PathBuf>, default: PathBuf| {
            env(key).map(PathBuf::from).or(file_value).unwrap_or(default)
        };

        let config = Self {
            model_dir: path("FACEWATCH_MODEL_DIR", file.model_dir, data_dir.join("models")),
            gallery_dir: path("FACEWATCH_GALLERY_DIR", file.gallery_dir, data_dir.join("gallery")),
            db_path: path("FACEWATCH_DB_PATH", file.db_path, data_dir.join("detections.db")),
            screenshot_dir: path(
                "FACEWATCH_SCREENSHOT_DIR",
                file.screenshot_dir,
                data_dir.join("face_matches"),
            ),
            camera: env("FACEWATCH_CAMERA")
                .or(file.camera)
                .unwrap_or_else(|| "local:/dev/video0".to_string()),
            match_distance: parsed(&env, "FACEWATCH_MATCH_DISTANCE")
                .or(file.match_distance)
                .unwrap_or(facewatch_core::DEFAULT_MATCH_DISTANCE),
            cooldown_secs: parsed(&env, "FACEWATCH_COOLDOWN_SECS")
                .or(file.cooldown_secs)
                .unwrap_or(5),
            live_interval_ms: parsed(&env, "FACEWATCH_LIVE_INTERVAL_MS")
                .or(file.live_interval_ms)
                .unwrap_or(1000),
            snapshot_interval_ms: parsed(&env, "FACEWATCH_SNAPSHOT_INTERVAL_MS")
                .or(file.snapshot_interval_ms)
                .unwrap_or(2000),
            max_records: parsed(&env, "FACEWATCH_MAX_RECORDS")
                .or(file.max_records)
                .unwrap_or(100),
            store: parsed(&env, "FACEWATCH_STORE")
                .or(file.store)
                .unwrap_or(StoreKind::Sqlite),
            rest_url: env("FACEWATCH_REST_URL").or(file.rest_url),
            rest_token: env("FACEWATCH_REST_TOKEN").or(file.rest_token),
            bus: parsed(&env, "FACEWATCH_BUS").or(file.bus).unwrap_or(BusKind::Session),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_distance.is_finite() && self.match_distance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "match_distance must be positive, got {}",
                self.match_distance
            )));
        }
        if self.live_interval_ms == 0 || self.snapshot_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll intervals must be non-zero".into()));
        }
        if self.max_records == 0 {
            return Err(ConfigError::Invalid("max_records must be at least 1".into()));
        }
        if self.store == StoreKind::Rest && self.rest_url.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Invalid("the rest store needs FACEWATCH_REST_URL".into()));
        }
        Ok(())
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            match_distance: self.match_distance,
            cooldown: Duration::from_secs(self.cooldown_secs),
            live_interval: Duration::from_millis(self.live_interval_ms),
            snapshot_interval: Duration::from_millis(self.snapshot_interval_ms),
        }
    }
}

/// A malformed variable is ignored with a warning, falling back to the lower layers.
fn parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring malformed configuration value");
            None
        }
    }
}
