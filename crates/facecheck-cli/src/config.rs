use facecheck_core::{MatchStrategy, ModelPaths};
use facecheck_hw::Warmup;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::workflow::Timeouts;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which embedding store to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Rest,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "rest" | "supabase" => Ok(Self::Rest),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }
}

/// Application configuration: defaults, then the TOML file, then
/// `FACECHECK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the SCRFD and ArcFace ONNX files.
    pub model_dir: PathBuf,
    pub store: StoreBackend,
    /// SQLite database file (sqlite backend).
    pub db_path: PathBuf,
    /// Project URL (rest backend).
    pub rest_url: Option<String>,
    /// API key (rest backend).
    pub rest_key: Option<String>,
    pub rest_table: String,
    /// Maximum Euclidean distance (exclusive) for a match.
    pub match_threshold: f32,
    pub match_strategy: MatchStrategy,
    pub camera_device: String,
    /// Fixed camera warm-up delay when no ready frame arrives.
    pub warmup_ms: u64,
    /// Frames inspected for the camera ready signal.
    pub max_warmup_frames: usize,
    pub capture_timeout_secs: u64,
    /// Covers lazy model loading as well as inference.
    pub detect_timeout_secs: u64,
    pub store_timeout_secs: u64,
}

/// On-disk shape; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    store: Option<StoreBackend>,
    db_path: Option<PathBuf>,
    rest_url: Option<String>,
    rest_key: Option<String>,
    rest_table: Option<String>,
    match_threshold: Option<f32>,
    match_strategy: Option<MatchStrategy>,
    camera_device: Option<String>,
    warmup_ms: Option<u64>,
    max_warmup_frames: Option<usize>,
    capture_timeout_secs: Option<u64>,
    detect_timeout_secs: Option<u64>,
    store_timeout_secs: Option<u64>,
}

impl Config {
    /// Load configuration from the process environment and an optional file.
    ///
    /// Without an explicit `path`, `$XDG_CONFIG_HOME/facecheck/config.toml`
    /// is used when it exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`Config::load`] with the environment supplied by the caller.
    pub fn load_with(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(&env);

        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Some(config_dir(&env).join("config.toml")).filter(|p| p.exists()),
        };
        if let Some(file) = file {
            let text = std::fs::read_to_string(&file).map_err(|source| ConfigError::Read {
                path: file.clone(),
                source,
            })?;
            config.apply_toml(&text).map_err(|source| ConfigError::Parse {
                path: file.clone(),
                source,
            })?;
            tracing::debug!(path = %file.display(), "loaded config file");
        }

        config.apply_env(&env);
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults. Paths follow the XDG base directory layout.
    pub fn defaults(env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home(&env).join(".local/share"))
            .join("facecheck");

        Self {
            model_dir: data_dir.join("models"),
            store: StoreBackend::Sqlite,
            db_path: data_dir.join("faces.db"),
            rest_url: None,
            rest_key: None,
            rest_table: "faces".to_string(),
            match_threshold: 0.6,
            match_strategy: MatchStrategy::First,
            camera_device: "/dev/video0".to_string(),
            warmup_ms: 1000,
            max_warmup_frames: 30,
            capture_timeout_secs: 10,
            detect_timeout_secs: 30,
            store_timeout_secs: 10,
        }
    }

    fn apply_toml(&mut self, text: &str) -> Result<(), toml::de::Error> {
        let file: FileConfig = toml::from_str(text)?;
        set(&mut self.model_dir, file.model_dir);
        set(&mut self.store, file.store);
        set(&mut self.db_path, file.db_path);
        set(&mut self.rest_table, file.rest_table);
        set(&mut self.match_threshold, file.match_threshold);
        set(&mut self.match_strategy, file.match_strategy);
        set(&mut self.camera_device, file.camera_device);
        set(&mut self.warmup_ms, file.warmup_ms);
        set(&mut self.max_warmup_frames, file.max_warmup_frames);
        set(&mut self.capture_timeout_secs, file.capture_timeout_secs);
        set(&mut self.detect_timeout_secs, file.detect_timeout_secs);
        set(&mut self.store_timeout_secs, file.store_timeout_secs);
        if file.rest_url.is_some() {
            self.rest_url = file.rest_url;
        }
        if file.rest_key.is_some() {
            self.rest_key = file.rest_key;
        }
        Ok(())
    }

    /// Overlay `FACECHECK_*` variables. Unparsable values are ignored with a warning.
    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("FACECHECK_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("FACECHECK_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("FACECHECK_REST_URL") {
            self.rest_url = Some(v);
        }
        if let Some(v) = env("FACECHECK_REST_KEY") {
            self.rest_key = Some(v);
        }
        if let Some(v) = env("FACECHECK_REST_TABLE") {
            self.rest_table = v;
        }
        if let Some(v) = env("FACECHECK_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        parse_env(&env, "FACECHECK_STORE", &mut self.store);
        parse_env(&env, "FACECHECK_MATCH_THRESHOLD", &mut self.match_threshold);
        parse_env(&env, "FACECHECK_MATCH_STRATEGY", &mut self.match_strategy);
        parse_env(&env, "FACECHECK_WARMUP_MS", &mut self.warmup_ms);
        parse_env(&env, "FACECHECK_MAX_WARMUP_FRAMES", &mut self.max_warmup_frames);
        parse_env(&env, "FACECHECK_CAPTURE_TIMEOUT_SECS", &mut self.capture_timeout_secs);
        parse_env(&env, "FACECHECK_DETECT_TIMEOUT_SECS", &mut self.detect_timeout_secs);
        parse_env(&env, "FACECHECK_STORE_TIMEOUT_SECS", &mut self.store_timeout_secs);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a non-negative number, got {}",
                self.match_threshold
            )));
        }
        for (name, secs) in [
            ("capture_timeout_secs", self.capture_timeout_secs),
            ("detect_timeout_secs", self.detect_timeout_secs),
            ("store_timeout_secs", self.store_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        if self.store == StoreBackend::Rest && (self.rest_url.is_none() || self.rest_key.is_none()) {
            return Err(ConfigError::Invalid(
                "rest store needs rest_url and rest_key".to_string(),
            ));
        }
        Ok(())
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            capture: Duration::from_secs(self.capture_timeout_secs),
            detect: Duration::from_secs(self.detect_timeout_secs),
            store_read: Duration::from_secs(self.store_timeout_secs),
            store_write: Duration::from_secs(self.store_timeout_secs),
        }
    }

    pub fn warmup(&self) -> Warmup {
        Warmup {
            max_frames: self.max_warmup_frames,
            fallback_delay: Duration::from_millis(self.warmup_ms),
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = env(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment value"),
    }
}

fn home(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    PathBuf::from(env("HOME").unwrap_or_else(|| "/tmp".to_string()))
}

fn config_dir(env: impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(&env).join(".config"))
        .join("facecheck")
}
