use anyhow::{Context, Result};
use rollcall_core::{Course, DedupePolicy, DEFAULT_SIMILARITY_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// CLI configuration: defaults, then the TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Similarity a probe must exceed to match an enrolled user.
    pub similarity_threshold: f32,
    /// Milliseconds between scan ticks.
    pub scan_interval_ms: u64,
    /// Seconds `rollcall scan` waits for a match.
    pub scan_timeout_secs: u64,
    /// Seconds to wait for a geolocation fix.
    pub geo_timeout_secs: u64,
    /// What to do with a second Present mark on the same day.
    pub dedupe: DedupePolicy,
    /// Device string stamped on recorded events.
    pub device: Option<String>,
    /// Fixed position reported for this machine; none means no location.
    pub location: Option<LocationConfig>,
    /// Course catalog replacing the stored one; empty keeps the stored
    /// catalog (a new database starts with the default courses).
    pub courses: Vec<Course>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationConfig {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_accuracy")]
    pub accuracy: f64,
}

fn default_accuracy() -> f64 {
    50.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: data_dir().join("attendance.db"),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            scan_interval_ms: 300,
            scan_timeout_secs: 30,
            geo_timeout_secs: 10,
            dedupe: DedupePolicy::default(),
            device: None,
            location: None,
            courses: Vec::new(),
        }
    }
}

impl Config {
    /// Load the config file (if any) and apply environment overrides.
    ///
    /// A file named by `ROLLCALL_CONFIG` must exist; the default location
    /// is optional.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => {
                let path = config_dir().join("config.toml");
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `ROLLCALL_*` variables. Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(v) = parsed(&var, "ROLLCALL_SIMILARITY_THRESHOLD") {
            self.similarity_threshold = v;
        }
        if let Some(v) = parsed(&var, "ROLLCALL_SCAN_INTERVAL_MS") {
            self.scan_interval_ms = v;
        }
        if let Some(v) = parsed(&var, "ROLLCALL_SCAN_TIMEOUT_SECS") {
            self.scan_timeout_secs = v;
        }
        if let Some(v) = parsed(&var, "ROLLCALL_GEO_TIMEOUT_SECS") {
            self.geo_timeout_secs = v;
        }
        if let Some(v) = parsed(&var, "ROLLCALL_DEDUPE") {
            self.dedupe = v;
        }
        if let Some(device) = var("ROLLCALL_DEVICE") {
            self.device = Some(device).filter(|d| !d.is_empty());
        }

        let latitude = parsed(&var, "ROLLCALL_LATITUDE");
        let longitude = parsed(&var, "ROLLCALL_LONGITUDE");
        match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => {
                let accuracy = parsed(&var, "ROLLCALL_ACCURACY")
                    .or(self.location.map(|l| l.accuracy))
                    .unwrap_or_else(default_accuracy);
                self.location = Some(LocationConfig {
                    latitude,
                    longitude,
                    accuracy,
                });
            }
            (None, None) => {}
            _ => tracing::warn!("ROLLCALL_LATITUDE and ROLLCALL_LONGITUDE must be set together; ignoring"),
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(1))
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn geo_timeout(&self) -> Duration {
        Duration::from_secs(self.geo_timeout_secs)
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment value");
            None
        }
    }
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(fallback)
        })
        .join("rollcall")
}

fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}
