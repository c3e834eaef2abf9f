use anyhow::{bail, Context, Result};
use rollcall_core::detector::{AnyDetector, DetectorError};
use rollcall_core::local::{LocalDetector, SCRFD_MODEL_FILE};
use rollcall_core::matcher::{MatchConfig, DEFAULT_THRESHOLD};
use rollcall_core::model_cell::InitPolicy;
use rollcall_core::remote::RemoteDetector;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which landmark extractor backs enrollment and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Local,
    Remote,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::Remote => "remote",
        }
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Backend::Local),
            "remote" => Ok(Backend::Remote),
            other => bail!("unknown backend {other:?} (expected \"local\" or \"remote\")"),
        }
    }
}

/// Daemon configuration.
///
/// Defaults, then the TOML file named by `ROLLCALL_CONFIG`, then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub backend: Backend,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Base URL of the remote recognition service.
    pub remote_url: String,
    /// Cosine similarity a face must exceed to count as a match.
    pub similarity_threshold: f64,
    /// Allow one student to be matched by several faces in a frame.
    pub allow_duplicate_matches: bool,
    pub inference_timeout_ms: u64,
    /// Upper bound on one model load (or remote health check) attempt.
    pub load_timeout_ms: u64,
    pub init_attempts: u32,
    pub init_backoff_ms: u64,
    /// Initialize the detector at startup instead of on first request.
    pub warmup: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            backend: Backend::Local,
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("rollcall.db"),
            remote_url: "http://127.0.0.1:8000".to_string(),
            similarity_threshold: DEFAULT_THRESHOLD,
            allow_duplicate_matches: false,
            inference_timeout_ms: 5_000,
            load_timeout_ms: 30_000,
            init_attempts: 3,
            init_backoff_ms: 250,
            warmup: true,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Some(
                std::fs::read_to_string(&path).with_context(|| format!("reading config file {path}"))?,
            ),
            Err(_) => None,
        };
        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Layer an optional TOML document and an environment lookup over the defaults.
    pub fn from_sources(toml_text: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config: Config = match toml_text {
            Some(text) => toml::from_str(text).context("parsing config file")?,
            None => Config::default(),
        };

        if let Some(v) = env("ROLLCALL_BACKEND") {
            config.backend = v.parse()?;
        }
        if let Some(v) = env("ROLLCALL_MODEL_DIR") {
            config.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_REMOTE_URL") {
            config.remote_url = v;
        }
        config.similarity_threshold = env_parsed(&env, "ROLLCALL_SIMILARITY_THRESHOLD", config.similarity_threshold);
        config.allow_duplicate_matches = env_bool(&env, "ROLLCALL_ALLOW_DUPLICATE_MATCHES", config.allow_duplicate_matches);
        config.inference_timeout_ms = env_parsed(&env, "ROLLCALL_INFERENCE_TIMEOUT_MS", config.inference_timeout_ms);
        config.load_timeout_ms = env_parsed(&env, "ROLLCALL_LOAD_TIMEOUT_MS", config.load_timeout_ms);
        config.init_attempts = env_parsed(&env, "ROLLCALL_INIT_ATTEMPTS", config.init_attempts);
        config.init_backoff_ms = env_parsed(&env, "ROLLCALL_INIT_BACKOFF_MS", config.init_backoff_ms);
        config.warmup = env_bool(&env, "ROLLCALL_WARMUP", config.warmup);

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            bail!(
                "similarity_threshold must lie in [-1, 1], got {}",
                self.similarity_threshold
            );
        }
        if self.init_attempts == 0 {
            bail!("init_attempts must be at least 1");
        }
        if self.backend == Backend::Remote && self.remote_url.trim().is_empty() {
            bail!("remote backend selected but remote_url is empty");
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_MODEL_FILE)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            threshold: self.similarity_threshold,
            allow_duplicates: self.allow_duplicate_matches,
        }
    }

    pub fn init_policy(&self) -> InitPolicy {
        InitPolicy {
            max_attempts: self.init_attempts,
            attempt_timeout: Duration::from_millis(self.load_timeout_ms),
            backoff: Duration::from_millis(self.init_backoff_ms),
        }
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    /// Construct the configured detector. Nothing is loaded yet.
    pub fn build_detector(&self) -> Result<AnyDetector, DetectorError> {
        Ok(match self.backend {
            Backend::Local => AnyDetector::Local(LocalDetector::new(
                self.scrfd_model_path(),
                self.init_policy(),
                self.inference_timeout(),
            )),
            Backend::Remote => AnyDetector::Remote(RemoteDetector::new(
                self.remote_url.clone(),
                self.init_policy(),
                self.inference_timeout(),
            )?),
        })
    }
}

fn env_parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match env(key) {
        Some(v) => match v.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(key, value = %v, "ignoring unparsable setting");
                default
            }
        },
        None => default,
    }
}

fn env_bool(env: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    env(key)
        .map(|v| !matches!(v.trim(), "0" | "false" | "no" | "off"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(None, env_of(&[])).unwrap();
        assert_eq!(config.backend, Backend::Local);
        assert_eq!(config.similarity_threshold, 0.7);
        assert!(!config.allow_duplicate_matches);
        assert_eq!(config.init_policy().max_attempts, 3);
        assert_eq!(config.inference_timeout(), Duration::from_secs(5));
        assert!(config.scrfd_model_path().ends_with("det_10g.onnx"));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = r#"
            backend = "remote"
            remote_url = "http://faces.internal:8000"
            similarity_threshold = 0.8
            warmup = false
        "#;
        let config = Config::from_sources(
            Some(file),
            env_of(&[
                ("ROLLCALL_SIMILARITY_THRESHOLD", "0.65"),
                ("ROLLCALL_ALLOW_DUPLICATE_MATCHES", "1"),
            ]),
        )
        .unwrap();

        assert_eq!(config.backend, Backend::Remote);
        assert_eq!(config.remote_url, "http://faces.internal:8000");
        assert_eq!(config.similarity_threshold, 0.65);
        assert!(config.allow_duplicate_matches);
        assert!(!config.warmup);
        assert!(config.match_config().allow_duplicates);
    }

    #[test]
    fn test_unparsable_env_keeps_previous_value() {
        let config = Config::from_sources(None, env_of(&[("ROLLCALL_INIT_ATTEMPTS", "many")])).unwrap();
        assert_eq!(config.init_attempts, 3);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_sources(None, env_of(&[("ROLLCALL_SIMILARITY_THRESHOLD", "1.5")])).is_err());
        assert!(Config::from_sources(None, env_of(&[("ROLLCALL_INIT_ATTEMPTS", "0")])).is_err());
        assert!(Config::from_sources(None, env_of(&[("ROLLCALL_BACKEND", "gpu")])).is_err());
        assert!(Config::from_sources(Some("camera = \"/dev/video0\""), env_of(&[])).is_err());
    }

    #[test]
    fn test_build_detector_selects_backend() {
        let local = Config::from_sources(None, env_of(&[])).unwrap();
        assert!(matches!(local.build_detector().unwrap(), AnyDetector::Local(_)));

        let remote = Config::from_sources(None, env_of(&[("ROLLCALL_BACKEND", "Remote")])).unwrap();
        match remote.build_detector().unwrap() {
            AnyDetector::Remote(d) => assert_eq!(d.base_url(), "http://127.0.0.1:8000"),
            AnyDetector::Local(_) => panic!("expected remote detector"),
        }
    }
}
