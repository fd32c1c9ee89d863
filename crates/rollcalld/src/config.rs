use anyhow::{Context, Result};
use rollcall_engine::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which message bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    Session,
    System,
}

impl std::str::FromStr for Bus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Bus::Session),
            "system" => Ok(Bus::System),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

/// Optional keys read from `rollcall.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub training_step: Option<u64>,
    pub training_cap: Option<u64>,
    pub distance_threshold: Option<f32>,
    pub dedup_window_secs: Option<u64>,
    pub vision_timeout_secs: Option<u64>,
    pub training_timeout_secs: Option<u64>,
    pub inference_sessions: Option<usize>,
    pub bus: Option<Bus>,
}

/// Daemon configuration: defaults, then the TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database, sample buckets and trained models live here.
    pub data_dir: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Retrain each time an identity's sample count passes a multiple of this.
    pub training_step: u64,
    /// Retrain when an identity first reaches this many samples.
    pub training_cap: u64,
    /// Cosine distance below which a face is accepted.
    pub distance_threshold: f32,
    /// Minimum spacing between two attendance records of one identity.
    pub dedup_window_secs: u64,
    pub vision_timeout_secs: u64,
    pub training_timeout_secs: u64,
    /// ONNX sessions per model, i.e. concurrent inferences.
    pub inference_sessions: usize,
    pub bus: Bus,
}

impl Config {
    /// Load from the config file (if any) and the process environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("ROLLCALL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| config_home().join("rollcall/rollcall.toml"));

        let file = if path.exists() {
            tracing::info!(path = %path.display(), "reading config file");
            read_file(&path)?
        } else {
            FileConfig::default()
        };

        Ok(Self::from_sources(file, |key| std::env::var(key).ok()))
    }

    pub fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| data_home(&env).join("rollcall"));

        let model_dir = env("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(rollcall_core::default_model_dir);

        Self {
            data_dir,
            model_dir,
            training_step: parsed(&env, "ROLLCALL_TRAINING_STEP").or(file.training_step).unwrap_or(200),
            training_cap: parsed(&env, "ROLLCALL_TRAINING_CAP").or(file.training_cap).unwrap_or(1000),
            distance_threshold: parsed(&env, "ROLLCALL_DISTANCE_THRESHOLD")
                .or(file.distance_threshold)
                .unwrap_or(0.60),
            dedup_window_secs: parsed(&env, "ROLLCALL_DEDUP_WINDOW_SECS")
                .or(file.dedup_window_secs)
                .unwrap_or(60),
            vision_timeout_secs: parsed(&env, "ROLLCALL_VISION_TIMEOUT_SECS")
                .or(file.vision_timeout_secs)
                .unwrap_or(10),
            training_timeout_secs: parsed(&env, "ROLLCALL_TRAINING_TIMEOUT_SECS")
                .or(file.training_timeout_secs)
                .unwrap_or(600),
            inference_sessions: parsed(&env, "ROLLCALL_INFERENCE_SESSIONS")
                .or(file.inference_sessions)
                .unwrap_or(2)
                .max(1),
            bus: parsed(&env, "ROLLCALL_BUS").or(file.bus).unwrap_or(Bus::Session),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig::new(&self.data_dir);
        engine.training_step = self.training_step;
        engine.training_cap = self.training_cap;
        engine.distance_threshold = self.distance_threshold;
        engine.dedup_window = Duration::from_secs(self.dedup_window_secs);
        engine.vision_timeout = Duration::from_secs(self.vision_timeout_secs);
        engine.training_timeout = Duration::from_secs(self.training_timeout_secs);
        engine
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn read_file(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
}

fn data_home(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home().join(".local/share"))
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
        let config = Config::from_sources(FileConfig::default(), env_of(&[("XDG_DATA_HOME", "/data")]));
        assert_eq!(config.data_dir, PathBuf::from("/data/rollcall"));
        assert_eq!(config.training_step, 200);
        assert_eq!(config.training_cap, 1000);
        assert_eq!(config.dedup_window_secs, 60);
        assert_eq!(config.bus, Bus::Session);
        assert!(config.scrfd_model_path().ends_with("det_10g.onnx"));
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            training_step = 50
            distance_threshold = 0.4
            bus = "system"
            "#,
        )
        .unwrap();
        let config = Config::from_sources(file, env_of(&[("ROLLCALL_TRAINING_STEP", "20")]));
        assert_eq!(config.training_step, 20);
        assert_eq!(config.distance_threshold, 0.4);
        assert_eq!(config.bus, Bus::System);
    }

    #[test]
    fn test_bad_env_value_falls_back() {
        let config = Config::from_sources(
            FileConfig::default(),
            env_of(&[("ROLLCALL_DEDUP_WINDOW_SECS", "soon"), ("ROLLCALL_INFERENCE_SESSIONS", "0")]),
        );
        assert_eq!(config.dedup_window_secs, 60);
        assert_eq!(config.inference_sessions, 1);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(toml::from_str::<FileConfig>("threshold = 1").is_err());
    }

    #[test]
    fn test_engine_config_carries_durations() {
        let config = Config::from_sources(FileConfig::default(), env_of(&[("ROLLCALL_DATA_DIR", "/srv/rc")]));
        let engine = config.engine_config();
        assert_eq!(engine.data_dir, PathBuf::from("/srv/rc"));
        assert_eq!(engine.dedup_window, Duration::from_secs(60));
        assert_eq!(engine.db_path(), PathBuf::from("/srv/rc/rollcall.db"));
    }
}
