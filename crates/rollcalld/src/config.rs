use rollcall_core::ThresholdPolicy;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "/etc/rollcall/rollcalld.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration: built-in defaults, overlaid by the TOML file, overlaid
/// by `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub encoder_model: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance under which a face is labelled with a name.
    pub draw_threshold: f32,
    /// Euclidean distance under which attendance is recorded.
    pub commit_threshold: f32,
    /// Run detection on every Nth frame.
    pub process_every: u32,
    /// Downsample factor applied before detection.
    pub downsample: u32,
    pub jpeg_quality: u8,
    /// Redraw the last annotations on frames that skip detection.
    pub retain_overlay: bool,
    pub http_addr: SocketAddr,
    /// Register on the session bus instead of the system bus.
    pub session_bus: bool,
}

/// On-disk form; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    capture_width: Option<u32>,
    capture_height: Option<u32>,
    model_dir: Option<PathBuf>,
    detector_model: Option<String>,
    encoder_model: Option<String>,
    db_path: Option<PathBuf>,
    draw_threshold: Option<f32>,
    commit_threshold: Option<f32>,
    process_every: Option<u32>,
    downsample: Option<u32>,
    jpeg_quality: Option<u8>,
    retain_overlay: Option<bool>,
    http_addr: Option<SocketAddr>,
    session_bus: Option<bool>,
}

impl Config {
    /// Load from the process environment and the config file it names.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let (path, required) = match env("ROLLCALL_CONFIG") {
            Some(p) => (PathBuf::from(p), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let file = match std::fs::read_to_string(&path) {
            Ok(text) => Some(parse_file(&path, &text)?),
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        if file.is_some() {
            tracing::info!(path = %path.display(), "loaded config file");
        }

        let mut config = Self::defaults(&env);
        if let Some(file) = file {
            config.apply_file(file);
        }
        config.apply_env(&env);
        config.validate()?;
        Ok(config)
    }

    fn defaults(env: &impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let thresholds = ThresholdPolicy::default();
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            model_dir: rollcall_core::default_model_dir(),
            detector_model: "det_10g.onnx".to_string(),
            encoder_model: "face_encoder_128.onnx".to_string(),
            db_path: data_dir.join("attendance.db"),
            draw_threshold: thresholds.draw(),
            commit_threshold: thresholds.commit(),
            process_every: 3,
            downsample: 4,
            jpeg_quality: 85,
            retain_overlay: true,
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8750)),
            session_bus: false,
        }
    }

    fn apply_file(&mut self, file: FileConfig) {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = file.$field { self.$field = v; })*
            };
        }
        overlay!(
            camera_device,
            capture_width,
            capture_height,
            model_dir,
            detector_model,
            encoder_model,
            db_path,
            draw_threshold,
            commit_threshold,
            process_every,
            downsample,
            jpeg_quality,
            retain_overlay,
            http_addr,
            session_bus,
        );
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = env("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        env_parse(env, "ROLLCALL_CAPTURE_WIDTH", &mut self.capture_width);
        env_parse(env, "ROLLCALL_CAPTURE_HEIGHT", &mut self.capture_height);
        env_parse(env, "ROLLCALL_DRAW_THRESHOLD", &mut self.draw_threshold);
        env_parse(env, "ROLLCALL_COMMIT_THRESHOLD", &mut self.commit_threshold);
        env_parse(env, "ROLLCALL_PROCESS_EVERY", &mut self.process_every);
        env_parse(env, "ROLLCALL_DOWNSAMPLE", &mut self.downsample);
        env_parse(env, "ROLLCALL_JPEG_QUALITY", &mut self.jpeg_quality);
        env_parse(env, "ROLLCALL_HTTP_ADDR", &mut self.http_addr);
        if let Some(v) = env("ROLLCALL_RETAIN_OVERLAY") {
            self.retain_overlay = v != "0";
        }
        if let Some(v) = env("ROLLCALL_SESSION_BUS") {
            self.session_bus = v != "0";
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        ThresholdPolicy::new(self.draw_threshold, self.commit_threshold)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.process_every == 0 {
            return Err(ConfigError::Invalid("process_every must be at least 1".into()));
        }
        if self.downsample == 0 {
            return Err(ConfigError::Invalid("downsample must be at least 1".into()));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality must be in 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if self.capture_width == 0 || self.capture_height == 0 {
            return Err(ConfigError::Invalid("capture size must be non-zero".into()));
        }
        Ok(())
    }

    /// Validated threshold pair.
    pub fn thresholds(&self) -> Result<ThresholdPolicy, ConfigError> {
        ThresholdPolicy::new(self.draw_threshold, self.commit_threshold)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    pub fn encoder_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.encoder_model)
    }
}

fn parse_file(path: &Path, text: &str) -> Result<FileConfig, ConfigError> {
    toml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = env(key) else { return };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        // An explicitly named but missing file is an error...
        let err = Config::load_with(env_from(&[("ROLLCALL_CONFIG", missing.to_str().unwrap())]));
        assert!(matches!(err, Err(ConfigError::Read { .. })));

        // ...while defaults alone validate.
        let defaults = Config::defaults(&env_from(&[("XDG_DATA_HOME", "/data")]));
        defaults.validate().unwrap();
        assert_eq!(defaults.db_path, PathBuf::from("/data/rollcall/attendance.db"));
        assert_eq!(defaults.draw_threshold, 0.5);
        assert_eq!(defaults.commit_threshold, 0.4);
        assert_eq!(defaults.process_every, 3);
        assert_eq!(defaults.downsample, 4);
        assert_eq!(defaults.jpeg_quality, 85);
        assert!(defaults.retain_overlay);
    }

    #[test]
    fn test_home_fallback_for_data_dir() {
        let config = Config::defaults(&env_from(&[("HOME", "/home/kim")]));
        assert_eq!(
            config.db_path,
            PathBuf::from("/home/kim/.local/share/rollcall/attendance.db")
        );
    }

    #[test]
    fn test_file_then_env_layering() {
        let file = config_file(
            r#"
            camera_device = "/dev/video4"
            commit_threshold = 0.35
            jpeg_quality = 70
            http_addr = "0.0.0.0:9000"
            "#,
        );
        let config = Config::load_with(env_from(&[
            ("ROLLCALL_CONFIG", file.path().to_str().unwrap()),
            ("ROLLCALL_JPEG_QUALITY", "90"),
            ("ROLLCALL_RETAIN_OVERLAY", "0"),
        ]))
        .unwrap();

        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.commit_threshold, 0.35);
        assert_eq!(config.jpeg_quality, 90);
        assert!(!config.retain_overlay);
        assert_eq!(config.http_addr, "0.0.0.0:9000".parse().unwrap());
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let file = config_file("similarity_threshold = 0.4\n");
        let err = Config::load_with(env_from(&[("ROLLCALL_CONFIG", file.path().to_str().unwrap())]));
        assert!(matches!(err, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_unparsable_env_keeps_value() {
        let mut config = Config::defaults(&env_from(&[]));
        config.apply_env(&env_from(&[("ROLLCALL_PROCESS_EVERY", "often")]));
        assert_eq!(config.process_every, 3);
    }

    #[test]
    fn test_commit_above_draw_rejected() {
        let mut config = Config::defaults(&env_from(&[]));
        config.commit_threshold = 0.6;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_throttle_and_quality_rejected() {
        let mut config = Config::defaults(&env_from(&[]));
        config.process_every = 0;
        assert!(config.validate().is_err());

        let mut config = Config::defaults(&env_from(&[]));
        config.jpeg_quality = 0;
        assert!(config.validate().is_err());

        let mut config = Config::defaults(&env_from(&[]));
        config.downsample = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_paths() {
        let mut config = Config::defaults(&env_from(&[]));
        config.model_dir = PathBuf::from("/models");
        assert_eq!(config.detector_model_path(), PathBuf::from("/models/det_10g.onnx"));
        assert_eq!(
            config.encoder_model_path(),
            PathBuf::from("/models/face_encoder_128.onnx")
        );
    }
}
