use jarvis_core::retrain::RetrainerConfig;
use jarvis_core::types::ParseSizeError;
use jarvis_core::{ImageSize, TrackerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: String, value: String },
    #[error(transparent)]
    Size(#[from] ParseSizeError),
    #[error("no {what} found at '{path}'")]
    Missing { what: &'static str, path: String },
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file, then `JARVIS_*`
/// environment variables, then command-line flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Camera index N, opened as /dev/videoN.
    pub camera_index: u32,
    /// ONNX face detector model.
    pub detector_model: PathBuf,
    /// Minimum detector score for a face, in (0, 1].
    pub detector_confidence: f32,
    /// Photo dataset; when set the model is retrained from it periodically.
    pub dataset_dir: Option<PathBuf>,
    /// Model file for warm start, rewritten after every retrain.
    pub model_path: PathBuf,
    /// Face size for training and prediction.
    pub image_size: ImageSize,
    /// Run k-fold cross validation on the dataset before starting.
    pub validate_folds: Option<usize>,
    /// Where unrecognised sharp faces are saved.
    pub review_dir: PathBuf,
    /// Rendered utterance cache.
    pub audio_dir: PathBuf,
    /// Annotated frame output.
    pub snapshot_path: PathBuf,
    pub retrain_interval_secs: u64,
    pub speech_workers: usize,
    pub speech_lang: String,
    /// Command that plays rendered MP3 files.
    pub speech_player: String,
    /// Largest recognizer distance accepted as a match. The built-in
    /// recognizer measures raw pixel Euclidean distance, which grows with
    /// the face size: at 100x100 a mean difference of 2 per pixel is 200.
    pub accept_distance: f32,
    pub proximity_tolerance: u32,
    pub presence_window_secs: f64,
    pub review_blur_threshold: f64,
    pub augment_blur_threshold: f64,
    /// Maximum photos per subject before self-augmentation stops.
    pub photo_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_index: 0,
            detector_model: PathBuf::from("version-RFB-320.onnx"),
            detector_confidence: 0.7,
            dataset_dir: None,
            model_path: PathBuf::from("jarvis-model.json"),
            image_size: ImageSize::default(),
            validate_folds: None,
            review_dir: PathBuf::from("review"),
            audio_dir: PathBuf::from("audio"),
            snapshot_path: PathBuf::from("jarvis-view.jpg"),
            retrain_interval_secs: 600,
            speech_workers: 1,
            speech_lang: "en".to_string(),
            speech_player: "mpg123".to_string(),
            accept_distance: 200.0,
            proximity_tolerance: 50,
            presence_window_secs: 5.0,
            review_blur_threshold: 400.0,
            augment_blur_threshold: 600.0,
            photo_cap: 100,
        }
    }
}

/// Optional overrides as read from a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_index: Option<u32>,
    detector_model: Option<PathBuf>,
    detector_confidence: Option<f32>,
    dataset_dir: Option<PathBuf>,
    model_path: Option<PathBuf>,
    image_size: Option<String>,
    validate_folds: Option<usize>,
    review_dir: Option<PathBuf>,
    audio_dir: Option<PathBuf>,
    snapshot_path: Option<PathBuf>,
    retrain_interval_secs: Option<u64>,
    speech_workers: Option<usize>,
    speech_lang: Option<String>,
    speech_player: Option<String>,
    accept_distance: Option<f32>,
    proximity_tolerance: Option<u32>,
    presence_window_secs: Option<f64>,
    review_blur_threshold: Option<f64>,
    augment_blur_threshold: Option<f64>,
    photo_cap: Option<usize>,
}

macro_rules! overlay {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(if let Some(v) = $src.$field { $dst.$field = v; })+
    };
}

impl Config {
    /// Defaults, then `file` (if any), then the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = file {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            config.apply_toml(&text)?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_toml(&mut self, text: &str) -> Result<(), ConfigError> {
        let file: FileConfig = toml::from_str(text)?;
        if let Some(size) = &file.image_size {
            self.image_size = size.parse()?;
        }
        if file.dataset_dir.is_some() {
            self.dataset_dir = file.dataset_dir.clone();
        }
        overlay!(
            self,
            file,
            camera_index,
            detector_model,
            detector_confidence,
            model_path,
            review_dir,
            audio_dir,
            snapshot_path,
            retrain_interval_secs,
            speech_workers,
            speech_lang,
            speech_player,
            accept_distance,
            proximity_tolerance,
            presence_window_secs,
            review_blur_threshold,
            augment_blur_threshold,
            photo_cap,
        );
        if file.validate_folds.is_some() {
            self.validate_folds = file.validate_folds;
        }
        Ok(())
    }

    /// Apply `JARVIS_*` variables as returned by `get`.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let path = |key: &str| get(key).map(PathBuf::from);

        if let Some(v) = env_parse(&get, "JARVIS_CAMERA_INDEX")? {
            self.camera_index = v;
        }
        if let Some(v) = path("JARVIS_DETECTOR_MODEL") {
            self.detector_model = v;
        }
        if let Some(v) = env_parse(&get, "JARVIS_DETECTOR_CONFIDENCE")? {
            self.detector_confidence = v;
        }
        if let Some(v) = path("JARVIS_DATASET") {
            self.dataset_dir = Some(v);
        }
        if let Some(v) = path("JARVIS_MODEL_PATH") {
            self.model_path = v;
        }
        if let Some(v) = get("JARVIS_IMAGE_SIZE") {
            self.image_size = v.parse()?;
        }
        if let Some(v) = path("JARVIS_REVIEW_DIR") {
            self.review_dir = v;
        }
        if let Some(v) = path("JARVIS_AUDIO_DIR") {
            self.audio_dir = v;
        }
        if let Some(v) = path("JARVIS_SNAPSHOT_PATH") {
            self.snapshot_path = v;
        }
        if let Some(v) = env_parse(&get, "JARVIS_RETRAIN_INTERVAL_SECS")? {
            self.retrain_interval_secs = v;
        }
        if let Some(v) = env_parse(&get, "JARVIS_SPEECH_WORKERS")? {
            self.speech_workers = v;
        }
        if let Some(v) = get("JARVIS_SPEECH_LANG") {
            self.speech_lang = v;
        }
        if let Some(v) = get("JARVIS_SPEECH_PLAYER") {
            self.speech_player = v;
        }
        if let Some(v) = env_parse(&get, "JARVIS_ACCEPT_DISTANCE")? {
            self.accept_distance = v;
        }
        if let Some(v) = env_parse(&get, "JARVIS_PROXIMITY_TOLERANCE")? {
            self.proximity_tolerance = v;
        }
        if let Some(v) = env_parse(&get, "JARVIS_PRESENCE_WINDOW_SECS")? {
            self.presence_window_secs = v;
        }
        if let Some(v) = env_parse(&get, "JARVIS_REVIEW_BLUR")? {
            self.review_blur_threshold = v;
        }
        if let Some(v) = env_parse(&get, "JARVIS_AUGMENT_BLUR")? {
            self.augment_blur_threshold = v;
        }
        if let Some(v) = env_parse(&get, "JARVIS_PHOTO_CAP")? {
            self.photo_cap = v;
        }
        Ok(())
    }

    /// Startup checks that must pass before any background unit starts.
    pub fn check_startup(&self) -> Result<(), ConfigError> {
        match &self.dataset_dir {
            Some(dir) if !dir.is_dir() => {
                return Err(ConfigError::Missing {
                    what: "dataset",
                    path: dir.display().to_string(),
                })
            }
            None if !self.model_path.is_file() => {
                return Err(ConfigError::Missing {
                    what: "prediction model",
                    path: self.model_path.display().to_string(),
                })
            }
            _ => {}
        }
        if !self.detector_model.is_file() {
            return Err(ConfigError::Missing {
                what: "face detector model",
                path: self.detector_model.display().to_string(),
            });
        }
        if self.validate_folds.is_some() && self.dataset_dir.is_none() {
            return Err(ConfigError::Invalid {
                key: "validate".into(),
                value: "cross validation needs a dataset (--train)".into(),
            });
        }
        if !(self.detector_confidence > 0.0 && self.detector_confidence <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "detector_confidence".into(),
                value: self.detector_confidence.to_string(),
            });
        }
        self.tracker_config()?;
        Ok(())
    }

    /// Tracker settings; fails when the presence window is not a valid duration.
    pub fn tracker_config(&self) -> Result<TrackerConfig, ConfigError> {
        let presence_window =
            Duration::try_from_secs_f64(self.presence_window_secs).map_err(|_| ConfigError::Invalid {
                key: "presence_window_secs".into(),
                value: self.presence_window_secs.to_string(),
            })?;
        Ok(TrackerConfig {
            accept_distance: self.accept_distance,
            proximity_tolerance: self.proximity_tolerance,
            presence_window,
            review_blur_threshold: self.review_blur_threshold,
            augment_blur_threshold: self.augment_blur_threshold,
        })
    }

    /// Retrainer settings, if a dataset is configured.
    pub fn retrainer_config(&self) -> Option<RetrainerConfig> {
        self.dataset_dir.as_ref().map(|dir| RetrainerConfig {
            dataset_dir: dir.clone(),
            image_size: self.image_size,
            interval: Duration::from_secs(self.retrain_interval_secs),
            model_path: Some(self.model_path.clone()),
        })
    }
}

fn env_parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError> {
    match get(key) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.image_size, ImageSize::new(100, 100));
        assert_eq!(c.retrain_interval_secs, 600);
        assert_eq!(c.detector_confidence, 0.7);
        assert_eq!(c.speech_player, "mpg123");
        let t = c.tracker_config().unwrap();
        assert_eq!(t.accept_distance, 200.0);
        assert_eq!(t.proximity_tolerance, 50);
        assert_eq!(t.presence_window, Duration::from_secs(5));
        assert!(c.retrainer_config().is_none());
    }

    #[test]
    fn test_env_overrides() {
        let mut c = Config::default();
        c.apply_env(env(&[
            ("JARVIS_CAMERA_INDEX", "2"),
            ("JARVIS_IMAGE_SIZE", "92x112"),
            ("JARVIS_DATASET", "pictures"),
            ("JARVIS_PRESENCE_WINDOW_SECS", "2.5"),
            ("JARVIS_DETECTOR_CONFIDENCE", "0.55"),
            ("JARVIS_SPEECH_PLAYER", "mpv"),
        ]))
        .unwrap();
        assert_eq!(c.camera_index, 2);
        assert_eq!(c.image_size, ImageSize::new(92, 112));
        assert_eq!(c.dataset_dir.as_deref(), Some(Path::new("pictures")));
        assert_eq!(c.tracker_config().unwrap().presence_window, Duration::from_millis(2500));
        assert_eq!(c.detector_confidence, 0.55);
        assert_eq!(c.speech_player, "mpv");

        let r = c.retrainer_config().unwrap();
        assert_eq!(r.interval, Duration::from_secs(600));
        assert_eq!(r.model_path.as_deref(), Some(Path::new("jarvis-model.json")));
    }

    #[test]
    fn test_env_invalid_value() {
        let mut c = Config::default();
        let err = c.apply_env(env(&[("JARVIS_SPEECH_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        let err = c.apply_env(env(&[("JARVIS_IMAGE_SIZE", "100by100")])).unwrap_err();
        assert!(matches!(err, ConfigError::Size(_)));
    }

    #[test]
    fn test_toml_overrides() {
        let mut c = Config::default();
        c.apply_toml(
            r#"
            camera_index = 1
            image_size = "64x64"
            dataset_dir = "faces"
            speech_workers = 2
            photo_cap = 50
            "#,
        )
        .unwrap();
        assert_eq!(c.camera_index, 1);
        assert_eq!(c.image_size, ImageSize::new(64, 64));
        assert_eq!(c.speech_workers, 2);
        assert_eq!(c.photo_cap, 50);
        assert_eq!(c.dataset_dir.as_deref(), Some(Path::new("faces")));
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        let mut c = Config::default();
        assert!(matches!(c.apply_toml("camera = 1"), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_check_startup_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let detector = dir.path().join("det.onnx");
        std::fs::write(&detector, b"onnx").unwrap();

        let mut c = Config {
            detector_model: detector.clone(),
            model_path: dir.path().join("absent.json"),
            ..Config::default()
        };
        assert!(matches!(
            c.check_startup(),
            Err(ConfigError::Missing { what: "prediction model", .. })
        ));

        c.dataset_dir = Some(dir.path().join("nope"));
        assert!(matches!(c.check_startup(), Err(ConfigError::Missing { what: "dataset", .. })));

        c.dataset_dir = Some(dir.path().to_path_buf());
        assert!(c.check_startup().is_ok());

        c.detector_model = dir.path().join("missing.onnx");
        assert!(matches!(
            c.check_startup(),
            Err(ConfigError::Missing { what: "face detector model", .. })
        ));
    }

    #[test]
    fn test_presence_window_must_be_a_duration() {
        for secs in [f64::INFINITY, f64::NAN, -1.0, 1e300] {
            let c = Config {
                presence_window_secs: secs,
                ..Config::default()
            };
            assert!(
                matches!(c.tracker_config(), Err(ConfigError::Invalid { ref key, .. }) if key == "presence_window_secs"),
                "accepted {secs}"
            );
        }
    }

    #[test]
    fn test_check_startup_rejects_bad_tuning() {
        let dir = tempfile::tempdir().unwrap();
        let detector = dir.path().join("det.onnx");
        std::fs::write(&detector, b"onnx").unwrap();
        let valid = Config {
            detector_model: detector,
            dataset_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        assert!(valid.check_startup().is_ok());

        let inf_window = Config {
            presence_window_secs: f64::INFINITY,
            ..valid.clone()
        };
        assert!(matches!(inf_window.check_startup(), Err(ConfigError::Invalid { .. })));

        for confidence in [0.0, 1.5, f32::NAN] {
            let c = Config {
                detector_confidence: confidence,
                ..valid.clone()
            };
            assert!(matches!(c.check_startup(), Err(ConfigError::Invalid { ref key, .. }) if key == "detector_confidence"));
        }
    }
}
