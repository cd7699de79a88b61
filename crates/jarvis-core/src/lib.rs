//! jarvis-core: live face recognition runtime.
//!
//! Holds the swappable recognition model, the background retrainer that
//! rebuilds it from the photo dataset, the identity tracker, and the
//! spoken-announcement queue. Face detection runs via ONNX Runtime.

pub mod announce;
pub mod dataset;
pub mod detector;
pub mod model;
pub mod retrain;
pub mod store;
pub mod tracker;
pub mod types;
pub mod validate;

pub use announce::{Announcer, AudioCache, SpeechBackend, SpeechError, SpeechPool};
pub use dataset::{DatasetWriter, TrainingSet};
pub use detector::{FaceDetector, UltraFaceDetector};
pub use model::{Model, NearestNeighborTrainer, SubjectNames, Trainer};
pub use retrain::{Retrainer, RetrainerConfig};
pub use store::{ModelStore, Snapshot};
pub use tracker::{Capture, Resolution, Tracker, TrackerConfig};
pub use types::{BoundingBox, Detection, Identity, ImageSize};
