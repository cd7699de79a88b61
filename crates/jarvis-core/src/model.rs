//! Recognition model: a trained classifier plus the metadata needed to use it.
//!
//! The built-in classifier is a 1-nearest-neighbour search with Euclidean
//! distance over resized grayscale pixels. Training goes through the
//! [`Trainer`] trait so the retrainer does not care which routine produced
//! the model it publishes.

use crate::dataset::TrainingSet;
use crate::types::ImageSize;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("label {0} has no subject name")]
    UnknownLabel(usize),
    #[error("face is {actual_w}x{actual_h}, model expects {expected}")]
    SizeMismatch {
        expected: ImageSize,
        actual_w: u32,
        actual_h: u32,
    },
    #[error("model has no training samples")]
    Empty,
    #[error("training set has {images} images but {labels} labels")]
    LabelCountMismatch { images: usize, labels: usize },
    #[error("model file not found: {0}")]
    NotFound(String),
    #[error("model I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("model encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Mapping from integer label to subject (identity) name.
///
/// Labels are assigned densely from zero in dataset enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectNames(Vec<String>);

impl SubjectNames {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    /// Name for `label`, or [`ModelError::UnknownLabel`] if the model never saw it.
    pub fn name(&self, label: usize) -> Result<&str, ModelError> {
        self.0
            .get(label)
            .map(String::as_str)
            .ok_or(ModelError::UnknownLabel(label))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.0.iter().enumerate().map(|(i, n)| (i, n.as_str()))
    }
}

/// Output of [`Model::predict`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: usize,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sample {
    label: usize,
    pixels: Vec<u8>,
}

/// 1-NN classifier over raw pixel vectors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NearestNeighbor {
    samples: Vec<Sample>,
}

impl NearestNeighbor {
    pub fn fit(images: &[GrayImage], labels: &[usize]) -> Result<Self, ModelError> {
        if images.len() != labels.len() {
            return Err(ModelError::LabelCountMismatch {
                images: images.len(),
                labels: labels.len(),
            });
        }
        if images.is_empty() {
            return Err(ModelError::Empty);
        }
        let samples = images
            .iter()
            .zip(labels)
            .map(|(img, &label)| Sample {
                label,
                pixels: img.as_raw().clone(),
            })
            .collect();
        Ok(Self { samples })
    }

    /// Nearest sample's label and its Euclidean distance.
    pub fn nearest(&self, pixels: &[u8]) -> Option<Prediction> {
        self.samples
            .iter()
            .map(|s| Prediction {
                label: s.label,
                distance: euclidean(&s.pixels, pixels),
            })
            .min_by(|a, b| {
                a.distance
                    .partial_cmp(&b.distance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn euclidean(a: &[u8], b: &[u8]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as f32 - y as f32;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// A trained, immutable recognition model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    image_size: ImageSize,
    subject_names: SubjectNames,
    classifier: NearestNeighbor,
}

impl Model {
    pub fn new(image_size: ImageSize, subject_names: SubjectNames, classifier: NearestNeighbor) -> Self {
        Self {
            image_size,
            subject_names,
            classifier,
        }
    }

    pub fn image_size(&self) -> ImageSize {
        self.image_size
    }

    pub fn subject_names(&self) -> &SubjectNames {
        &self.subject_names
    }

    pub fn sample_count(&self) -> usize {
        self.classifier.len()
    }

    /// Classify a face crop already resized to [`Model::image_size`].
    pub fn predict(&self, face: &GrayImage) -> Result<Prediction, ModelError> {
        if face.width() != self.image_size.width || face.height() != self.image_size.height {
            return Err(ModelError::SizeMismatch {
                expected: self.image_size,
                actual_w: face.width(),
                actual_h: face.height(),
            });
        }
        self.classifier.nearest(face.as_raw()).ok_or(ModelError::Empty)
    }

    /// Serialize to `path`, replacing any previous file atomically.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec(self)?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), "model saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Err(ModelError::NotFound(path.display().to_string()));
        }
        let bytes = std::fs::read(path)?;
        let model: Model = serde_json::from_slice(&bytes)?;
        tracing::info!(
            path = %path.display(),
            subjects = model.subject_names.len(),
            samples = model.sample_count(),
            size = %model.image_size,
            "model loaded"
        );
        Ok(model)
    }
}

/// Training routine that turns a labelled image set into a [`Model`].
pub trait Trainer: Send + Sync + 'static {
    fn train(&self, set: &TrainingSet) -> Result<Model, ModelError>;
}

/// Default trainer producing a [`NearestNeighbor`] model.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestNeighborTrainer;

impl Trainer for NearestNeighborTrainer {
    fn train(&self, set: &TrainingSet) -> Result<Model, ModelError> {
        let classifier = NearestNeighbor::fit(&set.images, &set.labels)?;
        Ok(Model::new(set.image_size, set.subject_names.clone(), classifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(size: ImageSize, value: u8) -> GrayImage {
        GrayImage::from_pixel(size.width, size.height, image::Luma([value]))
    }

    fn two_subject_set() -> TrainingSet {
        let size = ImageSize::new(4, 4);
        TrainingSet {
            images: vec![uniform(size, 10), uniform(size, 12), uniform(size, 200)],
            labels: vec![0, 0, 1],
            subject_names: SubjectNames::new(vec!["alice".into(), "bob".into()]),
            image_size: size,
        }
    }

    #[test]
    fn test_subject_names_lookup() {
        let names = SubjectNames::new(vec!["alice".into(), "bob".into()]);
        assert_eq!(names.name(1).unwrap(), "bob");
        assert!(matches!(names.name(2), Err(ModelError::UnknownLabel(2))));
    }

    #[test]
    fn test_predict_nearest_subject() {
        let model = NearestNeighborTrainer.train(&two_subject_set()).unwrap();
        let face = uniform(ImageSize::new(4, 4), 20);
        let p = model.predict(&face).unwrap();
        assert_eq!(p.label, 0);
        // 16 pixels each off by 8 from the closest sample (12)
        assert!((p.distance - 32.0).abs() < 1e-4, "got {}", p.distance);
    }

    #[test]
    fn test_distance_grows_with_face_size() {
        let size = ImageSize::new(100, 100);
        let set = TrainingSet {
            images: vec![uniform(size, 100)],
            labels: vec![0],
            subject_names: SubjectNames::new(vec!["alice".into()]),
            image_size: size,
        };
        let model = NearestNeighborTrainer.train(&set).unwrap();
        // sqrt(10_000 pixels) times the per-pixel difference
        let off_by_one = model.predict(&uniform(size, 101)).unwrap();
        assert!((off_by_one.distance - 100.0).abs() < 1e-2, "got {}", off_by_one.distance);
        let off_by_two = model.predict(&uniform(size, 98)).unwrap();
        assert!((off_by_two.distance - 200.0).abs() < 1e-2, "got {}", off_by_two.distance);
    }

    #[test]
    fn test_predict_rejects_wrong_size() {
        let model = NearestNeighborTrainer.train(&two_subject_set()).unwrap();
        let face = uniform(ImageSize::new(5, 4), 20);
        assert!(matches!(
            model.predict(&face),
            Err(ModelError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_fit_requires_samples() {
        assert!(matches!(NearestNeighbor::fit(&[], &[]), Err(ModelError::Empty)));
        let img = uniform(ImageSize::new(2, 2), 0);
        assert!(matches!(
            NearestNeighbor::fit(&[img], &[]),
            Err(ModelError::LabelCountMismatch { images: 1, labels: 0 })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models/my_model.json");
        let model = NearestNeighborTrainer.train(&two_subject_set()).unwrap();
        model.save(&path).unwrap();

        let loaded = Model::load(&path).unwrap();
        assert_eq!(loaded.image_size(), ImageSize::new(4, 4));
        assert_eq!(loaded.subject_names(), model.subject_names());
        assert_eq!(loaded.sample_count(), 3);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Model::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ModelError::NotFound(_)));
    }
}
