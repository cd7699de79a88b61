//! On-disk photo dataset: one subdirectory per identity.
//!
//! ```text
//! dataset/
//!   alice/ 1697040000.123456.jpg ...
//!   bob/   ...
//! review/  unknown faces awaiting manual labelling
//! ```

use crate::model::SubjectNames;
use crate::types::ImageSize;
use image::imageops::FilterType;
use image::GrayImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("no dataset found at '{0}'")]
    NotFound(String),
    #[error("dataset at '{0}' contains no readable images")]
    Empty(String),
    #[error("dataset I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("image encoding: {0}")]
    Image(#[from] image::ImageError),
}

/// Labelled face images ready for training.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub images: Vec<GrayImage>,
    pub labels: Vec<usize>,
    pub subject_names: SubjectNames,
    pub image_size: ImageSize,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Sorted identity subdirectories of `root`.
fn subject_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>, DatasetError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 subject directory");
            continue;
        };
        dirs.push((name, entry.path()));
    }
    dirs.sort();
    Ok(dirs)
}

/// Read every image under `root`, converting to grayscale and resizing to `size`.
///
/// Each subdirectory gets the next integer label in sorted order, whether or
/// not it holds any readable image. Files that fail to decode are skipped.
pub fn load_dataset(root: &Path, size: ImageSize) -> Result<TrainingSet, DatasetError> {
    if !root.is_dir() {
        return Err(DatasetError::NotFound(root.display().to_string()));
    }

    let mut images = Vec::new();
    let mut labels = Vec::new();
    let mut names = Vec::new();

    for (label, (name, dir)) in subject_dirs(root)?.into_iter().enumerate() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        let before = images.len();
        for file in files {
            match image::open(&file) {
                Ok(img) => {
                    let gray = img.to_luma8();
                    images.push(image::imageops::resize(
                        &gray,
                        size.width,
                        size.height,
                        FilterType::Triangle,
                    ));
                    labels.push(label);
                }
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "skipping unreadable image");
                }
            }
        }
        tracing::debug!(subject = %name, label, images = images.len() - before, "subject loaded");
        names.push(name);
    }

    if images.is_empty() {
        return Err(DatasetError::Empty(root.display().to_string()));
    }

    tracing::info!(
        path = %root.display(),
        subjects = names.len(),
        images = images.len(),
        "dataset loaded"
    );

    Ok(TrainingSet {
        images,
        labels,
        subject_names: SubjectNames::new(names),
        image_size: size,
    })
}

/// Number of regular files in a subject's directory.
pub fn photo_count(dir: &Path) -> Result<usize, DatasetError> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        if entry?.file_type()?.is_file() {
            count += 1;
        }
    }
    Ok(count)
}

/// Wall-clock file stem, `seconds.micros`.
fn timestamp_stem() -> String {
    let now = chrono::Utc::now();
    format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros())
}

/// Writes captured faces back to disk: unknowns to the review folder,
/// heuristic matches into the matched subject's training directory.
#[derive(Debug, Clone)]
pub struct DatasetWriter {
    dataset_dir: Option<PathBuf>,
    review_dir: PathBuf,
    photo_cap: usize,
}

impl DatasetWriter {
    pub fn new(dataset_dir: impl Into<PathBuf>, review_dir: impl Into<PathBuf>, photo_cap: usize) -> Self {
        Self {
            dataset_dir: Some(dataset_dir.into()),
            review_dir: review_dir.into(),
            photo_cap,
        }
    }

    /// Writer for a run without a dataset: review captures only.
    pub fn review_only(review_dir: impl Into<PathBuf>) -> Self {
        Self {
            dataset_dir: None,
            review_dir: review_dir.into(),
            photo_cap: 0,
        }
    }

    /// Save an unrecognised face for manual review.
    pub fn save_review(&self, face: &GrayImage) -> Result<PathBuf, DatasetError> {
        std::fs::create_dir_all(&self.review_dir)?;
        let path = self.review_dir.join(format!("{}.jpg", timestamp_stem()));
        face.save(&path)?;
        tracing::debug!(path = %path.display(), "saved face for review");
        Ok(path)
    }

    /// Add `face` to `subject`'s training photos unless the subject already
    /// has `photo_cap` photos or has no directory, or the writer has no dataset.
    ///
    /// The count and the write are not atomic with respect to the retrainer's
    /// directory scan; an extra photo past the cap is tolerated.
    pub fn save_augmentation(&self, subject: &str, face: &GrayImage) -> Result<Option<PathBuf>, DatasetError> {
        let Some(dir) = self.dataset_dir.as_ref().map(|d| d.join(subject)) else {
            return Ok(None);
        };
        if !dir.is_dir() {
            return Ok(None);
        }
        let count = photo_count(&dir)?;
        if count >= self.photo_cap {
            tracing::debug!(subject, count, cap = self.photo_cap, "photo cap reached");
            return Ok(None);
        }
        let path = dir.join(format!("{}.jpg", timestamp_stem()));
        face.save(&path)?;
        tracing::info!(subject, path = %path.display(), "added training photo");
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_face(dir: &Path, file: &str, value: u8) {
        std::fs::create_dir_all(dir).unwrap();
        GrayImage::from_pixel(8, 8, image::Luma([value]))
            .save(dir.join(file))
            .unwrap();
    }

    #[test]
    fn test_load_dataset_labels_in_sorted_order() {
        let root = tempfile::tempdir().unwrap();
        write_face(&root.path().join("bob"), "1.png", 200);
        write_face(&root.path().join("alice"), "1.png", 10);
        write_face(&root.path().join("alice"), "2.png", 12);

        let set = load_dataset(root.path(), ImageSize::new(4, 4)).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.labels, vec![0, 0, 1]);
        assert_eq!(set.subject_names.name(0).unwrap(), "alice");
        assert_eq!(set.subject_names.name(1).unwrap(), "bob");
        assert!(set.images.iter().all(|i| i.dimensions() == (4, 4)));
    }

    #[test]
    fn test_load_dataset_skips_unreadable_files() {
        let root = tempfile::tempdir().unwrap();
        write_face(&root.path().join("alice"), "1.png", 10);
        std::fs::write(root.path().join("alice/notes.txt"), b"not an image").unwrap();
        std::fs::write(root.path().join("alice/broken.jpg"), b"\xff\xd8garbage").unwrap();

        let set = load_dataset(root.path(), ImageSize::new(4, 4)).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_load_dataset_keeps_label_for_empty_subject() {
        let root = tempfile::tempdir().unwrap();
        write_face(&root.path().join("alice"), "1.png", 10);
        std::fs::create_dir_all(root.path().join("bob")).unwrap();
        write_face(&root.path().join("carol"), "1.png", 90);

        let set = load_dataset(root.path(), ImageSize::new(4, 4)).unwrap();
        assert_eq!(set.labels, vec![0, 2]);
        assert_eq!(set.subject_names.len(), 3);
    }

    #[test]
    fn test_load_dataset_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let err = load_dataset(&root.path().join("nope"), ImageSize::new(4, 4)).unwrap_err();
        assert!(matches!(err, DatasetError::NotFound(_)));
    }

    #[test]
    fn test_load_dataset_empty() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("alice")).unwrap();
        let err = load_dataset(root.path(), ImageSize::new(4, 4)).unwrap_err();
        assert!(matches!(err, DatasetError::Empty(_)));
    }

    #[test]
    fn test_save_review() {
        let root = tempfile::tempdir().unwrap();
        let writer = DatasetWriter::new(root.path().join("dataset"), root.path().join("review"), 100);
        let path = writer
            .save_review(&GrayImage::from_pixel(4, 4, image::Luma([1])))
            .unwrap();
        assert!(path.exists());
        assert_eq!(path.extension().unwrap(), "jpg");
    }

    #[test]
    fn test_save_augmentation_respects_cap() {
        let root = tempfile::tempdir().unwrap();
        let dataset = root.path().join("dataset");
        write_face(&dataset.join("alice"), "1.png", 10);
        write_face(&dataset.join("alice"), "2.png", 10);
        let face = GrayImage::from_pixel(4, 4, image::Luma([1]));

        let capped = DatasetWriter::new(&dataset, root.path().join("review"), 2);
        assert!(capped.save_augmentation("alice", &face).unwrap().is_none());

        let open = DatasetWriter::new(&dataset, root.path().join("review"), 3);
        assert!(open.save_augmentation("alice", &face).unwrap().is_some());
        assert_eq!(photo_count(&dataset.join("alice")).unwrap(), 3);
    }

    #[test]
    fn test_save_augmentation_unknown_subject_dir() {
        let root = tempfile::tempdir().unwrap();
        let writer = DatasetWriter::new(root.path(), root.path().join("review"), 100);
        let face = GrayImage::from_pixel(4, 4, image::Luma([1]));
        assert!(writer.save_augmentation("ghost", &face).unwrap().is_none());
    }

    #[test]
    fn test_review_only_never_augments() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("alice")).unwrap();
        let writer = DatasetWriter::review_only(root.path().join("review"));
        let face = GrayImage::from_pixel(4, 4, image::Luma([1]));
        assert!(writer.save_augmentation("alice", &face).unwrap().is_none());
        assert!(writer.save_review(&face).unwrap().exists());
    }
}
