//! K-fold cross validation of a [`Trainer`] on a dataset.

use crate::dataset::TrainingSet;
use crate::model::{ModelError, Trainer};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidateError {
    #[error("need at least 2 folds and no more folds than images, got k={k} for {images} images")]
    InvalidFolds { k: usize, images: usize },
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FoldResult {
    pub fold: usize,
    pub correct: usize,
    pub total: usize,
}

impl FoldResult {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub folds: Vec<FoldResult>,
}

impl ValidationReport {
    /// Accuracy over all held-out predictions.
    pub fn accuracy(&self) -> f64 {
        let total: usize = self.folds.iter().map(|f| f.total).sum();
        let correct: usize = self.folds.iter().map(|f| f.correct).sum();
        if total == 0 {
            0.0
        } else {
            correct as f64 / total as f64
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for fold in &self.folds {
            writeln!(
                f,
                "fold {:>2}: {:>4}/{:<4} correct ({:.1}%)",
                fold.fold + 1,
                fold.correct,
                fold.total,
                fold.accuracy() * 100.0
            )?;
        }
        write!(f, "overall accuracy: {:.1}%", self.accuracy() * 100.0)
    }
}

/// Fold index of every sample: each subject's images are dealt round-robin.
fn assign_folds(labels: &[usize], k: usize) -> Vec<usize> {
    let mut seen: HashMap<usize, usize> = HashMap::new();
    labels
        .iter()
        .map(|label| {
            let n = seen.entry(*label).or_insert(0);
            let fold = *n % k;
            *n += 1;
            fold
        })
        .collect()
}

fn subset(set: &TrainingSet, idx: &[usize]) -> TrainingSet {
    TrainingSet {
        images: idx.iter().map(|&i| set.images[i].clone()).collect(),
        labels: idx.iter().map(|&i| set.labels[i]).collect(),
        subject_names: set.subject_names.clone(),
        image_size: set.image_size,
    }
}

pub fn kfold<T: Trainer + ?Sized>(trainer: &T, set: &TrainingSet, k: usize) -> Result<ValidationReport, ValidateError> {
    if k < 2 || k > set.len() {
        return Err(ValidateError::InvalidFolds { k, images: set.len() });
    }

    let folds = assign_folds(&set.labels, k);
    let mut report = ValidationReport::default();

    for fold in 0..k {
        let (test_idx, train_idx): (Vec<usize>, Vec<usize>) = (0..set.len()).partition(|&i| folds[i] == fold);
        if train_idx.is_empty() {
            continue;
        }
        let model = trainer.train(&subset(set, &train_idx))?;

        let mut correct = 0;
        for &i in &test_idx {
            if model.predict(&set.images[i])?.label == set.labels[i] {
                correct += 1;
            }
        }
        tracing::debug!(fold, correct, total = test_idx.len(), "fold validated");
        report.folds.push(FoldResult {
            fold,
            correct,
            total: test_idx.len(),
        });
    }

    Ok(report)
}
