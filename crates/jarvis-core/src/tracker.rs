//! Identity tracking across frames.
//!
//! Two maps are kept:
//! - presence: every identity seen within the presence window, `Unknown`
//!   included. Drives greetings and the "who's here" summary.
//! - locations: last box of each known identity. Drives the proximity
//!   heuristic that keeps a name attached to a face whose distance briefly
//!   spikes (pose, lighting).
//!
//! An identity leaves both maps once it has not been seen for longer than
//! the presence window.

use crate::model::{ModelError, SubjectNames};
use crate::types::{BoundingBox, Detection, Identity};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Thresholds used when resolving detections.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Maximum model distance accepted as a confident match.
    pub accept_distance: f32,
    /// Per-edge pixel tolerance for the proximity heuristic.
    pub proximity_tolerance: u32,
    /// How long an identity stays present without being seen.
    pub presence_window: Duration,
    /// Minimum blur score for saving an unknown face for review.
    pub review_blur_threshold: f64,
    /// Minimum blur score for adding a heuristic match to the dataset.
    pub augment_blur_threshold: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            accept_distance: 200.0,
            proximity_tolerance: 50,
            presence_window: Duration::from_secs(5),
            review_blur_threshold: 400.0,
            augment_blur_threshold: 600.0,
        }
    }
}

/// Last known position of a known identity.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedIdentity {
    pub name: String,
    pub last_seen_at: Instant,
    pub last_box: BoundingBox,
}

/// What to do with the face crop of a resolved detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    None,
    /// Save to the review folder.
    Review,
    /// Save as a new training photo for this subject.
    Augment(String),
}

/// Outcome of [`Tracker::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub identity: Identity,
    /// Name assigned by proximity rather than by model confidence.
    pub heuristic: bool,
    /// First sighting in this visibility session; greet.
    pub greet: bool,
    pub capture: Capture,
}

pub struct Tracker {
    config: TrackerConfig,
    presence: HashMap<Identity, Instant>,
    locations: HashMap<String, TrackedIdentity>,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            presence: HashMap::new(),
            locations: HashMap::new(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Resolve one detection to an identity and record the sighting at `now`.
    pub fn resolve(
        &mut self,
        detection: &Detection,
        names: &SubjectNames,
        now: Instant,
    ) -> Result<Resolution, ModelError> {
        let (identity, heuristic) = if detection.distance <= self.config.accept_distance {
            (Identity::Known(names.name(detection.label)?.to_string()), false)
        } else {
            match self.nearest_tracked(&detection.bbox, &Identity::Unknown, now) {
                Some(name) => (Identity::Known(name), true),
                None => (Identity::Unknown, false),
            }
        };

        let capture = match &identity {
            Identity::Unknown if detection.blur_score > self.config.review_blur_threshold => Capture::Review,
            Identity::Known(name) if heuristic && detection.blur_score > self.config.augment_blur_threshold => {
                Capture::Augment(name.clone())
            }
            _ => Capture::None,
        };

        let greet = identity.is_known()
            && !self
                .presence
                .get(&identity)
                .is_some_and(|&seen| self.is_fresh(seen, now));

        self.presence.insert(identity.clone(), now);
        if let Identity::Known(name) = &identity {
            self.locations.insert(
                name.clone(),
                TrackedIdentity {
                    name: name.clone(),
                    last_seen_at: now,
                    last_box: detection.bbox,
                },
            );
        }

        Ok(Resolution {
            identity,
            heuristic,
            greet,
            capture,
        })
    }

    /// Closest fresh tracked identity within tolerance of `bbox`, other than
    /// `tentative`.
    fn nearest_tracked(&self, bbox: &BoundingBox, tentative: &Identity, now: Instant) -> Option<String> {
        self.locations
            .values()
            .filter(|t| t.name != tentative.name())
            .filter(|t| self.is_fresh(t.last_seen_at, now))
            .filter(|t| bbox.is_near(&t.last_box, self.config.proximity_tolerance))
            .min_by(|a, b| {
                bbox.max_edge_delta(&a.last_box)
                    .cmp(&bbox.max_edge_delta(&b.last_box))
                    .then_with(|| a.name.cmp(&b.name))
            })
            .map(|t| t.name.clone())
    }

    /// Seen within the presence window of `now`. Entries failing this are
    /// treated as gone even before [`Tracker::evict_stale`] removes them.
    fn is_fresh(&self, seen: Instant, now: Instant) -> bool {
        now.saturating_duration_since(seen) <= self.config.presence_window
    }

    /// Drop every identity last seen more than the presence window before `now`.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<Identity> {
        let stale: Vec<Identity> = self
            .presence
            .iter()
            .filter(|(_, &seen)| !self.is_fresh(seen, now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.presence.remove(id);
            if let Identity::Known(name) = id {
                self.locations.remove(name);
            }
            tracing::debug!(identity = %id, "no longer present");
        }
        stale
    }

    pub fn is_present(&self, identity: &Identity) -> bool {
        self.presence.contains_key(identity)
    }

    /// Currently present identities, sorted.
    pub fn present(&self) -> Vec<Identity> {
        let mut ids: Vec<Identity> = self.presence.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn location(&self, name: &str) -> Option<&TrackedIdentity> {
        self.locations.get(name)
    }

    pub fn tracked_count(&self) -> usize {
        self.locations.len()
    }
}
