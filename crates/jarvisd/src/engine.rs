//! Frame pipeline: capture, detect, identify, track, announce, display.
//!
//! Runs on a dedicated thread. Each frame uses the model snapshot current
//! when the frame started, so a retrain mid-frame never mixes models.

use crate::viewer::{Viewer, ViewerError, ViewerEvent};
use image::GrayImage;
use jarvis_core::detector::DetectorError;
use jarvis_core::tracker::Capture;
use jarvis_core::{
    Announcer, BoundingBox, DatasetWriter, Detection, FaceDetector, Identity, Model, ModelStore, Snapshot,
    Tracker,
};
use jarvis_hw::frame::{self, FrameError};
use jarvis_hw::{CameraError, FrameSource};
use std::time::Instant;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("viewer error: {0}")]
    Viewer(#[from] ViewerError),
    #[error("model store closed before a model was published")]
    NoModel,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One face as drawn on the output frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceOverlay {
    pub bbox: BoundingBox,
    pub identity: Identity,
    pub heuristic: bool,
    pub distance: f32,
}

impl FaceOverlay {
    /// `name`, `name*` for heuristic matches, followed by the rounded distance.
    pub fn label(&self) -> String {
        let marker = if self.heuristic { "*" } else { "" };
        format!("{}{} {}", self.identity, marker, self.distance.round())
    }
}

/// Everything that happened while processing one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub faces: Vec<FaceOverlay>,
    /// Identities present after eviction, sorted.
    pub present: Vec<Identity>,
    /// Greetings enqueued for this frame.
    pub greeted: Vec<String>,
    pub evicted: Vec<Identity>,
}

pub struct Engine<D: FaceDetector> {
    detector: D,
    tracker: Tracker,
    announcer: Announcer,
    writer: DatasetWriter,
}

impl<D: FaceDetector> Engine<D> {
    pub fn new(detector: D, tracker: Tracker, announcer: Announcer, writer: DatasetWriter) -> Self {
        Self {
            detector,
            tracker,
            announcer,
            writer,
        }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Detect and resolve every face in an already preprocessed frame.
    pub fn process_frame(&mut self, image: &GrayImage, model: &Model, now: Instant) -> Result<FrameReport, EngineError> {
        let mut report = FrameReport {
            evicted: self.tracker.evict_stale(now),
            ..FrameReport::default()
        };
        for identity in &report.evicted {
            tracing::info!(identity = %identity, "left view");
        }

        for bbox in self.detector.detect(image)? {
            let Some(face) = frame::crop_face(image, &bbox, model.image_size()) else {
                continue;
            };
            let prediction = match model.predict(&face) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, bbox = %bbox, "prediction failed");
                    continue;
                }
            };
            let detection = Detection {
                bbox,
                label: prediction.label,
                distance: prediction.distance,
                blur_score: frame::laplacian_variance(&face),
            };
            let resolution = match self.tracker.resolve(&detection, model.subject_names(), now) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, label = detection.label, "unresolvable detection");
                    continue;
                }
            };

            self.capture(&resolution.capture, &face);
            if resolution.greet {
                let greeting = format!("Hello {}", resolution.identity);
                tracing::info!(identity = %resolution.identity, "greeting");
                self.announcer.enqueue(greeting.clone());
                report.greeted.push(greeting);
            }
            report.faces.push(FaceOverlay {
                bbox,
                identity: resolution.identity,
                heuristic: resolution.heuristic,
                distance: detection.distance,
            });
        }

        report.present = self.tracker.present();
        Ok(report)
    }

    fn capture(&self, capture: &Capture, face: &GrayImage) {
        match capture {
            Capture::None => {}
            Capture::Review => {
                if let Err(e) = self.writer.save_review(face) {
                    tracing::warn!(error = %e, "failed to save review image");
                }
            }
            Capture::Augment(subject) => {
                if let Err(e) = self.writer.save_augmentation(subject, face) {
                    tracing::warn!(subject, error = %e, "failed to save training photo");
                }
            }
        }
    }

    /// Block until the first model is published, then process frames until
    /// shutdown, a viewer exit, or a capture failure.
    pub fn run<S: FrameSource, V: Viewer>(
        mut self,
        mut source: S,
        mut viewer: V,
        store: ModelStore,
        mut shutdown: watch::Receiver<bool>,
        runtime: Handle,
    ) -> Result<(), EngineError> {
        let first = runtime.block_on(async {
            tokio::select! {
                ready = store.wait_ready() => ready.map(Some).map_err(|_| EngineError::NoModel),
                _ = shutdown.wait_for(|stop| *stop) => Ok(None),
            }
        })?;
        let Some(mut snapshot) = first else {
            return Ok(());
        };
        tracing::info!(generation = snapshot.generation, "pipeline running");

        loop {
            if *shutdown.borrow() {
                break;
            }
            refresh(&store, &mut snapshot);

            let image = source.next_frame()?.into_image()?;
            let image = frame::preprocess(&image);
            let report = self.process_frame(&image, &snapshot.model, Instant::now())?;
            if viewer.show(&image, &report)? == ViewerEvent::Exit {
                tracing::info!("viewer closed");
                break;
            }
        }
        Ok(())
    }
}

fn refresh(store: &ModelStore, snapshot: &mut Snapshot) {
    if let Some(latest) = store.fetch() {
        if latest.generation != snapshot.generation {
            tracing::info!(generation = latest.generation, "switched to new model");
            *snapshot = latest;
        }
    }
}

/// Run the pipeline on its own thread. The receiver resolves when it stops.
pub fn spawn_engine<D, S, V>(
    engine: Engine<D>,
    source: S,
    viewer: V,
    store: ModelStore,
    shutdown: watch::Receiver<bool>,
) -> Result<oneshot::Receiver<Result<(), EngineError>>, EngineError>
where
    D: FaceDetector + 'static,
    S: FrameSource + 'static,
    V: Viewer + 'static,
{
    let runtime = Handle::current();
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("jarvis-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let result = engine.run(source, viewer, store, shutdown, runtime);
            if let Err(e) = &result {
                tracing::error!(error = %e, "pipeline stopped");
            }
            let _ = tx.send(result);
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;
    Ok(rx)
}
