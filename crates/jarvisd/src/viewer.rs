//! Output side of the frame pipeline: overlay rendering and the snapshot viewer.

use crate::engine::{FaceOverlay, FrameReport};
use ab_glyph::{FontRef, InvalidFont, PxScale};
use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use jarvis_core::retrain::RetrainState;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::watch;

const FONT_DATA: &[u8] = include_bytes!("../assets/fonts/DejaVuSansMono.ttf");

const INK: Luma<u8> = Luma([255]);
const PAPER: Luma<u8> = Luma([0]);
const BOX_THICKNESS: u32 = 2;
const MARKER_SIZE: u32 = 5;
const LABEL_SCALE: f32 = 14.0;
const STRIP_HEIGHT: u32 = 18;

#[derive(Error, Debug)]
pub enum ViewerError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: image::ImageError,
    },
    #[error("overlay font: {0}")]
    Font(#[from] InvalidFont),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerEvent {
    Continue,
    /// Operator asked to stop the pipeline.
    Exit,
}

/// Where annotated frames go.
pub trait Viewer: Send {
    fn show(&mut self, frame: &GrayImage, report: &FrameReport) -> Result<ViewerEvent, ViewerError>;
}

/// Draws face boxes, labels and the presence strip onto frames.
pub struct Overlay {
    font: FontRef<'static>,
    scale: PxScale,
}

impl Overlay {
    pub fn new() -> Result<Self, ViewerError> {
        Ok(Self {
            font: FontRef::try_from_slice(FONT_DATA)?,
            scale: PxScale::from(LABEL_SCALE),
        })
    }

    /// Annotated copy of `frame`. `status` is appended to the presence strip.
    pub fn render(&self, frame: &GrayImage, report: &FrameReport, status: Option<&str>) -> GrayImage {
        let mut out = frame.clone();
        for face in &report.faces {
            self.draw_face(&mut out, face);
        }
        self.draw_summary(&mut out, &summary(report, status));
        out
    }

    fn draw_face(&self, canvas: &mut GrayImage, face: &FaceOverlay) {
        let b = &face.bbox;
        for inset in 0..BOX_THICKNESS {
            let (w, h) = (b.width().saturating_sub(2 * inset), b.height().saturating_sub(2 * inset));
            if w == 0 || h == 0 {
                break;
            }
            let i = inset as i32;
            draw_hollow_rect_mut(canvas, Rect::at(b.x0 + i, b.y0 + i).of_size(w, h), INK);
        }
        if face.heuristic {
            let t = BOX_THICKNESS as i32;
            draw_filled_rect_mut(canvas, Rect::at(b.x0 + t, b.y0 + t).of_size(MARKER_SIZE, MARKER_SIZE), INK);
        }

        // Above the box when there is room, otherwise just inside it.
        let line = LABEL_SCALE as i32 + 2;
        let y = if b.y0 >= line { b.y0 - line } else { b.y0 + BOX_THICKNESS as i32 };
        draw_text_mut(canvas, INK, b.x0, y, self.scale, &self.font, &face.label());
    }

    fn draw_summary(&self, canvas: &mut GrayImage, text: &str) {
        let (width, height) = canvas.dimensions();
        if width == 0 || height < STRIP_HEIGHT {
            return;
        }
        let top = (height - STRIP_HEIGHT) as i32;
        draw_filled_rect_mut(canvas, Rect::at(0, top).of_size(width, STRIP_HEIGHT), PAPER);
        draw_text_mut(canvas, INK, 4, top + 2, self.scale, &self.font, text);
    }
}

/// `Present: alice, bob`, plus the status when one is given.
fn summary(report: &FrameReport, status: Option<&str>) -> String {
    let names: Vec<String> = report.present.iter().map(ToString::to_string).collect();
    let mut text = if names.is_empty() {
        "Present: nobody".to_string()
    } else {
        format!("Present: {}", names.join(", "))
    };
    if let Some(status) = status {
        text.push_str(" | ");
        text.push_str(status);
    }
    text
}

/// Writes the latest annotated frame to a JPEG file.
///
/// The file is replaced atomically so an external viewer never reads a
/// partial image.
pub struct SnapshotViewer {
    path: PathBuf,
    overlay: Overlay,
    retrain: Option<watch::Receiver<RetrainState>>,
    last_present: Option<String>,
}

impl SnapshotViewer {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ViewerError> {
        Ok(Self {
            path: path.into(),
            overlay: Overlay::new()?,
            retrain: None,
            last_present: None,
        })
    }

    /// Show a notice on the frame while the retrainer is busy.
    pub fn with_retrain_state(mut self, state: watch::Receiver<RetrainState>) -> Self {
        self.retrain = Some(state);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn status(&self) -> Option<&'static str> {
        let state = *self.retrain.as_ref()?.borrow();
        (state != RetrainState::Idle).then_some("Remodeling faces")
    }

    fn write(&self, image: &GrayImage) -> Result<(), ViewerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("part.jpg");
        image.save(&tmp).map_err(|source| ViewerError::Write {
            path: tmp.display().to_string(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Viewer for SnapshotViewer {
    fn show(&mut self, frame: &GrayImage, report: &FrameReport) -> Result<ViewerEvent, ViewerError> {
        let present = summary(report, None);
        if self.last_present.as_ref() != Some(&present) {
            tracing::info!("{present}");
            self.last_present = Some(present);
        }
        let annotated = self.overlay.render(frame, report, self.status());
        self.write(&annotated)?;
        Ok(ViewerEvent::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jarvis_core::{BoundingBox, Identity};

    fn face(name: &str, bbox: BoundingBox, heuristic: bool) -> FaceOverlay {
        FaceOverlay {
            bbox,
            identity: Identity::Known(name.into()),
            heuristic,
            distance: 12.4,
        }
    }

    fn report() -> FrameReport {
        FrameReport {
            faces: vec![
                face("alice", BoundingBox::new(10, 30, 50, 70), false),
                face("bob", BoundingBox::new(90, 30, 130, 70), true),
            ],
            present: vec![Identity::Known("alice".into()), Identity::Known("bob".into())],
            ..FrameReport::default()
        }
    }

    fn differing_rows(a: &GrayImage, b: &GrayImage) -> Vec<u32> {
        let mut rows: Vec<u32> = a
            .enumerate_pixels()
            .filter(|(x, y, p)| b.get_pixel(*x, *y) != *p)
            .map(|(_, y, _)| y)
            .collect();
        rows.dedup();
        rows
    }

    #[test]
    fn test_render_draws_box_outline() {
        let overlay = Overlay::new().unwrap();
        let frame = GrayImage::new(160, 120);
        let out = overlay.render(&frame, &report(), None);
        assert_eq!(out.get_pixel(10, 50), &INK);
        assert_eq!(out.get_pixel(11, 50), &INK);
        assert_eq!(out.get_pixel(30, 50), &PAPER);
        assert_eq!(frame.get_pixel(10, 50), &PAPER);
    }

    #[test]
    fn test_render_marks_heuristic_face_only() {
        let overlay = Overlay::new().unwrap();
        let out = overlay.render(&GrayImage::new(160, 120), &report(), None);
        assert_eq!(out.get_pixel(93, 33), &INK);
        assert_eq!(out.get_pixel(13, 33), &PAPER);
    }

    #[test]
    fn test_labels_are_drawn_above_box() {
        let overlay = Overlay::new().unwrap();
        let frame = GrayImage::new(160, 120);
        let mut renamed = report();
        renamed.faces[0].identity = Identity::Known("carol".into());

        let a = overlay.render(&frame, &report(), None);
        let b = overlay.render(&frame, &renamed, None);
        let rows = differing_rows(&a, &b);
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|&y| y < 30), "label changed pixels at rows {rows:?}");
    }

    #[test]
    fn test_label_inside_box_at_top_edge() {
        let overlay = Overlay::new().unwrap();
        let frame = GrayImage::new(160, 120);
        let top = |name: &str| FrameReport {
            faces: vec![face(name, BoundingBox::new(10, 0, 90, 60), false)],
            ..FrameReport::default()
        };
        let rows = differing_rows(&overlay.render(&frame, &top("alice"), None), &overlay.render(&frame, &top("carol"), None));
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|&y| y < 60));
    }

    #[test]
    fn test_presence_summary_drawn_along_bottom() {
        let overlay = Overlay::new().unwrap();
        let frame = GrayImage::new(160, 120);
        let mut alone = report();
        alone.present.truncate(1);

        let rows = differing_rows(&overlay.render(&frame, &report(), None), &overlay.render(&frame, &alone, None));
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|&y| y >= 120 - STRIP_HEIGHT));
    }

    #[test]
    fn test_summary_text() {
        assert_eq!(summary(&report(), None), "Present: alice, bob");
        assert_eq!(summary(&FrameReport::default(), Some("Remodeling faces")), "Present: nobody | Remodeling faces");
    }

    #[test]
    fn test_status_follows_retrain_state() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = watch::channel(RetrainState::Idle);
        let viewer = SnapshotViewer::new(dir.path().join("frame.jpg")).unwrap().with_retrain_state(rx);
        assert_eq!(viewer.status(), None);
        tx.send_replace(RetrainState::Building);
        assert_eq!(viewer.status(), Some("Remodeling faces"));
        tx.send_replace(RetrainState::Publishing);
        assert_eq!(viewer.status(), Some("Remodeling faces"));
    }

    #[test]
    fn test_snapshot_viewer_writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("view").join("frame.jpg");
        let mut viewer = SnapshotViewer::new(&path).unwrap();
        let event = viewer.show(&GrayImage::new(160, 120), &report()).unwrap();
        assert_eq!(event, ViewerEvent::Continue);

        let written = image::open(&path).unwrap();
        assert_eq!((written.width(), written.height()), (160, 120));
        assert!(!path.with_extension("part.jpg").exists());
    }
}
