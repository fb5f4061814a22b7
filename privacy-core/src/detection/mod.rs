//! detection — per-frame detector output and the ONNX SSD backend
//!
//! The detector is an opaque producer of a fixed number of scored boxes.
//! `DetectionSet` holds them in slots that are overwritten in place every
//! frame; `ObjectDetector` is the capability the pipeline calls.  `SsdDetector`
//! implements it for a MobileNet-SSD style model exported to ONNX.

use anyhow::{bail, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::rect::Rect;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

mod labels;
mod segmentation;

pub use labels::coco_label;
pub use segmentation::{
    mask_background, segmentation_size, DeepLabSegmenter, DeepLabTensorNames, LabelMap,
    SegmentationMasker, SegmentationParams, Segmenter, BACKGROUND_FILL,
    DEFAULT_SEGMENTATION_SIZE, PERSON_CLASS,
};

// ── Constants ────────────────────────────────────────────────────────────────

/// Output count of the SSD post-processor.
pub const SSD_NUM_BOXES: usize = 100;
/// A canvas whose mean green channel is below this (out of 255) is treated as
/// a covered lens / no signal.
const BLACK_FRAME_GREEN_LEVEL: u64 = 13;
/// Pixel → [-1, 1] input scale (2 / 255).
const INPUT_SCALE: f32 = 0.007_843_137_7;

// ── Public types ─────────────────────────────────────────────────────────────

/// A detected or tracked region in normalized canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    pub top: f32,
    pub left: f32,
    pub bottom: f32,
    pub right: f32,
    pub class_id: i32,
    pub label: &'static str,
    pub score: f32,
    pub is_tracked: bool,
}

impl BBox {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }
    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    /// Clamp to the unit square and order the corners so that
    /// `top <= bottom` and `left <= right`.  NaN becomes 0.
    pub fn sanitize(&mut self) {
        let (t, b) = (unit(self.top), unit(self.bottom));
        let (l, r) = (unit(self.left), unit(self.right));
        self.top = t.min(b);
        self.bottom = t.max(b);
        self.left = l.min(r);
        self.right = l.max(r);
        self.score = unit(self.score);
    }
}

fn unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// Fixed-capacity, ordered detector output.  Slots are allocated once and
/// rewritten in place; `len` is the number of slots the detector filled this
/// frame.
#[derive(Debug, Clone)]
pub struct DetectionSet {
    boxes: Vec<BBox>,
    len: usize,
}

impl DetectionSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            boxes: vec![BBox::default(); capacity],
            len: 0,
        }
    }

    /// Build a set holding exactly `boxes`.
    pub fn from_boxes(boxes: &[BBox]) -> Self {
        Self {
            boxes: boxes.to_vec(),
            len: boxes.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.boxes.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark the first `len` slots as live (capped at capacity).
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.boxes.len());
    }

    pub fn boxes(&self) -> &[BBox] {
        &self.boxes[..self.len]
    }

    pub fn boxes_mut(&mut self) -> &mut [BBox] {
        &mut self.boxes[..self.len]
    }

    /// Every slot, including ones past `len`, for detectors that write the
    /// full capacity.
    pub fn slots_mut(&mut self) -> &mut [BBox] {
        &mut self.boxes
    }

    pub fn clear_tracked(&mut self) {
        for b in self.boxes_mut() {
            b.is_tracked = false;
        }
    }

    pub fn tracked(&self) -> Option<&BBox> {
        self.boxes().iter().find(|b| b.is_tracked)
    }
}

/// What a detector did with a canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectOutcome {
    /// The set was refreshed for this frame.
    Ready,
    /// The input was rejected (e.g. near-black); no results this frame.
    Skipped,
}

/// Turns a fixed-size canvas into scored boxes.
pub trait ObjectDetector: Send {
    /// Canvas size the detector requires, `(width, height)`.
    fn input_size(&self) -> (u32, u32);

    /// Number of boxes produced per frame.
    fn capacity(&self) -> usize;

    /// Run detection on `canvas`, writing at most `out.capacity()` boxes
    /// into `out` in place.
    fn detect(&mut self, canvas: &RgbImage, out: &mut DetectionSet) -> Result<DetectOutcome>;
}

// ── SSD detector ─────────────────────────────────────────────────────────────

/// Tensor names of an SSD export; they vary between converters.
#[derive(Debug, Clone)]
pub struct SsdTensorNames {
    pub input: String,
    pub boxes: String,
    pub scores: String,
    pub classes: String,
}

impl Default for SsdTensorNames {
    fn default() -> Self {
        Self {
            input: "Preprocessor/sub:0".into(),
            boxes: "detection_boxes".into(),
            scores: "detection_scores".into(),
            classes: "detection_classes".into(),
        }
    }
}

/// Wraps a MobileNet-SSD ONNX session.  The NHWC input tensor is allocated
/// once and refilled in place every frame.
pub struct SsdDetector {
    session: Session,
    names: SsdTensorNames,
    input_width: u32,
    input_height: u32,
    input: Tensor<f32>,
}

impl SsdDetector {
    /// Load an SSD ONNX model from `model_path`.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        input_width: u32,
        input_height: u32,
        names: SsdTensorNames,
    ) -> Result<Self> {
        if input_width == 0 || input_height == 0 {
            bail!("detector input size must be non-zero");
        }
        let session = build_ort_session(model_path.as_ref())?;

        // [1, H, W, 3]
        let shape = [1usize, input_height as usize, input_width as usize, 3];
        let zeros = vec![0f32; shape.iter().product()];
        let input = Tensor::from_array((shape, zeros.into_boxed_slice()))
            .context("failed to create SSD input tensor")?;

        debug!(input_width, input_height, "SSD detector loaded");
        Ok(Self {
            session,
            names,
            input_width,
            input_height,
            input,
        })
    }
}

impl ObjectDetector for SsdDetector {
    fn input_size(&self) -> (u32, u32) {
        (self.input_width, self.input_height)
    }

    fn capacity(&self) -> usize {
        SSD_NUM_BOXES
    }

    fn detect(&mut self, canvas: &RgbImage, out: &mut DetectionSet) -> Result<DetectOutcome> {
        if canvas.width() != self.input_width || canvas.height() != self.input_height {
            bail!(
                "canvas is {}x{}, detector expects {}x{}",
                canvas.width(),
                canvas.height(),
                self.input_width,
                self.input_height
            );
        }

        if is_near_black(canvas.as_raw()) {
            debug!("near-black canvas, skipping inference");
            return Ok(DetectOutcome::Skipped);
        }
        let (_, input_buf) = self.input.extract_tensor_mut();
        preprocess_bgr(canvas.as_raw(), input_buf);

        let outputs = self
            .session
            .run(ort::inputs![self.names.input.as_str() => self.input.view()])
            .context("SSD inference failed")?;

        let (_, boxes) = outputs[self.names.boxes.as_str()]
            .try_extract_tensor::<f32>()
            .context("failed to extract SSD boxes")?;
        let (_, scores) = outputs[self.names.scores.as_str()]
            .try_extract_tensor::<f32>()
            .context("failed to extract SSD scores")?;
        let (_, classes) = outputs[self.names.classes.as_str()]
            .try_extract_tensor::<f32>()
            .context("failed to extract SSD classes")?;

        decode_ssd(boxes, scores, classes, out);
        Ok(DetectOutcome::Ready)
    }
}

pub(crate) fn build_ort_session(model_path: &Path) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_intra_threads(2)
        .context("failed to set ORT intra threads")?;
    builder = builder
        .with_inter_threads(1)
        .context("failed to set ORT inter threads")?;
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ONNX model {}", model_path.display()))
}

// ── Pre/post-processing helpers ──────────────────────────────────────────────

/// RGB24 → BGR floats in [-1, 1], interleaved.
fn preprocess_bgr(rgb: &[u8], out: &mut [f32]) {
    out.par_chunks_mut(3)
        .zip(rgb.par_chunks(3))
        .for_each(|(dst, px)| {
            dst[0] = INPUT_SCALE * px[2] as f32 - 1.0;
            dst[1] = INPUT_SCALE * px[1] as f32 - 1.0;
            dst[2] = INPUT_SCALE * px[0] as f32 - 1.0;
        });
}

/// Average green below 13/255 means the lens is covered or there is no
/// signal; running the detector on it only produces garbage.
pub fn is_near_black(rgb: &[u8]) -> bool {
    let area = (rgb.len() / 3) as u64;
    if area == 0 {
        return true;
    }
    let sum_green: u64 = rgb.par_chunks(3).map(|px| px[1] as u64).sum();
    sum_green < area * BLACK_FRAME_GREEN_LEVEL
}

/// Write SSD outputs (`[N,4]` top/left/bottom/right, `[N]` scores, `[N]`
/// zero-based classes) into the set's slots.
fn decode_ssd(boxes: &[f32], scores: &[f32], classes: &[f32], out: &mut DetectionSet) {
    let count = out
        .capacity()
        .min(boxes.len() / 4)
        .min(scores.len())
        .min(classes.len());
    let slots = out.slots_mut();
    for (i, slot) in slots.iter_mut().enumerate().take(count) {
        let class_id = classes[i].round() as i32;
        *slot = BBox {
            top: boxes[i * 4],
            left: boxes[i * 4 + 1],
            bottom: boxes[i * 4 + 2],
            right: boxes[i * 4 + 3],
            class_id,
            label: coco_label(class_id + 1).unwrap_or("???"),
            score: scores[i],
            is_tracked: false,
        };
        slot.sanitize();
    }
    out.set_len(count);
}

// ── Debug rendering ──────────────────────────────────────────────────────────

/// Draw pixel-space boxes `(x1, y1, x2, y2)` onto an image (for debug output).
pub fn draw_boxes(img: &mut RgbImage, boxes: &[(f32, f32, f32, f32)], color: [u8; 3]) {
    for &(x1, y1, x2, y2) in boxes {
        let w = (x2 - x1).max(1.0) as u32;
        let h = (y2 - y1).max(1.0) as u32;
        let rect = Rect::at(x1 as i32, y1 as i32).of_size(w, h);
        imageproc::drawing::draw_hollow_rect_mut(img, rect, Rgb(color));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_keeps_capacity_and_limits_len() {
        let mut set = DetectionSet::with_capacity(4);
        assert_eq!(set.capacity(), 4);
        assert!(set.is_empty());
        set.set_len(10);
        assert_eq!(set.len(), 4);
        set.set_len(2);
        assert_eq!(set.boxes().len(), 2);
        assert_eq!(set.capacity(), 4);
    }

    #[test]
    fn sanitize_orders_and_clamps_corners() {
        let mut b = BBox {
            top: 0.8,
            left: -0.2,
            bottom: 0.3,
            right: 1.4,
            score: 1.5,
            ..BBox::default()
        };
        b.sanitize();
        assert_eq!((b.top, b.bottom), (0.3, 0.8));
        assert_eq!((b.left, b.right), (0.0, 1.0));
        assert_eq!(b.score, 1.0);

        let mut wild = BBox {
            top: f32::NAN,
            left: f32::NEG_INFINITY,
            bottom: 0.5,
            right: f32::INFINITY,
            score: f32::NAN,
            ..BBox::default()
        };
        wild.sanitize();
        assert_eq!((wild.top, wild.bottom), (0.0, 0.5));
        assert_eq!((wild.left, wild.right), (0.0, 1.0));
        assert_eq!(wild.score, 0.0);
    }

    #[test]
    fn near_black_frames_are_flagged() {
        let dark = vec![5u8; 30 * 30 * 3];
        let lit = vec![40u8; 30 * 30 * 3];
        assert!(is_near_black(&dark));
        assert!(!is_near_black(&lit));
        assert!(is_near_black(&[]));
    }

    #[test]
    fn preprocessing_swaps_to_bgr_and_normalizes() {
        let rgb = [255u8, 0, 128];
        let mut out = [0f32; 3];
        preprocess_bgr(&rgb, &mut out);
        assert!((out[0] - (128.0 * INPUT_SCALE - 1.0)).abs() < 1e-5);
        assert!((out[1] + 1.0).abs() < 1e-5);
        assert!((out[2] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn reused_input_buffer_is_fully_overwritten() {
        let mut out = vec![f32::NAN; 6];
        preprocess_bgr(&[255, 255, 255, 255, 255, 255], &mut out);
        preprocess_bgr(&[0, 0, 0, 0, 0, 0], &mut out);
        assert!(out.iter().all(|v| (v + 1.0).abs() < 1e-5));
    }

    #[test]
    fn decodes_ssd_outputs_into_slots() {
        let mut set = DetectionSet::with_capacity(3);
        let boxes = [0.1, 0.2, 0.5, 0.6, 0.0, 0.0, 1.0, 1.0, 0.9, 0.9, 0.1, 0.1];
        let scores = [0.9, 0.2, 0.5];
        let classes = [0.0, 2.0, 16.0];
        decode_ssd(&boxes, &scores, &classes, &mut set);

        assert_eq!(set.len(), 3);
        let b = set.boxes();
        assert_eq!(b[0].label, "person");
        assert_eq!(b[1].label, "car");
        assert_eq!(b[2].label, "cat");
        assert_eq!((b[0].top, b[0].left), (0.1, 0.2));
        // Inverted corners are reordered.
        assert_eq!((b[2].top, b[2].bottom), (0.1, 0.9));
    }

    #[test]
    fn tracked_flag_helpers() {
        let mut set = DetectionSet::from_boxes(&[
            BBox::default(),
            BBox {
                is_tracked: true,
                ..BBox::default()
            },
        ]);
        assert!(set.tracked().is_some());
        set.clear_tracked();
        assert!(set.tracked().is_none());
    }
}
