//! tracking — single-object lock with detector-driven re-seeding
//!
//! A visual tracker primitive follows the target between frames; the
//! detector's boxes correct it.  Every frame the primitive's refined
//! rectangle is matched against the scored boxes by IoU: the best overlap is
//! flagged as the tracked box, and a strong enough overlap re-seeds the
//! primitive from that box so drift never accumulates.
//!
//! State machine:
//!
//! ```text
//!   Unseeded ──seed──▶ Tracking ──update fails──▶ Lost
//!                        ▲  │                       │
//!                        └──┘ IoU > 0.3 re-seed     │
//!                        ▲                          │
//!                        └──────────seed────────────┘
//! ```
//!
//! A lost track is never re-acquired from overlap alone; it needs a fresh
//! seed (a tap, or an automatic match decided by the caller).

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::detection::{BBox, DetectionSet};

pub mod template;

pub use template::{TemplateParams, TemplateTracker};

/// IoU a matched box must exceed (strictly) to re-seed the primitive.
pub const RESEED_IOU: f64 = 0.3;

// ── Pixel rectangles ─────────────────────────────────────────────────────────

/// Integer rectangle in canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelRect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Scale a normalized box by the canvas size, rounding each term to the
    /// nearest pixel.  Seeding and matching both go through here so they
    /// round identically.
    pub fn from_bbox(bbox: &BBox, canvas_width: u32, canvas_height: u32) -> Self {
        let (w, h) = (canvas_width as f64, canvas_height as f64);
        Self {
            x: (bbox.left as f64 * w).round() as i32,
            y: (bbox.top as f64 * h).round() as i32,
            width: ((bbox.right - bbox.left) as f64 * w).round() as i32,
            height: ((bbox.bottom - bbox.top) as f64 * h).round() as i32,
        }
    }

    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }

    pub fn area(&self) -> f64 {
        self.width.max(0) as f64 * self.height.max(0) as f64
    }

    /// Intersection over union.  Symmetric; 0 for disjoint or empty
    /// rectangles.
    pub fn iou(&self, other: &PixelRect) -> f64 {
        let ix = (self.right().min(other.right()) as i64 - self.x.max(other.x) as i64).max(0) as f64;
        let iy =
            (self.bottom().min(other.bottom()) as i64 - self.y.max(other.y) as i64).max(0) as f64;
        let inter = ix * iy;
        if inter == 0.0 {
            return 0.0;
        }
        inter / (self.area() + other.area() - inter)
    }
}

/// Whether a match of `iou` should re-seed the primitive.
pub fn should_reseed(iou: f64) -> bool {
    iou > RESEED_IOU
}

// ── Tracking backend ─────────────────────────────────────────────────────────

/// A single-target visual tracking primitive (correlation filter, MIL, KCF,
/// template matching, …).
pub trait VisualTracker: Send {
    /// Start following `rect` in `frame`.  `false` if the region can't be
    /// tracked.
    fn init(&mut self, frame: &RgbImage, rect: PixelRect) -> bool;

    /// Locate the target in `frame`.  `None` means it was lost.
    fn update(&mut self, frame: &RgbImage) -> Option<PixelRect>;
}

/// Builds a fresh primitive for every seed.
pub trait TrackerFactory: Send {
    fn create(&self) -> Box<dyn VisualTracker>;
}

impl<F> TrackerFactory for F
where
    F: Fn() -> Box<dyn VisualTracker> + Send,
{
    fn create(&self) -> Box<dyn VisualTracker> {
        self()
    }
}

// ── RegionTracker ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Unseeded,
    Tracking,
    Lost,
}

/// Association / re-acquisition policy around a [`VisualTracker`].
pub struct RegionTracker {
    factory: Box<dyn TrackerFactory>,
    primitive: Option<Box<dyn VisualTracker>>,
    state: TrackState,
    /// Last known target rectangle; meaningful only while `Tracking`.
    region: Option<PixelRect>,
    /// Tap point in canvas pixels, waiting for a frame with candidates.
    pending_seed: Option<(f64, f64)>,
    reseeds: u64,
}

impl RegionTracker {
    pub fn new(factory: Box<dyn TrackerFactory>) -> Self {
        Self {
            factory,
            primitive: None,
            state: TrackState::Unseeded,
            region: None,
            pending_seed: None,
            reseeds: 0,
        }
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    /// The tracked rectangle, if the lock is currently valid.
    pub fn tracked_region(&self) -> Option<PixelRect> {
        match self.state {
            TrackState::Tracking => self.region,
            _ => None,
        }
    }

    /// Number of primitive (re)initialisations so far.
    pub fn reseed_count(&self) -> u64 {
        self.reseeds
    }

    /// Ask for a lock on whatever box is nearest `(x, y)` (canvas pixels).
    /// Only boxes at or above the score threshold are candidates, so the
    /// request stays pending until a frame has one.
    pub fn request_seed(&mut self, x: f32, y: f32) {
        debug!(x, y, "seed requested");
        self.pending_seed = Some((x as f64, y as f64));
    }

    pub fn has_pending_seed(&self) -> bool {
        self.pending_seed.is_some()
    }

    /// Seed directly from `bbox` (an automatic re-acquisition decided by the
    /// caller).  Returns whether the primitive accepted it.
    pub fn seed_from_box(&mut self, frame: &RgbImage, bbox: &BBox) -> bool {
        let rect = PixelRect::from_bbox(bbox, frame.width(), frame.height());
        self.seed(frame, rect)
    }

    /// Drop the lock entirely.
    pub fn reset(&mut self) {
        self.primitive = None;
        self.region = None;
        self.pending_seed = None;
        self.state = TrackState::Unseeded;
    }

    /// Run one frame of tracking against `boxes`.
    ///
    /// An absent or empty set is the "inference skipped" signal and is handed
    /// back untouched.  Otherwise the `is_tracked` flags are rewritten: at
    /// most one box, the best IoU match among those scoring at least
    /// `score_threshold`, ends up flagged.
    pub fn process<'a>(
        &mut self,
        frame: &RgbImage,
        boxes: Option<&'a mut DetectionSet>,
        score_threshold: f32,
    ) -> Option<&'a mut DetectionSet> {
        let set = boxes?;
        if set.is_empty() {
            return Some(set);
        }
        let (cw, ch) = frame.dimensions();

        if let Some(point) = self.pending_seed {
            if let Some(nearest) = nearest_box(point, set.boxes(), score_threshold, cw, ch) {
                self.pending_seed = None;
                let rect = PixelRect::from_bbox(&set.boxes()[nearest], cw, ch);
                info!(x = point.0, y = point.1, ?rect, "seeding tracker from tap");
                self.seed(frame, rect);
            }
        }

        if self.state != TrackState::Tracking {
            set.clear_tracked();
            return Some(set);
        }

        let refined = self.primitive.as_mut().and_then(|p| p.update(frame));
        let Some(refined) = refined else {
            warn!("track lost");
            self.state = TrackState::Lost;
            self.primitive = None;
            self.region = None;
            set.clear_tracked();
            return Some(set);
        };
        self.region = Some(refined);

        let mut best: Option<(usize, f64)> = None;
        for (i, b) in set.boxes_mut().iter_mut().enumerate() {
            b.is_tracked = false;
            if b.score < score_threshold {
                continue;
            }
            let iou = PixelRect::from_bbox(b, cw, ch).iou(&refined);
            if iou > 0.0 && best.is_none_or(|(_, top)| iou > top) {
                best = Some((i, iou));
            }
        }

        if let Some((i, iou)) = best {
            let matched = &mut set.boxes_mut()[i];
            matched.is_tracked = true;
            if should_reseed(iou) {
                let rect = PixelRect::from_bbox(matched, cw, ch);
                debug!(iou, ?rect, "matching overlap, re-seeding tracker");
                self.seed(frame, rect);
            }
        }

        Some(set)
    }

    fn seed(&mut self, frame: &RgbImage, rect: PixelRect) -> bool {
        let mut primitive = self.factory.create();
        self.reseeds += 1;
        if primitive.init(frame, rect) {
            self.primitive = Some(primitive);
            self.region = Some(rect);
            self.state = TrackState::Tracking;
            true
        } else {
            warn!(?rect, "tracker rejected seed region");
            self.primitive = None;
            self.region = None;
            self.state = TrackState::Lost;
            false
        }
    }
}

/// Index of the box whose pixel-space centre is nearest `point`, among those
/// scoring at least `score_threshold`.
fn nearest_box(
    point: (f64, f64),
    boxes: &[BBox],
    score_threshold: f32,
    canvas_width: u32,
    canvas_height: u32,
) -> Option<usize> {
    boxes
        .iter()
        .enumerate()
        .filter(|(_, b)| b.score >= score_threshold)
        .map(|(i, b)| {
            let (cx, cy) = PixelRect::from_bbox(b, canvas_width, canvas_height).center();
            (i, (cx - point.0).hypot(cy - point.1))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}
