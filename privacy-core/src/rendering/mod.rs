//! rendering — privacy overlay for the latest box snapshot
//!
//! `render` turns a `BoxSnapshot` into a short list of draw commands for the
//! current view: a full-view mask with one even-odd hole per revealed
//! subject, an outline around each hole, or the "no lock" cross when the
//! pipeline has nothing to say.  `rasterize` applies those commands to an RGB
//! frame for hosts that composite in software.
//!
//! The screen mapping is recomputed on every call; nothing here caches view
//! geometry.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use rayon::prelude::*;
use serde::Deserialize;

use crate::detection::BBox;
use crate::geometry::{screen_rect, ScreenRect, ViewGeometry};
use crate::handoff::BoxSnapshot;

pub const MASK_COLOR: [u8; 3] = [0, 0, 0];
pub const OUTLINE_COLOR: [u8; 3] = [0, 200, 0];
pub const INDICATOR_COLOR: [u8; 3] = [255, 255, 255];

// ── Policy ───────────────────────────────────────────────────────────────────

/// Which qualifying subjects get a hole in the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevealPolicy {
    #[default]
    All,
    /// Only the box the tracker has locked onto.
    Tracked,
}

/// What to draw while the pipeline reports "no results".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoResultsPolicy {
    /// Two diagonal lines across the view.
    #[default]
    Indicator,
    /// Mask the whole view (privacy mode only).
    Occlude,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayParams {
    pub privacy_enabled: bool,
    pub score_threshold: f32,
    pub subject_label: String,
    /// Mask everything, whatever the detector says.
    pub block_all: bool,
    pub reveal: RevealPolicy,
    pub no_results: NoResultsPolicy,
}

impl Default for OverlayParams {
    fn default() -> Self {
        Self {
            privacy_enabled: true,
            score_threshold: 0.4,
            subject_label: "person".into(),
            block_all: false,
            reveal: RevealPolicy::All,
            no_results: NoResultsPolicy::Indicator,
        }
    }
}

impl OverlayParams {
    fn reveals(&self, b: &BBox) -> bool {
        b.score >= self.score_threshold
            && b.label == self.subject_label
            && (self.reveal == RevealPolicy::All || b.is_tracked)
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    Line {
        from: (f32, f32),
        to: (f32, f32),
        color: [u8; 3],
    },
    /// Union of rectangles filled as one path.  With `even_odd`, a pixel is
    /// painted when an odd number of rectangles cover it.
    FillPath {
        rects: Vec<ScreenRect>,
        even_odd: bool,
        color: [u8; 3],
    },
    StrokeRect {
        rect: ScreenRect,
        color: [u8; 3],
    },
}

/// Build this frame's overlay.
pub fn render(
    snapshot: &BoxSnapshot,
    view: &ViewGeometry,
    params: &OverlayParams,
) -> Vec<DrawCommand> {
    let full = ScreenRect::full_view(view);
    let occlude_all = || {
        vec![DrawCommand::FillPath {
            rects: vec![full],
            even_odd: true,
            color: MASK_COLOR,
        }]
    };

    if params.block_all {
        return occlude_all();
    }

    if !snapshot.has_results {
        if params.privacy_enabled && params.no_results == NoResultsPolicy::Occlude {
            return occlude_all();
        }
        let (w, h) = (view.width as f32, view.height as f32);
        return vec![
            DrawCommand::Line {
                from: (w, 0.0),
                to: (0.0, h),
                color: INDICATOR_COLOR,
            },
            DrawCommand::Line {
                from: (0.0, 0.0),
                to: (w, h),
                color: INDICATOR_COLOR,
            },
        ];
    }

    if !params.privacy_enabled {
        return Vec::new();
    }

    let holes: Vec<ScreenRect> = snapshot
        .boxes
        .iter()
        .filter(|b| params.reveals(b))
        .map(|b| screen_rect(b, view))
        .collect();

    let mut commands = Vec::with_capacity(1 + holes.len());
    let mut rects = Vec::with_capacity(1 + holes.len());
    rects.push(full);
    rects.extend_from_slice(&holes);
    commands.push(DrawCommand::FillPath {
        rects,
        even_odd: true,
        color: MASK_COLOR,
    });
    commands.extend(holes.into_iter().map(|rect| DrawCommand::StrokeRect {
        rect,
        color: OUTLINE_COLOR,
    }));
    commands
}

// ── Software compositing ─────────────────────────────────────────────────────

/// Apply `commands` to `img` in order.
pub fn rasterize(commands: &[DrawCommand], img: &mut RgbImage) {
    for cmd in commands {
        match cmd {
            DrawCommand::Line { from, to, color } => {
                draw_line_segment_mut(img, *from, *to, Rgb(*color));
            }
            DrawCommand::FillPath {
                rects,
                even_odd,
                color,
            } => fill_rects(img, rects, *even_odd, *color),
            DrawCommand::StrokeRect { rect, color } => {
                if let Some(r) = outline_rect(rect, img.width(), img.height()) {
                    draw_hollow_rect_mut(img, r, Rgb(*color));
                }
            }
        }
    }
}

/// Integer outline for `rect`, pulled in to one pixel outside the image.
/// `None` for NaN corners.
fn outline_rect(rect: &ScreenRect, width: u32, height: u32) -> Option<Rect> {
    let corners = [rect.x1, rect.y1, rect.x2, rect.y2];
    if corners.iter().any(|v| v.is_nan()) {
        return None;
    }
    let (max_x, max_y) = (width as f32 + 1.0, height as f32 + 1.0);
    let x1 = rect.x1.clamp(-1.0, max_x).round();
    let y1 = rect.y1.clamp(-1.0, max_y).round();
    let x2 = rect.x2.clamp(-1.0, max_x).round();
    let y2 = rect.y2.clamp(-1.0, max_y).round();
    let w = (x2 - x1).max(1.0) as u32;
    let h = (y2 - y1).max(1.0) as u32;
    Some(Rect::at(x1 as i32, y1 as i32).of_size(w, h))
}

/// Per-pixel fill sampled at pixel centres.  Non-zero mode paints anything
/// covered at all.
fn fill_rects(img: &mut RgbImage, rects: &[ScreenRect], even_odd: bool, color: [u8; 3]) {
    let width = img.width() as usize;
    if width == 0 || rects.is_empty() {
        return;
    }
    img.par_chunks_mut(width * 3)
        .enumerate()
        .for_each(|(y, row)| {
            let cy = y as f32 + 0.5;
            let spans: Vec<&ScreenRect> =
                rects.iter().filter(|r| cy >= r.y1 && cy < r.y2).collect();
            if spans.is_empty() {
                return;
            }
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                let cx = x as f32 + 0.5;
                let hits = spans.iter().filter(|r| cx >= r.x1 && cx < r.x2).count();
                let paint = if even_odd { hits % 2 == 1 } else { hits > 0 };
                if paint {
                    px.copy_from_slice(&color);
                }
            }
        });
}
