//! Template-matching tracking primitive.
//!
//! Keeps a grayscale patch of the seeded region and searches for it in a
//! window around the last position every frame.  The patch is never updated
//! after `init`; the detector-driven re-seeding in `RegionTracker` refreshes
//! it whenever a box overlaps well.

use image::{imageops, GrayImage, RgbImage};
use imageproc::template_matching::{find_extremes, match_template, MatchTemplateMethod};
use tracing::trace;

use super::{PixelRect, VisualTracker};

/// Search and acceptance tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateParams {
    /// Extra search area on each side, as a fraction of the patch size.
    pub search_margin: f32,
    /// Normalized SSE above which the target counts as lost.
    pub max_match_error: f32,
    /// Patches smaller than this (either side, pixels) are rejected at seed.
    pub min_patch_size: u32,
}

impl Default for TemplateParams {
    fn default() -> Self {
        Self {
            search_margin: 0.5,
            max_match_error: 0.25,
            min_patch_size: 4,
        }
    }
}

pub struct TemplateTracker {
    params: TemplateParams,
    patch: GrayImage,
    rect: PixelRect,
}

impl TemplateTracker {
    pub fn new(params: TemplateParams) -> Self {
        Self {
            params,
            patch: GrayImage::new(0, 0),
            rect: PixelRect::default(),
        }
    }
}

impl VisualTracker for TemplateTracker {
    fn init(&mut self, frame: &RgbImage, rect: PixelRect) -> bool {
        let Some(clipped) = clip(rect, frame.width(), frame.height()) else {
            return false;
        };
        let min = self.params.min_patch_size as i32;
        if clipped.width < min || clipped.height < min {
            return false;
        }
        self.patch = gray_crop(frame, clipped);
        self.rect = clipped;
        true
    }

    fn update(&mut self, frame: &RgbImage) -> Option<PixelRect> {
        if self.patch.width() == 0 {
            return None;
        }
        let (pw, ph) = (self.rect.width, self.rect.height);
        let mx = (pw as f32 * self.params.search_margin).ceil() as i32;
        let my = (ph as f32 * self.params.search_margin).ceil() as i32;
        let window = clip(
            PixelRect::new(self.rect.x - mx, self.rect.y - my, pw + 2 * mx, ph + 2 * my),
            frame.width(),
            frame.height(),
        )?;
        if window.width < pw || window.height < ph {
            return None;
        }

        let search = gray_crop(frame, window);
        if search.as_raw().iter().all(|&v| v == 0) {
            return None;
        }
        let scores = match_template(
            &search,
            &self.patch,
            MatchTemplateMethod::SumOfSquaredErrorsNormalized,
        );
        let extremes = find_extremes(&scores);
        let error = extremes.min_value;
        trace!(error, "template match");
        if !error.is_finite() || error > self.params.max_match_error {
            return None;
        }

        let (ox, oy) = extremes.min_value_location;
        self.rect = PixelRect::new(window.x + ox as i32, window.y + oy as i32, pw, ph);
        Some(self.rect)
    }
}

/// Intersect `rect` with the image bounds; `None` if nothing is left.
fn clip(rect: PixelRect, width: u32, height: u32) -> Option<PixelRect> {
    let x1 = rect.x.max(0);
    let y1 = rect.y.max(0);
    let x2 = rect.right().min(width as i32);
    let y2 = rect.bottom().min(height as i32);
    (x2 > x1 && y2 > y1).then(|| PixelRect::new(x1, y1, x2 - x1, y2 - y1))
}

fn gray_crop(frame: &RgbImage, rect: PixelRect) -> GrayImage {
    let sub = imageops::crop_imm(
        frame,
        rect.x as u32,
        rect.y as u32,
        rect.width as u32,
        rect.height as u32,
    )
    .to_image();
    imageops::grayscale(&sub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// Mid-grey frame with a bright, textured square at `(x, y)`.
    fn frame_with_target(x: u32, y: u32) -> RgbImage {
        let mut img = RgbImage::from_pixel(120, 120, Rgb([90, 90, 90]));
        for dy in 0..20 {
            for dx in 0..20 {
                let v = if (dx / 5 + dy / 5) % 2 == 0 { 250 } else { 160 };
                img.put_pixel(x + dx, y + dy, Rgb([v, v, v]));
            }
        }
        img
    }

    #[test]
    fn stationary_target_stays_put() {
        let frame = frame_with_target(40, 40);
        let mut t = TemplateTracker::new(TemplateParams::default());
        let seed = PixelRect::new(40, 40, 20, 20);
        assert!(t.init(&frame, seed));
        assert_eq!(t.update(&frame), Some(seed));
        assert_eq!(t.update(&frame), Some(seed));
    }

    #[test]
    fn follows_a_small_shift() {
        let mut t = TemplateTracker::new(TemplateParams::default());
        assert!(t.init(&frame_with_target(40, 40), PixelRect::new(40, 40, 20, 20)));
        let moved = frame_with_target(46, 43);
        assert_eq!(t.update(&moved), Some(PixelRect::new(46, 43, 20, 20)));
    }

    #[test]
    fn flat_frame_is_a_loss() {
        let mut t = TemplateTracker::new(TemplateParams::default());
        assert!(t.init(&frame_with_target(40, 40), PixelRect::new(40, 40, 20, 20)));
        let flat = RgbImage::from_pixel(120, 120, Rgb([128, 128, 128]));
        assert_eq!(t.update(&flat), None);
        let black = RgbImage::new(120, 120);
        assert_eq!(t.update(&black), None);
    }

    #[test]
    fn tiny_or_offscreen_seeds_are_rejected() {
        let frame = frame_with_target(40, 40);
        let mut t = TemplateTracker::new(TemplateParams::default());
        assert!(!t.init(&frame, PixelRect::new(10, 10, 2, 2)));
        assert!(!t.init(&frame, PixelRect::new(200, 200, 20, 20)));
        // Partially visible seeds are clipped, not rejected.
        assert!(t.init(&frame, PixelRect::new(-10, -10, 30, 30)));
    }

    #[test]
    fn update_before_init_is_a_loss() {
        let mut t = TemplateTracker::new(TemplateParams::default());
        assert_eq!(t.update(&frame_with_target(40, 40)), None);
    }
}
