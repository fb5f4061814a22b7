//! video — frame-source collaborators
//!
//! The core never negotiates with a camera itself.  This module holds the thin
//! pieces a host needs to feed it: the `SourceFrame` handed to the pipeline,
//! preview-resolution negotiation, NV21 → RGB24 conversion for sensor buffers,
//! and (behind the `video-file` feature) replay of a recorded clip as if it
//! were a live feed.

use anyhow::{bail, Result};
use rayon::prelude::*;
use tracing::debug;

#[cfg(feature = "video-file")]
mod file;
#[cfg(feature = "video-file")]
pub use file::replay;

// ── Frames ───────────────────────────────────────────────────────────────────

/// A single source frame in RGB24, as delivered to the pipeline context.
#[derive(Debug, Clone)]
pub struct SourceFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    /// Sensor rotation hint in degrees: 0, 90, 180 or 270.
    pub rotation: u32,
    pub pts: i64,
}

impl SourceFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, rotation: u32, pts: i64) -> Self {
        Self {
            data,
            width,
            height,
            rotation,
            pts,
        }
    }

    /// A frame that cannot be mapped onto the canvas: zero-sized, or a buffer
    /// shorter than its stated dimensions.
    pub fn is_degenerate(&self) -> bool {
        self.width == 0
            || self.height == 0
            || self.data.len() < self.width as usize * self.height as usize * 3
    }
}

// ── Resolution negotiation ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl std::str::FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((w, h)) = s.trim().split_once(['x', 'X']) else {
            bail!("expected WIDTHxHEIGHT, got {s:?}");
        };
        Ok(Self::new(w.trim().parse()?, h.trim().parse()?))
    }
}

/// Pick the preview resolution closest to `target` without being smaller on
/// either axis.  Distance is the squared euclidean difference of the sides;
/// the first candidate wins a tie.  Returns `None` when every candidate is too
/// small.
pub fn select_preview_resolution<I>(candidates: I, target: Resolution) -> Option<Resolution>
where
    I: IntoIterator<Item = Resolution>,
{
    let mut preferred: Option<(Resolution, u64)> = None;
    for candidate in candidates {
        if candidate.width < target.width || candidate.height < target.height {
            continue;
        }
        let dw = (candidate.width - target.width) as u64;
        let dh = (candidate.height - target.height) as u64;
        let score = dw * dw + dh * dh;
        if preferred.is_none_or(|(_, best)| score < best) {
            preferred = Some((candidate, score));
        }
    }
    preferred.map(|(resolution, _)| resolution)
}

// ── Colorspace conversion ────────────────────────────────────────────────────

/// NV21 (Y plane + interleaved VU at quarter resolution) → RGB24 converter.
///
/// The output buffer is kept between calls and reallocated only when the
/// frame size changes.
#[derive(Default)]
pub struct Nv21Converter {
    rgb: Vec<u8>,
    width: u32,
    height: u32,
}

impl Nv21Converter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn convert(&mut self, nv21: &[u8], width: u32, height: u32) -> Result<&[u8]> {
        let (w, h) = (width as usize, height as usize);
        let luma_len = w * h;
        let chroma_len = w.div_ceil(2) * h.div_ceil(2) * 2;
        if w == 0 || h == 0 || nv21.len() < luma_len + chroma_len {
            bail!(
                "NV21 buffer of {} bytes is too small for {width}x{height}",
                nv21.len()
            );
        }

        if self.width != width || self.height != height {
            self.rgb = vec![0u8; luma_len * 3];
            self.width = width;
            self.height = height;
            debug!(width, height, "reallocated NV21 conversion buffer");
        }

        let (luma, chroma) = nv21.split_at(luma_len);
        let chroma_stride = w.div_ceil(2) * 2;
        self.rgb
            .par_chunks_mut(w * 3)
            .enumerate()
            .for_each(|(row, out)| {
                let chroma_row = &chroma[(row / 2) * chroma_stride..];
                for col in 0..w {
                    let y = luma[row * w + col] as f32;
                    let pair = (col / 2) * 2;
                    let v = chroma_row[pair] as f32 - 128.0;
                    let u = chroma_row[pair + 1] as f32 - 128.0;
                    let px = &mut out[col * 3..col * 3 + 3];
                    px[0] = (y + 1.370_705 * v).clamp(0.0, 255.0) as u8;
                    px[1] = (y - 0.698_001 * v - 0.337_633 * u).clamp(0.0, 255.0) as u8;
                    px[2] = (y + 1.732_446 * u).clamp(0.0, 255.0) as u8;
                }
            });

        Ok(&self.rgb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_nearest_resolution_that_is_not_smaller() {
        let candidates = [
            Resolution::new(176, 144),
            Resolution::new(1600, 1200),
            Resolution::new(352, 288),
            Resolution::new(640, 480),
        ];
        let picked = select_preview_resolution(candidates, Resolution::new(300, 300));
        // 352x288 is closer but too short.
        assert_eq!(picked, Some(Resolution::new(640, 480)));
    }

    #[test]
    fn no_resolution_when_all_candidates_are_too_small() {
        let candidates = [Resolution::new(176, 144), Resolution::new(320, 240)];
        assert_eq!(
            select_preview_resolution(candidates, Resolution::new(300, 300)),
            None
        );
    }

    #[test]
    fn exact_match_wins() {
        let candidates = [Resolution::new(640, 480), Resolution::new(300, 300)];
        assert_eq!(
            select_preview_resolution(candidates, Resolution::new(300, 300)),
            Some(Resolution::new(300, 300))
        );
    }

    #[test]
    fn parses_resolution_strings() {
        let r: Resolution = "1280x720".parse().unwrap();
        assert_eq!(r, Resolution::new(1280, 720));
        assert!("1280-720".parse::<Resolution>().is_err());
    }

    #[test]
    fn grey_nv21_converts_to_grey_rgb() {
        let (w, h) = (4u32, 2u32);
        let mut nv21 = vec![100u8; (w * h) as usize];
        nv21.extend(std::iter::repeat_n(128u8, (w * h / 2) as usize));
        let mut conv = Nv21Converter::new();
        let rgb = conv.convert(&nv21, w, h).unwrap();
        assert_eq!(rgb.len(), (w * h * 3) as usize);
        assert!(rgb.iter().all(|&c| c == 100));
    }

    #[test]
    fn short_nv21_buffer_is_rejected() {
        let mut conv = Nv21Converter::new();
        assert!(conv.convert(&[0u8; 10], 4, 4).is_err());
    }

    #[test]
    fn degenerate_frames_are_detected() {
        assert!(SourceFrame::new(Vec::new(), 0, 10, 0, 0).is_degenerate());
        assert!(SourceFrame::new(vec![0; 5], 2, 2, 0, 0).is_degenerate());
        assert!(!SourceFrame::new(vec![0; 12], 2, 2, 0, 0).is_degenerate());
    }
}
