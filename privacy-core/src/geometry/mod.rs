//! geometry — source frame → detector canvas → screen
//!
//! The detector wants a fixed-size canvas; the camera delivers frames of
//! whatever size and sensor rotation it negotiated.  `GeometryMapper` fits the
//! source inside the canvas (scale-to-fit, letterbox-centre, counter-rotate in
//! portrait) and memoizes that transform so it is only rebuilt when a
//! dimension or the rotation changes.
//!
//! The reverse direction, normalized canvas box → screen pixels, is computed
//! per draw by [`screen_rect`] from the current view size and orientation.

use anyhow::{bail, Context, Result};
use fast_image_resize as fr;
use image::RgbImage;
use nalgebra::{Matrix3, Point2, Vector2};
use rayon::prelude::*;
use serde::Deserialize;
use tracing::debug;

use crate::detection::BBox;
use crate::video::SourceFrame;

// ── Canvas transform ─────────────────────────────────────────────────────────

/// Inputs the canvas transform depends on.  Equality on this key decides
/// whether the cached transform is still valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryKey {
    pub source_width: u32,
    pub source_height: u32,
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Sensor rotation in degrees, normalized to 0/90/180/270.
    pub rotation: u32,
    pub landscape_display: bool,
}

/// Affine source-pixel → canvas-pixel mapping: uniform scale, letterbox
/// translation, then an optional counter-rotation about the canvas centre.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryTransform {
    pub scale: f32,
    pub dx: f32,
    pub dy: f32,
    /// Applied rotation in degrees (already negated), 0 when none applies.
    pub rotation_degrees: f32,
    pub rotated: bool,
    pub canvas_width: u32,
    pub canvas_height: u32,
}

impl GeometryTransform {
    /// Homogeneous matrix for the full source → canvas mapping.
    pub fn matrix(&self) -> Matrix3<f32> {
        self.placement_matrix() * Matrix3::new_nonuniform_scaling(&Vector2::new(self.scale, self.scale))
    }

    /// The part of the mapping applied after scaling: letterbox translation
    /// and rotation.  Maps scaled-image pixels to canvas pixels.
    pub fn placement_matrix(&self) -> Matrix3<f32> {
        let translate = Matrix3::new_translation(&Vector2::new(self.dx, self.dy));
        if !self.rotated {
            return translate;
        }
        let centre = Vector2::new(
            self.canvas_width as f32 / 2.0,
            self.canvas_height as f32 / 2.0,
        );
        Matrix3::new_translation(&centre)
            * Matrix3::new_rotation(self.rotation_degrees.to_radians())
            * Matrix3::new_translation(&-centre)
            * translate
    }

    /// Map a source pixel position onto the canvas.
    pub fn map_point(&self, x: f32, y: f32) -> (f32, f32) {
        let p = self.matrix().transform_point(&Point2::new(x, y));
        (p.x, p.y)
    }

    /// Project a normalized canvas box back into source pixel coordinates as
    /// `(x1, y1, x2, y2)`.  `None` if the transform is singular.
    pub fn bbox_to_source(&self, bbox: &BBox) -> Option<(f32, f32, f32, f32)> {
        let inverse = self.matrix().try_inverse()?;
        let cw = self.canvas_width as f32;
        let ch = self.canvas_height as f32;
        let a = inverse.transform_point(&Point2::new(bbox.left * cw, bbox.top * ch));
        let b = inverse.transform_point(&Point2::new(bbox.right * cw, bbox.bottom * ch));
        Some((a.x.min(b.x), a.y.min(b.y), a.x.max(b.x), a.y.max(b.y)))
    }
}

/// Normalize a sensor rotation hint to one of 0/90/180/270.
pub fn normalize_rotation(degrees: i32) -> Result<u32> {
    let normalized = degrees.rem_euclid(360);
    if normalized % 90 != 0 {
        bail!("rotation must be a multiple of 90 degrees, got {degrees}");
    }
    Ok(normalized as u32)
}

/// Compute the source → canvas transform.
///
/// `scale = min(canvas_w / source_w, canvas_h / source_h)` so the whole
/// source fits; the scaled image is centred.  A non-zero rotation is undone
/// about the canvas centre only on a portrait display; in landscape the
/// sensor rotation is already display-relative.
pub fn build_canvas_transform(
    source_width: u32,
    source_height: u32,
    canvas_width: u32,
    canvas_height: u32,
    rotation_degrees: u32,
    landscape_display: bool,
) -> Result<GeometryTransform> {
    if source_width == 0 || source_height == 0 {
        bail!("source frame has zero size ({source_width}x{source_height})");
    }
    if canvas_width == 0 || canvas_height == 0 {
        bail!("canvas has zero size ({canvas_width}x{canvas_height})");
    }

    let (sw, sh) = (source_width as f32, source_height as f32);
    let (cw, ch) = (canvas_width as f32, canvas_height as f32);
    let scale = (cw / sw).min(ch / sh);
    let dx = (cw - sw * scale) / 2.0;
    let dy = (ch - sh * scale) / 2.0;

    let rotated = rotation_degrees != 0 && !landscape_display;
    Ok(GeometryTransform {
        scale,
        dx,
        dy,
        rotation_degrees: if rotated {
            -(rotation_degrees as f32)
        } else {
            0.0
        },
        rotated,
        canvas_width,
        canvas_height,
    })
}

// ── GeometryMapper ───────────────────────────────────────────────────────────

/// Owns the cached canvas transform and the resampling scratch buffers.
/// Lives on the pipeline thread.
pub struct GeometryMapper {
    cached: Option<(GeometryKey, GeometryTransform)>,
    /// Canvas → scaled-image mapping for the placement step.
    inverse_placement: Matrix3<f32>,
    resizer: fr::Resizer,
    scaled_buf: Vec<u8>,
    scaled_width: u32,
    scaled_height: u32,
}

impl GeometryMapper {
    pub fn new() -> Self {
        Self {
            cached: None,
            inverse_placement: Matrix3::identity(),
            resizer: fr::Resizer::new(),
            scaled_buf: Vec::new(),
            scaled_width: 0,
            scaled_height: 0,
        }
    }

    /// Return the transform for `key`, recomputing only when the key changed.
    /// The flag is `true` when a recompute happened, i.e. the caller must
    /// (re)allocate its backing canvas.
    pub fn prepare(&mut self, key: GeometryKey) -> Result<(GeometryTransform, bool)> {
        if let Some((cached_key, transform)) = self.cached {
            if cached_key == key {
                return Ok((transform, false));
            }
        }

        let transform = build_canvas_transform(
            key.source_width,
            key.source_height,
            key.canvas_width,
            key.canvas_height,
            key.rotation,
            key.landscape_display,
        )?;
        self.inverse_placement = transform
            .placement_matrix()
            .try_inverse()
            .context("canvas placement transform is not invertible")?;
        self.scaled_width = ((key.source_width as f32 * transform.scale).round() as u32).max(1);
        self.scaled_height = ((key.source_height as f32 * transform.scale).round() as u32).max(1);
        self.scaled_buf = vec![0u8; (self.scaled_width * self.scaled_height * 3) as usize];
        self.cached = Some((key, transform));

        debug!(
            ?key,
            scale = transform.scale,
            dx = transform.dx,
            dy = transform.dy,
            "recomputed canvas transform"
        );
        Ok((transform, true))
    }

    /// The transform currently cached, if any.
    pub fn current(&self) -> Option<&GeometryTransform> {
        self.cached.as_ref().map(|(_, t)| t)
    }

    /// Draw `frame` onto `canvas` through the prepared transform: black fill,
    /// bilinear downscale, then exact placement (rotations are multiples of
    /// 90°, so sampling pixel centres is lossless).
    pub fn render_canvas(&mut self, frame: &SourceFrame, canvas: &mut RgbImage) -> Result<()> {
        let Some((key, _)) = self.cached else {
            bail!("render_canvas called before prepare");
        };
        if canvas.width() != key.canvas_width || canvas.height() != key.canvas_height {
            bail!(
                "canvas is {}x{}, transform expects {}x{}",
                canvas.width(),
                canvas.height(),
                key.canvas_width,
                key.canvas_height
            );
        }
        if frame.width != key.source_width || frame.height != key.source_height {
            bail!("frame size changed without a new prepare");
        }

        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create fast_image_resize source for canvas")?;
        let mut dst = fr::images::Image::from_vec_u8(
            self.scaled_width,
            self.scaled_height,
            std::mem::take(&mut self.scaled_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize destination for canvas")?;
        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize canvas downscale failed")?;
        self.scaled_buf = dst.into_vec();

        let scaled = &self.scaled_buf;
        let (sw, sh) = (self.scaled_width as i64, self.scaled_height as i64);
        let inverse = self.inverse_placement;
        let row_len = key.canvas_width as usize * 3;

        canvas
            .par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..key.canvas_width as usize {
                    let p = inverse.transform_point(&Point2::new(x as f32 + 0.5, y as f32 + 0.5));
                    let (sx, sy) = (p.x.floor() as i64, p.y.floor() as i64);
                    let out = &mut row[x * 3..x * 3 + 3];
                    if sx < 0 || sy < 0 || sx >= sw || sy >= sh {
                        out.fill(0);
                    } else {
                        let idx = ((sy * sw + sx) * 3) as usize;
                        out.copy_from_slice(&scaled[idx..idx + 3]);
                    }
                }
            });

        Ok(())
    }
}

impl Default for GeometryMapper {
    fn default() -> Self {
        Self::new()
    }
}

// ── Screen mapping ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

/// The render surface as it is right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewGeometry {
    pub width: u32,
    pub height: u32,
    pub orientation: Orientation,
}

/// Axis-aligned rectangle in screen pixels, `x1 <= x2` and `y1 <= y2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenRect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl ScreenRect {
    pub fn from_corners(ax: f32, ay: f32, bx: f32, by: f32) -> Self {
        Self {
            x1: ax.min(bx),
            y1: ay.min(by),
            x2: ax.max(bx),
            y2: ay.max(by),
        }
    }

    pub fn full_view(view: &ViewGeometry) -> Self {
        Self::from_corners(0.0, 0.0, view.width as f32, view.height as f32)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x1 && x < self.x2 && y >= self.y1 && y < self.y2
    }
}

/// Map a normalized canvas box to screen pixels for the front-camera preview.
///
/// A square virtual frame of side `max(view_w, view_h)` keeps the mapping
/// symmetric between orientations; the offsets centre it on the view.  The
/// preview is mirrored horizontally, and in landscape the canvas axes are
/// swapped onto the screen.
pub fn screen_rect(bbox: &BBox, view: &ViewGeometry) -> ScreenRect {
    let (vw, vh) = (view.width as f32, view.height as f32);
    let virtual_size = vw.max(vh);
    let virtual_dx = (virtual_size - vw) / 2.0;
    let virtual_dy = (virtual_size - vh) / 2.0;

    match view.orientation {
        Orientation::Portrait => ScreenRect::from_corners(
            vw - (virtual_size * bbox.left - virtual_dx),
            virtual_size * bbox.top - virtual_dy,
            vw - (virtual_size * bbox.right - virtual_dx),
            virtual_size * bbox.bottom - virtual_dy,
        ),
        Orientation::Landscape => ScreenRect::from_corners(
            vw - (virtual_size * bbox.top - virtual_dx),
            vh - (virtual_size * bbox.left - virtual_dy),
            vw - (virtual_size * bbox.bottom - virtual_dx),
            vh - (virtual_size * bbox.right - virtual_dy),
        ),
    }
}

/// Inverse of [`screen_rect`] for a single point: screen pixels → normalized
/// canvas `(x, y)`.  Used to turn a tap into a tracker seed.
pub fn screen_to_normalized(x: f32, y: f32, view: &ViewGeometry) -> (f32, f32) {
    let (vw, vh) = (view.width as f32, view.height as f32);
    let virtual_size = vw.max(vh);
    if virtual_size <= 0.0 {
        return (0.0, 0.0);
    }
    let virtual_dx = (virtual_size - vw) / 2.0;
    let virtual_dy = (virtual_size - vh) / 2.0;

    match view.orientation {
        Orientation::Portrait => (
            (vw + virtual_dx - x) / virtual_size,
            (y + virtual_dy) / virtual_size,
        ),
        Orientation::Landscape => (
            (vh + virtual_dy - y) / virtual_size,
            (vw + virtual_dx - x) / virtual_size,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sw: u32, sh: u32, rotation: u32, landscape: bool) -> GeometryKey {
        GeometryKey {
            source_width: sw,
            source_height: sh,
            canvas_width: 300,
            canvas_height: 300,
            rotation,
            landscape_display: landscape,
        }
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn letterboxes_4_3_source_into_square_canvas() {
        let t = build_canvas_transform(1600, 1200, 300, 300, 0, false).unwrap();
        assert!(close(t.scale, 0.1875));
        assert!(close(t.dx, 0.0));
        assert!(close(t.dy, 37.5));
        assert!(!t.rotated);

        let (x, y) = t.map_point(1600.0, 1200.0);
        assert!(close(x, 300.0) && close(y, 262.5));
    }

    #[test]
    fn portrait_rotation_is_undone_about_the_centre() {
        let t = build_canvas_transform(1600, 1200, 300, 300, 270, false).unwrap();
        assert!(t.rotated);
        assert!(close(t.rotation_degrees, -270.0));
        // Canvas centre is a fixed point of the rotation.
        let (cx, cy) = t.map_point(800.0, 600.0);
        assert!(close(cx, 150.0) && close(cy, 150.0));
        // The letterboxed band now runs vertically: the source's top-left
        // corner lands on the left band edge.
        let (x, y) = t.map_point(0.0, 0.0);
        assert!(close(x, 37.5) || close(x, 262.5));
        assert!(close(y, 0.0) || close(y, 300.0));
    }

    #[test]
    fn landscape_display_ignores_sensor_rotation() {
        let t = build_canvas_transform(1600, 1200, 300, 300, 90, true).unwrap();
        assert!(!t.rotated);
        assert_eq!(t.rotation_degrees, 0.0);
    }

    #[test]
    fn zero_sized_inputs_are_rejected() {
        assert!(build_canvas_transform(0, 1200, 300, 300, 0, false).is_err());
        assert!(build_canvas_transform(1600, 1200, 300, 0, 0, false).is_err());
    }

    #[test]
    fn rotation_hints_are_normalized() {
        assert_eq!(normalize_rotation(-90).unwrap(), 270);
        assert_eq!(normalize_rotation(450).unwrap(), 90);
        assert!(normalize_rotation(45).is_err());
    }

    #[test]
    fn prepare_recomputes_only_on_key_change() {
        let mut mapper = GeometryMapper::new();
        let (_, first) = mapper.prepare(key(1600, 1200, 0, false)).unwrap();
        let (_, again) = mapper.prepare(key(1600, 1200, 0, false)).unwrap();
        let (_, rotated) = mapper.prepare(key(1600, 1200, 90, false)).unwrap();
        let (_, resized) = mapper.prepare(key(1280, 720, 90, false)).unwrap();
        assert!(first);
        assert!(!again);
        assert!(rotated);
        assert!(resized);
    }

    #[test]
    fn canvas_render_letterboxes_with_black_bands() {
        let mut mapper = GeometryMapper::new();
        let frame = SourceFrame::new(vec![200u8; 1600 * 1200 * 3], 1600, 1200, 0, 0);
        mapper.prepare(key(1600, 1200, 0, false)).unwrap();
        let mut canvas = RgbImage::new(300, 300);
        mapper.render_canvas(&frame, &mut canvas).unwrap();

        assert_eq!(canvas.get_pixel(150, 10).0, [0, 0, 0]);
        assert_eq!(canvas.get_pixel(150, 290).0, [0, 0, 0]);
        assert_eq!(canvas.get_pixel(150, 150).0, [200, 200, 200]);
    }

    #[test]
    fn canvas_render_rotates_band_in_portrait() {
        let mut mapper = GeometryMapper::new();
        let frame = SourceFrame::new(vec![200u8; 1600 * 1200 * 3], 1600, 1200, 90, 0);
        mapper.prepare(key(1600, 1200, 90, false)).unwrap();
        let mut canvas = RgbImage::new(300, 300);
        mapper.render_canvas(&frame, &mut canvas).unwrap();

        // Bands moved to the left and right edges.
        assert_eq!(canvas.get_pixel(10, 150).0, [0, 0, 0]);
        assert_eq!(canvas.get_pixel(290, 150).0, [0, 0, 0]);
        assert_eq!(canvas.get_pixel(150, 10).0, [200, 200, 200]);
    }

    #[test]
    fn render_without_prepare_fails() {
        let mut mapper = GeometryMapper::new();
        let frame = SourceFrame::new(vec![0u8; 12], 2, 2, 0, 0);
        let mut canvas = RgbImage::new(300, 300);
        assert!(mapper.render_canvas(&frame, &mut canvas).is_err());
    }

    #[test]
    fn bbox_projects_back_to_source_pixels() {
        let t = build_canvas_transform(1600, 1200, 300, 300, 0, false).unwrap();
        let bbox = BBox {
            top: 37.5 / 300.0,
            left: 0.0,
            bottom: 262.5 / 300.0,
            right: 1.0,
            ..BBox::default()
        };
        let (x1, y1, x2, y2) = t.bbox_to_source(&bbox).unwrap();
        assert!((x1 - 0.0).abs() < 0.5 && (y1 - 0.0).abs() < 0.5);
        assert!((x2 - 1600.0).abs() < 0.5 && (y2 - 1200.0).abs() < 0.5);
    }

    #[test]
    fn portrait_screen_mapping_mirrors_horizontally() {
        let view = ViewGeometry {
            width: 1000,
            height: 1000,
            orientation: Orientation::Portrait,
        };
        let bbox = BBox {
            top: 0.1,
            left: 0.1,
            bottom: 0.5,
            right: 0.3,
            ..BBox::default()
        };
        let r = screen_rect(&bbox, &view);
        assert!(close(r.x1, 700.0) && close(r.x2, 900.0));
        assert!(close(r.y1, 100.0) && close(r.y2, 500.0));
    }

    #[test]
    fn non_square_view_uses_centred_virtual_square() {
        let view = ViewGeometry {
            width: 600,
            height: 1000,
            orientation: Orientation::Portrait,
        };
        let whole = BBox {
            top: 0.0,
            left: 0.0,
            bottom: 1.0,
            right: 1.0,
            ..BBox::default()
        };
        let r = screen_rect(&whole, &view);
        // 1000px virtual square centred on a 600px wide view overhangs by 200 each side.
        assert!(close(r.x1, -200.0) && close(r.x2, 800.0));
        assert!(close(r.y1, 0.0) && close(r.y2, 1000.0));
    }

    #[test]
    fn landscape_screen_mapping_swaps_axes() {
        let view = ViewGeometry {
            width: 1000,
            height: 1000,
            orientation: Orientation::Landscape,
        };
        let bbox = BBox {
            top: 0.1,
            left: 0.2,
            bottom: 0.3,
            right: 0.6,
            ..BBox::default()
        };
        let r = screen_rect(&bbox, &view);
        // Canvas rows drive screen x, canvas columns drive screen y.
        assert!(close(r.x1, 700.0) && close(r.x2, 900.0));
        assert!(close(r.y1, 400.0) && close(r.y2, 800.0));
    }

    #[test]
    fn tap_maps_back_to_box_centre() {
        let b = BBox {
            top: 0.2,
            left: 0.3,
            bottom: 0.6,
            right: 0.5,
            ..BBox::default()
        };
        for orientation in [Orientation::Portrait, Orientation::Landscape] {
            let view = ViewGeometry {
                width: 720,
                height: 1280,
                orientation,
            };
            let r = screen_rect(&b, &view);
            let (nx, ny) =
                screen_to_normalized((r.x1 + r.x2) / 2.0, (r.y1 + r.y2) / 2.0, &view);
            assert!(close(nx, 0.4), "{orientation:?}: x = {nx}");
            assert!(close(ny, 0.4), "{orientation:?}: y = {ny}");
        }
    }
}
