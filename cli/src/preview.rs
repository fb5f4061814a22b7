//! Software stand-in for the front-camera preview surface.

use image::{imageops, ImageBuffer, Rgb, RgbImage};
use privacy_core::geometry::{Orientation, ViewGeometry};
use privacy_core::video::SourceFrame;

/// Lay `frame` out the way the overlay's screen mapping assumes: fitted into
/// a square of side `max(view_w, view_h)`, mirrored (axes swapped in
/// landscape), then centre-cropped to the view.  `None` for a frame whose
/// buffer doesn't match its size.
pub fn background(frame: &SourceFrame, view: &ViewGeometry) -> Option<RgbImage> {
    if frame.is_degenerate() || view.width == 0 || view.height == 0 {
        return None;
    }
    let src: ImageBuffer<Rgb<u8>, &[u8]> = ImageBuffer::from_raw(
        frame.width,
        frame.height,
        &frame.data[..(frame.width * frame.height * 3) as usize],
    )?;

    let side = view.width.max(view.height);
    let scale = (side as f32 / frame.width as f32).min(side as f32 / frame.height as f32);
    let sw = ((frame.width as f32 * scale).round() as u32).clamp(1, side);
    let sh = ((frame.height as f32 * scale).round() as u32).clamp(1, side);
    let scaled = imageops::resize(&src, sw, sh, imageops::FilterType::Triangle);

    let mut square = RgbImage::new(side, side);
    imageops::overlay(
        &mut square,
        &scaled,
        ((side - sw) / 2) as i64,
        ((side - sh) / 2) as i64,
    );

    let placed = match view.orientation {
        Orientation::Portrait => imageops::flip_horizontal(&square),
        Orientation::Landscape => imageops::flip_vertical(&imageops::rotate90(&square)),
    };
    let dx = (side - view.width) / 2;
    let dy = (side - view.height) / 2;
    Some(imageops::crop_imm(&placed, dx, dy, view.width, view.height).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portrait_preview_is_mirrored() {
        // Left half red, right half blue.
        let mut img = RgbImage::from_pixel(40, 40, Rgb([0, 0, 255]));
        for y in 0..40 {
            for x in 0..20 {
                img.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }
        let frame = SourceFrame::new(img.into_raw(), 40, 40, 0, 0);
        let view = ViewGeometry {
            width: 40,
            height: 40,
            orientation: Orientation::Portrait,
        };
        let bg = background(&frame, &view).unwrap();
        assert_eq!(bg.get_pixel(35, 20).0, [255, 0, 0]);
        assert_eq!(bg.get_pixel(5, 20).0, [0, 0, 255]);
    }

    #[test]
    fn crops_the_virtual_square_to_the_view() {
        let frame = SourceFrame::new(vec![90u8; 30 * 30 * 3], 30, 30, 0, 0);
        let view = ViewGeometry {
            width: 20,
            height: 60,
            orientation: Orientation::Portrait,
        };
        let bg = background(&frame, &view).unwrap();
        assert_eq!(bg.dimensions(), (20, 60));
    }

    #[test]
    fn degenerate_frames_have_no_preview() {
        let frame = SourceFrame::new(vec![0u8; 5], 30, 30, 0, 0);
        let view = ViewGeometry {
            width: 20,
            height: 20,
            orientation: Orientation::Portrait,
        };
        assert!(background(&frame, &view).is_none());
    }
}
