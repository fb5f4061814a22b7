//! Whole-frame background removal from a semantic label map.
//!
//! A segmentation model labels every pixel of a frame resized so its longest
//! side is `input_size`; pixels whose class is not the kept one (PASCAL VOC
//! "person" by default) are painted over.  The output stays at the resized
//! size.

use anyhow::{bail, Context, Result};
use fast_image_resize as fr;
use image::RgbImage;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

use crate::video::SourceFrame;

/// PASCAL VOC class index of "person".
pub const PERSON_CLASS: i64 = 15;
/// Longest side fed to DeepLabV3.
pub const DEFAULT_SEGMENTATION_SIZE: u32 = 513;
pub const BACKGROUND_FILL: [u8; 3] = [255, 255, 255];

// ── Label map ────────────────────────────────────────────────────────────────

/// Per-pixel class indices, row-major.  The storage is kept across frames
/// and only grows.
#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    width: u32,
    height: u32,
    classes: Vec<i64>,
}

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resize to `width`×`height`; every label is reset to 0 (background).
    pub fn reshape(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.classes.clear();
        self.classes.resize(width as usize * height as usize, 0);
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn get(&self, x: u32, y: u32) -> Option<i64> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.classes
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    pub fn classes_mut(&mut self) -> &mut [i64] {
        &mut self.classes
    }
}

/// Labels every pixel of an image.
pub trait Segmenter: Send {
    /// Write one class per pixel of `image` into `labels`, reshaping it to
    /// the image size.
    fn segment(&mut self, image: &RgbImage, labels: &mut LabelMap) -> Result<()>;
}

// ── DeepLab backend ──────────────────────────────────────────────────────────

/// Tensor names of a DeepLabV3 export.
#[derive(Debug, Clone)]
pub struct DeepLabTensorNames {
    pub input: String,
    pub output: String,
}

impl Default for DeepLabTensorNames {
    fn default() -> Self {
        Self {
            input: "ImageTensor:0".into(),
            output: "SemanticPredictions:0".into(),
        }
    }
}

/// DeepLabV3 on ONNX Runtime: raw `u8` NHWC in, `[1, H, W]` class indices out.
pub struct DeepLabSegmenter {
    session: Session,
    names: DeepLabTensorNames,
    /// Input tensor, reused while the frame size stays the same.
    input: Option<((u32, u32), Tensor<u8>)>,
}

impl DeepLabSegmenter {
    pub fn load<P: AsRef<Path>>(model_path: P, names: DeepLabTensorNames) -> Result<Self> {
        let model_path = model_path.as_ref();
        let session = super::build_ort_session(model_path)?;
        debug!(model = %model_path.display(), "segmentation model loaded");
        Ok(Self {
            session,
            names,
            input: None,
        })
    }
}

impl Segmenter for DeepLabSegmenter {
    fn segment(&mut self, image: &RgbImage, labels: &mut LabelMap) -> Result<()> {
        let (width, height) = image.dimensions();
        let tensor = match self.input.take() {
            Some((size, tensor)) if size == (width, height) => tensor,
            _ => {
                let shape = [1usize, height as usize, width as usize, 3];
                let zeros = vec![0u8; shape.iter().product()];
                Tensor::from_array((shape, zeros.into_boxed_slice()))
                    .context("failed to create segmentation input tensor")?
            }
        };
        let input = &mut self.input.insert(((width, height), tensor)).1;
        let (_, buf) = input.extract_tensor_mut();
        buf.copy_from_slice(image.as_raw());

        let outputs = self
            .session
            .run(ort::inputs![self.names.input.as_str() => input.view()])
            .context("segmentation inference failed")?;
        let (_, predictions) = outputs[self.names.output.as_str()]
            .try_extract_tensor::<i64>()
            .context("failed to extract segmentation map")?;

        labels.reshape(width, height);
        if predictions.len() != labels.classes().len() {
            bail!(
                "segmentation map has {} labels, expected {}x{}",
                predictions.len(),
                width,
                height
            );
        }
        labels.classes_mut().copy_from_slice(predictions);
        Ok(())
    }
}

// ── Masking ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentationParams {
    pub input_size: u32,
    pub keep_class: i64,
    pub fill: [u8; 3],
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_SEGMENTATION_SIZE,
            keep_class: PERSON_CLASS,
            fill: BACKGROUND_FILL,
        }
    }
}

/// Size a `width`×`height` frame is resampled to: longest side
/// `input_size`, each side truncated.
pub fn segmentation_size(width: u32, height: u32, input_size: u32) -> (u32, u32) {
    let ratio = input_size as f64 / width.max(height).max(1) as f64;
    let w = ((width as f64 * ratio) as u32).max(1);
    let h = ((height as f64 * ratio) as u32).max(1);
    (w, h)
}

/// Paint every pixel whose label isn't `keep_class` with `fill`.  Returns the
/// number of pixels painted.
pub fn mask_background(
    img: &mut RgbImage,
    labels: &LabelMap,
    keep_class: i64,
    fill: [u8; 3],
) -> usize {
    let width = img.width() as usize;
    if width == 0 || labels.dimensions() != img.dimensions() {
        return 0;
    }
    img.par_chunks_mut(width * 3)
        .zip(labels.classes().par_chunks(width))
        .map(|(row, classes)| {
            let mut painted = 0;
            for (px, &class) in row.chunks_exact_mut(3).zip(classes) {
                if class != keep_class {
                    px.copy_from_slice(&fill);
                    painted += 1;
                }
            }
            painted
        })
        .sum()
}

/// Resample → segment → mask, with the resampler and label map reused
/// across frames.
pub struct SegmentationMasker {
    segmenter: Box<dyn Segmenter>,
    params: SegmentationParams,
    resizer: fr::Resizer,
    labels: LabelMap,
}

impl SegmentationMasker {
    pub fn new(segmenter: Box<dyn Segmenter>, params: SegmentationParams) -> Result<Self> {
        if params.input_size == 0 {
            bail!("segmentation input size must be non-zero");
        }
        Ok(Self {
            segmenter,
            params,
            resizer: fr::Resizer::new(),
            labels: LabelMap::new(),
        })
    }

    pub fn params(&self) -> &SegmentationParams {
        &self.params
    }

    /// The label map of the last masked frame.
    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    /// Remove the background from `frame`.  The result is at the segmentation
    /// size, not the source size.
    pub fn apply(&mut self, frame: &SourceFrame) -> Result<RgbImage> {
        if frame.is_degenerate() {
            bail!("cannot segment a {}x{} frame", frame.width, frame.height);
        }
        let (w, h) = segmentation_size(frame.width, frame.height, self.params.input_size);

        let len = frame.width as usize * frame.height as usize * 3;
        let src = fr::images::ImageRef::new(
            frame.width,
            frame.height,
            &frame.data[..len],
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize source for segmentation")?;
        let mut dst = fr::images::Image::new(w, h, fr::PixelType::U8x3);
        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize segmentation resize failed")?;
        let mut img = RgbImage::from_raw(w, h, dst.into_vec())
            .context("resized segmentation buffer has the wrong length")?;

        self.segmenter.segment(&img, &mut self.labels)?;
        if self.labels.dimensions() != (w, h) {
            bail!(
                "segmenter returned a {:?} label map for a {w}x{h} image",
                self.labels.dimensions()
            );
        }
        let params = self.params;
        let painted = mask_background(&mut img, &self.labels, params.keep_class, params.fill);
        debug!(width = w, height = h, painted, "background masked");
        Ok(img)
    }
}
