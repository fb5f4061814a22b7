//! config — TOML pipeline configuration
//!
//! Every key is optional; missing keys fall back to the defaults below.
//!
//! ```toml
//! [detector]
//! model = "models/ssd_mobilenet_v2.onnx"
//! input_width = 300
//! input_height = 300
//!
//! [tracking]
//! score_threshold = 0.4
//!
//! [overlay]
//! privacy_enabled = true
//! reveal = "tracked"
//! view_width = 1080
//! view_height = 1920
//! orientation = "portrait"
//!
//! [source]
//! rotation = 270
//!
//! [segmentation]
//! model = "models/deeplabv3.onnx"
//! input_size = 513
//! keep_class = 15
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::detection::{
    DeepLabTensorNames, SegmentationParams, SsdTensorNames, BACKGROUND_FILL,
    DEFAULT_SEGMENTATION_SIZE, PERSON_CLASS, SSD_NUM_BOXES,
};
use crate::geometry::{Orientation, ViewGeometry};
use crate::rendering::{NoResultsPolicy, OverlayParams, RevealPolicy};
use crate::tracking::TemplateParams;

const DEFAULT_MODEL_PATH: &str = "models/ssd_mobilenet_v2.onnx";
const DEFAULT_INPUT_SIZE: u32 = 300;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.4;
const DEFAULT_SUBJECT_LABEL: &str = "person";
const DEFAULT_VIEW_WIDTH: u32 = 1080;
const DEFAULT_VIEW_HEIGHT: u32 = 1920;
const DEFAULT_SEGMENTATION_MODEL: &str = "models/deeplabv3.onnx";

// ── File layout ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    detector: Option<DetectorFile>,
    tracking: Option<TrackingFile>,
    overlay: Option<OverlayFile>,
    source: Option<SourceFile>,
    segmentation: Option<SegmentationFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorFile {
    model: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    capacity: Option<usize>,
    input_tensor: Option<String>,
    boxes_tensor: Option<String>,
    scores_tensor: Option<String>,
    classes_tensor: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrackingFile {
    score_threshold: Option<f32>,
    search_margin: Option<f32>,
    max_match_error: Option<f32>,
    min_patch_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OverlayFile {
    privacy_enabled: Option<bool>,
    subject_label: Option<String>,
    block_all: Option<bool>,
    reveal: Option<RevealPolicy>,
    no_results: Option<NoResultsPolicy>,
    view_width: Option<u32>,
    view_height: Option<u32>,
    orientation: Option<Orientation>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceFile {
    rotation: Option<i32>,
    landscape: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SegmentationFile {
    model: Option<PathBuf>,
    input_size: Option<u32>,
    keep_class: Option<i64>,
    fill: Option<[u8; 3]>,
    input_tensor: Option<String>,
    output_tensor: Option<String>,
}

// ── Resolved settings ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub detector: DetectorSettings,
    pub tracking: TrackingSettings,
    pub overlay: OverlaySettings,
    pub source: SourceSettings,
    pub segmentation: SegmentationSettings,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub model: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
    pub capacity: usize,
    pub tensors: SsdTensorNames,
}

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    pub score_threshold: f32,
    pub template: TemplateParams,
}

#[derive(Debug, Clone)]
pub struct OverlaySettings {
    pub privacy_enabled: bool,
    pub subject_label: String,
    pub block_all: bool,
    pub reveal: RevealPolicy,
    pub no_results: NoResultsPolicy,
    pub view: ViewGeometry,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Sensor rotation, one of 0/90/180/270.
    pub rotation: u32,
    /// Whether the display is in landscape (sensor rotation is then ignored
    /// when building the canvas).
    pub landscape: bool,
}

/// Background removal (`segment` command); independent of the detector.
#[derive(Debug, Clone)]
pub struct SegmentationSettings {
    pub model: PathBuf,
    pub params: SegmentationParams,
    pub tensors: DeepLabTensorNames,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl PipelineConfig {
    /// Read, resolve and validate a TOML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents).context("failed to parse TOML")?;
        let cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Self {
        let det = file.detector.unwrap_or_default();
        let names = SsdTensorNames::default();
        let detector = DetectorSettings {
            model: det.model.unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            input_width: det.input_width.unwrap_or(DEFAULT_INPUT_SIZE),
            input_height: det.input_height.unwrap_or(DEFAULT_INPUT_SIZE),
            capacity: det.capacity.unwrap_or(SSD_NUM_BOXES),
            tensors: SsdTensorNames {
                input: det.input_tensor.unwrap_or(names.input),
                boxes: det.boxes_tensor.unwrap_or(names.boxes),
                scores: det.scores_tensor.unwrap_or(names.scores),
                classes: det.classes_tensor.unwrap_or(names.classes),
            },
        };

        let trk = file.tracking.unwrap_or_default();
        let template_defaults = TemplateParams::default();
        let tracking = TrackingSettings {
            score_threshold: trk.score_threshold.unwrap_or(DEFAULT_SCORE_THRESHOLD),
            template: TemplateParams {
                search_margin: trk.search_margin.unwrap_or(template_defaults.search_margin),
                max_match_error: trk
                    .max_match_error
                    .unwrap_or(template_defaults.max_match_error),
                min_patch_size: trk.min_patch_size.unwrap_or(template_defaults.min_patch_size),
            },
        };

        let ov = file.overlay.unwrap_or_default();
        let overlay = OverlaySettings {
            privacy_enabled: ov.privacy_enabled.unwrap_or(true),
            subject_label: ov
                .subject_label
                .unwrap_or_else(|| DEFAULT_SUBJECT_LABEL.to_string()),
            block_all: ov.block_all.unwrap_or(false),
            reveal: ov.reveal.unwrap_or_default(),
            no_results: ov.no_results.unwrap_or_default(),
            view: ViewGeometry {
                width: ov.view_width.unwrap_or(DEFAULT_VIEW_WIDTH),
                height: ov.view_height.unwrap_or(DEFAULT_VIEW_HEIGHT),
                orientation: ov.orientation.unwrap_or_default(),
            },
        };

        let src = file.source.unwrap_or_default();
        let source = SourceSettings {
            rotation: src.rotation.unwrap_or(0).rem_euclid(360) as u32,
            landscape: src.landscape.unwrap_or(false),
        };

        let seg = file.segmentation.unwrap_or_default();
        let seg_names = DeepLabTensorNames::default();
        let segmentation = SegmentationSettings {
            model: seg
                .model
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SEGMENTATION_MODEL)),
            params: SegmentationParams {
                input_size: seg.input_size.unwrap_or(DEFAULT_SEGMENTATION_SIZE),
                keep_class: seg.keep_class.unwrap_or(PERSON_CLASS),
                fill: seg.fill.unwrap_or(BACKGROUND_FILL),
            },
            tensors: DeepLabTensorNames {
                input: seg.input_tensor.unwrap_or(seg_names.input),
                output: seg.output_tensor.unwrap_or(seg_names.output),
            },
        };

        Self {
            detector,
            tracking,
            overlay,
            source,
            segmentation,
        }
    }

    /// Check ranges.  Called after loading and again after CLI overrides.
    pub fn validate(&self) -> Result<()> {
        let t = self.tracking.score_threshold;
        if !(0.0..=1.0).contains(&t) {
            bail!("[tracking] score_threshold must be within [0, 1], got {t}");
        }
        if self.tracking.template.search_margin < 0.0 {
            bail!("[tracking] search_margin must not be negative");
        }
        let max_err = self.tracking.template.max_match_error;
        if !max_err.is_finite() || max_err <= 0.0 {
            bail!("[tracking] max_match_error must be positive");
        }
        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            bail!("[detector] input size must be non-zero");
        }
        if self.detector.capacity == 0 {
            bail!("[detector] capacity must be non-zero");
        }
        if self.overlay.view.width == 0 || self.overlay.view.height == 0 {
            bail!("[overlay] view size must be non-zero");
        }
        if self.overlay.subject_label.trim().is_empty() {
            bail!("[overlay] subject_label must not be empty");
        }
        if !matches!(self.source.rotation, 0 | 90 | 180 | 270) {
            bail!("[source] rotation must be 0, 90, 180 or 270");
        }
        if self.segmentation.params.input_size == 0 {
            bail!("[segmentation] input_size must be non-zero");
        }
        Ok(())
    }

    pub fn overlay_params(&self) -> OverlayParams {
        OverlayParams {
            privacy_enabled: self.overlay.privacy_enabled,
            score_threshold: self.tracking.score_threshold,
            subject_label: self.overlay.subject_label.clone(),
            block_all: self.overlay.block_all,
            reveal: self.overlay.reveal,
            no_results: self.overlay.no_results,
        }
    }
}
