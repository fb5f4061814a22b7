use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use privacy_core::{
    config::PipelineConfig,
    detection::{draw_boxes, DeepLabSegmenter, SegmentationMasker},
    geometry::{normalize_rotation, Orientation, ViewGeometry},
    pipeline::Pipeline,
    rendering::RevealPolicy,
    runtime::{configure_ort_dylib, Session},
    video::{select_preview_resolution, Resolution, SourceFrame},
};

mod preview;

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "privacy-lock",
    version,
    about = "Track one subject and mask everyone else",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a clip as a live feed and write the composited preview frames.
    #[cfg(feature = "video-file")]
    Run {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,

        /// Directory for the composited PNG frames
        #[arg(short, long, default_value = "overlay_frames")]
        output: PathBuf,

        /// Tap point on the view ("X,Y" in view pixels) to lock onto
        #[arg(long)]
        tap: Option<String>,

        /// Write every Nth preview frame
        #[arg(long, default_value_t = 1)]
        every: u64,

        /// Stop the session after this many source frames
        #[arg(long)]
        max_frames: Option<u64>,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Run one image through the pipeline and draw the detected boxes.
    Detect {
        /// Input image path
        #[arg(short, long)]
        input: PathBuf,

        /// Output image with boxes drawn in source pixels
        #[arg(short, long, default_value = "detected.png")]
        output: PathBuf,

        /// Also write the privacy overlay composited onto the image
        #[arg(long)]
        overlay: Option<PathBuf>,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Whiten everything but people in an image or clip.
    Segment {
        /// Input image or video path
        #[arg(short, long)]
        input: PathBuf,

        /// Output PNG for an image; directory of PNG frames for a clip
        #[arg(short, long, default_value = "segmented")]
        output: PathBuf,

        /// TOML config file ([segmentation] section)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// DeepLabV3 ONNX model path
        #[arg(long)]
        model: Option<PathBuf>,

        /// Write every Nth frame of a clip
        #[arg(long, default_value_t = 1)]
        every: u64,

        /// Stop after this many clip frames
        #[arg(long)]
        max_frames: Option<u64>,
    },

    /// Pick the preview resolution for a detector input size.
    Resolution {
        /// Supported sizes, e.g. 640x480,1280x720
        #[arg(long, required = true, value_delimiter = ',')]
        candidates: Vec<Resolution>,

        /// Requested size
        #[arg(long, default_value = "300x300")]
        target: Resolution,
    },
}

/// Config file plus the overrides shared by every pipeline command.
#[derive(Args)]
struct PipelineArgs {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SSD ONNX model path
    #[arg(long)]
    model: Option<PathBuf>,

    /// Score threshold (0–1)
    #[arg(long)]
    threshold: Option<f32>,

    /// Show everything unmasked
    #[arg(long)]
    no_privacy: bool,

    /// Reveal only the tracked subject
    #[arg(long)]
    tracked_only: bool,

    /// Mask the whole view
    #[arg(long)]
    block_all: bool,

    /// Sensor rotation in degrees
    #[arg(long, allow_hyphen_values = true)]
    rotation: Option<i32>,

    /// View size, e.g. 1080x1920
    #[arg(long)]
    view: Option<Resolution>,

    /// Landscape display
    #[arg(long)]
    landscape: bool,
}

impl PipelineArgs {
    fn resolve(&self) -> Result<PipelineConfig> {
        let mut cfg = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(model) = &self.model {
            cfg.detector.model = model.clone();
        }
        if let Some(threshold) = self.threshold {
            cfg.tracking.score_threshold = threshold;
        }
        if self.no_privacy {
            cfg.overlay.privacy_enabled = false;
        }
        if self.tracked_only {
            cfg.overlay.reveal = RevealPolicy::Tracked;
        }
        if self.block_all {
            cfg.overlay.block_all = true;
        }
        if let Some(rotation) = self.rotation {
            cfg.source.rotation = normalize_rotation(rotation)?;
        }
        if let Some(view) = self.view {
            cfg.overlay.view.width = view.width;
            cfg.overlay.view.height = view.height;
        }
        if self.landscape {
            cfg.source.landscape = true;
            cfg.overlay.view.orientation = Orientation::Landscape;
        }
        cfg.validate().context("invalid settings")?;
        Ok(cfg)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "video-file")]
        Commands::Run {
            input,
            output,
            tap,
            every,
            max_frames,
            pipeline,
        } => run::cmd_run(input, output, tap, every, max_frames, pipeline.resolve()?),
        Commands::Detect {
            input,
            output,
            overlay,
            pipeline,
        } => cmd_detect(input, output, overlay, pipeline.resolve()?),
        Commands::Segment {
            input,
            output,
            config,
            model,
            every,
            max_frames,
        } => {
            let mut cfg = match &config {
                Some(path) => PipelineConfig::load(path)?,
                None => PipelineConfig::default(),
            };
            if let Some(model) = model {
                cfg.segmentation.model = model;
            }
            cmd_segment(input, output, every, max_frames, &cfg)
        }
        Commands::Resolution { candidates, target } => cmd_resolution(candidates, target),
    }
}

fn load_pipeline(config: &PipelineConfig, session: Session) -> Result<Pipeline> {
    configure_ort_dylib();
    let loaded = Pipeline::load(config, session);
    info!(loaded = loaded.is_ok(), "detector status");
    loaded.inspect_err(|e| error!("{e:#}"))
}

// ── Single image ──────────────────────────────────────────────────────────────

fn cmd_detect(
    input: PathBuf,
    output: PathBuf,
    overlay: Option<PathBuf>,
    config: PipelineConfig,
) -> Result<()> {
    info!("Single-image detection");
    info!("  input  : {}", input.display());
    info!("  output : {}", output.display());

    let img = image::open(&input)
        .with_context(|| format!("failed to open image: {}", input.display()))?
        .to_rgb8();
    let (width, height) = img.dimensions();
    let frame = SourceFrame::new(
        img.as_raw().clone(),
        width,
        height,
        config.source.rotation,
        0,
    );

    let (mut processor, mut renderer, _handle) =
        load_pipeline(&config, Session::new())?.into_parts();
    let outcome = processor.process(&frame);

    let view = ViewGeometry {
        width,
        height,
        orientation: config.overlay.view.orientation,
    };
    renderer.draw(&view);
    let snapshot = renderer.last_snapshot();
    let Some(transform) = processor.transform() else {
        bail!("frame was not mapped onto the canvas ({outcome:?})");
    };

    let threshold = config.tracking.score_threshold;
    let rects: Vec<(f32, f32, f32, f32)> = snapshot
        .boxes
        .iter()
        .filter(|b| b.score >= threshold)
        .filter_map(|b| {
            info!(label = b.label, score = b.score, "detected");
            transform.bbox_to_source(b)
        })
        .collect();

    let mut boxed = img.clone();
    draw_boxes(&mut boxed, &rects, [0, 255, 0]);
    boxed
        .save(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(?outcome, boxes = rects.len(), "wrote {}", output.display());

    if let Some(path) = overlay {
        let mut composited = preview::background(&frame, &view).unwrap_or(img);
        renderer.composite(&mut composited, &view);
        composited
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("wrote overlay {}", path.display());
    }
    Ok(())
}

// ── Background removal ────────────────────────────────────────────────────────

fn load_masker(config: &PipelineConfig) -> Result<SegmentationMasker> {
    configure_ort_dylib();
    let seg = &config.segmentation;
    let segmenter = DeepLabSegmenter::load(&seg.model, seg.tensors.clone())
        .inspect_err(|e| error!("{e:#}"))?;
    info!(model = %seg.model.display(), "segmentation model loaded");
    SegmentationMasker::new(Box::new(segmenter), seg.params)
}

fn cmd_segment(
    input: PathBuf,
    output: PathBuf,
    every: u64,
    max_frames: Option<u64>,
    config: &PipelineConfig,
) -> Result<()> {
    info!("Background removal");
    info!("  input  : {}", input.display());
    info!("  output : {}", output.display());

    let mut masker = load_masker(config)?;

    if image::ImageFormat::from_path(&input).is_ok() {
        let img = image::open(&input)
            .with_context(|| format!("failed to open image: {}", input.display()))?
            .to_rgb8();
        let (width, height) = img.dimensions();
        let frame = SourceFrame::new(img.into_raw(), width, height, 0, 0);
        let out = masker.apply(&frame)?;
        let path = if output.extension().is_some() {
            output
        } else {
            output.with_extension("png")
        };
        out.save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(width = out.width(), height = out.height(), "wrote {}", path.display());
        return Ok(());
    }

    segment_clip(&mut masker, &input, &output, every, max_frames)
}

#[cfg(feature = "video-file")]
fn segment_clip(
    masker: &mut SegmentationMasker,
    input: &std::path::Path,
    output: &std::path::Path,
    every: u64,
    max_frames: Option<u64>,
) -> Result<()> {
    std::fs::create_dir_all(output)
        .with_context(|| format!("failed to create {}", output.display()))?;

    let pb = run::spinner("Removing background…");
    let mut seen = 0u64;
    let mut written = 0u64;
    let mut failure = None;
    privacy_core::video::replay(input, 0, |frame| {
        if max_frames.is_some_and(|max| seen >= max) {
            return false;
        }
        let index = seen;
        seen += 1;
        pb.tick();
        if index % every.max(1) != 0 {
            return true;
        }
        let path = output.join(format!("frame_{index:06}.png"));
        let saved = masker.apply(&frame).and_then(|img| {
            img.save(&path)
                .with_context(|| format!("failed to write {}", path.display()))
        });
        match saved {
            Ok(()) => {
                written += 1;
                true
            }
            Err(e) => {
                failure = Some(e);
                false
            }
        }
    })?;
    pb.finish_with_message("Done.");

    if let Some(e) = failure {
        return Err(e);
    }
    info!(frames = seen, written, "background removal finished");
    Ok(())
}

#[cfg(not(feature = "video-file"))]
fn segment_clip(
    _masker: &mut SegmentationMasker,
    input: &std::path::Path,
    _output: &std::path::Path,
    _every: u64,
    _max_frames: Option<u64>,
) -> Result<()> {
    bail!(
        "{} is not an image; build with the video-file feature to segment clips",
        input.display()
    )
}

// ── Resolution negotiation ────────────────────────────────────────────────────

fn cmd_resolution(candidates: Vec<Resolution>, target: Resolution) -> Result<()> {
    match select_preview_resolution(candidates.iter().copied(), target) {
        Some(picked) => {
            println!("{picked}");
            Ok(())
        }
        None => bail!("no candidate is at least {target}"),
    }
}

// ── Live replay ───────────────────────────────────────────────────────────────

#[cfg(feature = "video-file")]
mod run {
    use super::*;
    use crossbeam_channel::TrySendError;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::thread;
    use tracing::warn;

    use privacy_core::video::replay;

    pub fn cmd_run(
        input: PathBuf,
        output: PathBuf,
        tap: Option<String>,
        every: u64,
        max_frames: Option<u64>,
        config: PipelineConfig,
    ) -> Result<()> {
        info!("Privacy preview");
        info!("  input  : {}", input.display());
        info!("  output : {}", output.display());

        std::fs::create_dir_all(&output)
            .with_context(|| format!("failed to create {}", output.display()))?;

        let view = config.overlay.view;
        let rotation = config.source.rotation;
        let session = Session::new();
        let (mut processor, mut renderer, handle) =
            load_pipeline(&config, session.clone())?.into_parts();

        if let Some(tap) = tap {
            let (x, y) = parse_point(&tap)?;
            handle.seed_at_screen(x, y, &view);
            info!(x, y, "tap queued");
        }

        let (feeder, inbox) = processor.feed();
        let gate = feeder.gate().clone();
        let (preview_tx, preview_rx) = crossbeam_channel::bounded::<SourceFrame>(1);

        let worker = thread::Builder::new()
            .name("pipeline".into())
            .spawn(move || processor.run(&inbox))
            .context("failed to spawn pipeline thread")?;

        let source_session = session.clone();
        let source = thread::Builder::new()
            .name("source".into())
            .spawn(move || -> Result<u64> {
                let mut seen = 0u64;
                replay(&input, rotation, |frame| {
                    if max_frames.is_some_and(|max| seen >= max) {
                        source_session.stop();
                        return false;
                    }
                    seen += 1;
                    if preview_tx.is_empty() {
                        match preview_tx.try_send(frame.clone()) {
                            Ok(()) | Err(TrySendError::Full(_)) => {}
                            Err(TrySendError::Disconnected(_)) => return false,
                        }
                    }
                    match feeder.offer(frame) {
                        Ok(_) => source_session.is_active(),
                        Err(e) => {
                            warn!("{e:#}");
                            false
                        }
                    }
                })
            })
            .context("failed to spawn source thread")?;

        let pb = spinner("Compositing preview…");
        let mut written = 0u64;
        for (i, frame) in preview_rx.iter().enumerate() {
            pb.tick();
            let Some(mut img) = preview::background(&frame, &view) else {
                continue;
            };
            renderer.composite(&mut img, &view);
            if i as u64 % every.max(1) == 0 {
                let path = output.join(format!("frame_{i:06}.png"));
                img.save(&path)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                written += 1;
            }
        }

        let delivered = source
            .join()
            .map_err(|_| anyhow::anyhow!("source thread panicked"))??;
        session.stop();
        let processed = worker
            .join()
            .map_err(|_| anyhow::anyhow!("pipeline thread panicked"))?;

        pb.finish_with_message("Done.");
        info!(
            delivered,
            processed,
            dropped = gate.dropped(),
            written,
            "preview finished"
        );
        Ok(())
    }

    fn parse_point(s: &str) -> Result<(f32, f32)> {
        let Some((x, y)) = s.split_once(',') else {
            bail!("expected X,Y, got {s:?}");
        };
        Ok((x.trim().parse()?, y.trim().parse()?))
    }

    pub(super) fn spinner(msg: &str) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
        {
            pb.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(80));
        pb
    }
}
