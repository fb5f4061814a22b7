//! pipeline — the two per-frame contexts and what connects them
//!
//! `FrameProcessor` runs once per admitted source frame on the pipeline
//! thread: canvas build → detection → tracking → publish.  `OverlayRenderer`
//! runs once per display refresh on the render thread and turns the latest
//! published boxes into an overlay.  The box buffer is the only state they
//! share.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::detection::{DetectOutcome, DetectionSet, ObjectDetector, SsdDetector};
use crate::geometry::{
    screen_to_normalized, GeometryKey, GeometryMapper, GeometryTransform, ViewGeometry,
};
use crate::handoff::{self, BoxPublisher, BoxReader, BoxSnapshot};
use crate::rendering::{rasterize, render, DrawCommand, OverlayParams};
use crate::runtime::{FrameGate, FrameTicket, Session};
use crate::tracking::{RegionTracker, TemplateTracker, TrackState, VisualTracker};
use crate::video::SourceFrame;

const PROFILE_EVERY: u64 = 300;

// ── Tracker control ──────────────────────────────────────────────────────────

/// Requests from the host to the pipeline thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackerCommand {
    /// Lock onto the box nearest this normalized canvas point.
    Seed { x: f32, y: f32 },
    Reset,
}

/// Host-side handle for steering the tracker.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    tx: Sender<TrackerCommand>,
}

impl TrackerHandle {
    /// Seed from a normalized canvas point.  `false` if the pipeline is gone.
    pub fn seed(&self, x: f32, y: f32) -> bool {
        self.send(TrackerCommand::Seed { x, y })
    }

    /// Seed from a tap on the view.
    pub fn seed_at_screen(&self, x: f32, y: f32, view: &ViewGeometry) -> bool {
        let (nx, ny) = screen_to_normalized(x, y, view);
        self.seed(nx, ny)
    }

    pub fn reset(&self) -> bool {
        self.send(TrackerCommand::Reset)
    }

    fn send(&self, cmd: TrackerCommand) -> bool {
        match self.tx.send(cmd) {
            Ok(()) => true,
            Err(_) => {
                debug!(?cmd, "pipeline has shut down, tracker command dropped");
                false
            }
        }
    }
}

// ── Frame admission ──────────────────────────────────────────────────────────

/// A frame travelling to the pipeline thread together with its gate ticket.
/// The gate reopens when this is dropped.
pub struct InFlight {
    pub frame: SourceFrame,
    _ticket: FrameTicket,
}

/// Source-side end of the frame feed.
pub struct FrameFeeder {
    gate: FrameGate,
    tx: Sender<InFlight>,
}

impl FrameFeeder {
    /// Hand `frame` to the pipeline if nothing is in flight.  Returns
    /// `Ok(false)` when the frame was dropped.
    pub fn offer(&self, frame: SourceFrame) -> Result<bool> {
        let Some(ticket) = self.gate.try_acquire() else {
            return Ok(false);
        };
        self.tx
            .send(InFlight {
                frame,
                _ticket: ticket,
            })
            .map_err(|_| anyhow!("pipeline thread has exited"))?;
        Ok(true)
    }

    pub fn gate(&self) -> &FrameGate {
        &self.gate
    }
}

// ── Pipeline context ─────────────────────────────────────────────────────────

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Detection ran and results were published.
    Detected,
    /// Nothing usable this frame; "no results" was published.
    Skipped,
    /// The session has stopped; the frame was ignored.
    Inactive,
}

pub struct FrameProcessor {
    session: Session,
    mapper: GeometryMapper,
    canvas: RgbImage,
    detector: Box<dyn ObjectDetector>,
    detections: DetectionSet,
    tracker: RegionTracker,
    publisher: BoxPublisher,
    commands: Receiver<TrackerCommand>,
    gate: Option<FrameGate>,
    score_threshold: f32,
    landscape_display: bool,
    prof_frames: u64,
    prof_skipped: u64,
    prof_canvas: Duration,
    prof_detect: Duration,
    prof_track: Duration,
}

impl FrameProcessor {
    /// Run one frame through canvas build, detection and tracking, then
    /// publish the result.
    pub fn process(&mut self, frame: &SourceFrame) -> FrameOutcome {
        if !self.session.is_active() {
            return FrameOutcome::Inactive;
        }
        self.apply_commands();

        let outcome = self.process_inner(frame);
        if outcome == FrameOutcome::Skipped {
            self.prof_skipped += 1;
        }

        self.prof_frames += 1;
        if self.prof_frames % PROFILE_EVERY == 0 {
            let per_frame =
                |d: Duration| format!("{:.2}", d.as_secs_f64() * 1000.0 / self.prof_frames as f64);
            info!(
                frames = self.prof_frames,
                skipped = self.prof_skipped,
                dropped = self.gate.as_ref().map_or(0, FrameGate::dropped),
                canvas_ms_per_frame = per_frame(self.prof_canvas),
                detect_ms_per_frame = per_frame(self.prof_detect),
                track_ms_per_frame = per_frame(self.prof_track),
                "pipeline timings"
            );
        }
        outcome
    }

    fn process_inner(&mut self, frame: &SourceFrame) -> FrameOutcome {
        if frame.is_degenerate() {
            debug!(width = frame.width, height = frame.height, "degenerate source frame");
            self.publisher.publish(None);
            return FrameOutcome::Skipped;
        }

        let canvas_start = Instant::now();
        let (canvas_width, canvas_height) = self.detector.input_size();
        let key = GeometryKey {
            source_width: frame.width,
            source_height: frame.height,
            canvas_width,
            canvas_height,
            rotation: frame.rotation,
            landscape_display: self.landscape_display,
        };
        let built = self.mapper.prepare(key).and_then(|(_, reallocate)| {
            if reallocate {
                self.canvas = RgbImage::new(canvas_width, canvas_height);
            }
            self.mapper.render_canvas(frame, &mut self.canvas)
        });
        self.prof_canvas += canvas_start.elapsed();
        if let Err(e) = built {
            warn!("canvas build error: {e:#}");
            self.publisher.publish(None);
            return FrameOutcome::Skipped;
        }

        let detect_start = Instant::now();
        let ready = match self.detector.detect(&self.canvas, &mut self.detections) {
            Ok(DetectOutcome::Ready) => {
                for b in self.detections.boxes_mut() {
                    b.sanitize();
                }
                true
            }
            Ok(DetectOutcome::Skipped) => false,
            Err(e) => {
                warn!("detection error: {e:#}");
                false
            }
        };
        self.prof_detect += detect_start.elapsed();

        let track_start = Instant::now();
        let boxes = ready.then_some(&mut self.detections);
        let tracked = self
            .tracker
            .process(&self.canvas, boxes, self.score_threshold);
        self.publisher.publish(tracked.map(|set| &*set));
        self.prof_track += track_start.elapsed();

        if ready {
            FrameOutcome::Detected
        } else {
            FrameOutcome::Skipped
        }
    }

    fn apply_commands(&mut self) {
        let (cw, ch) = self.detector.input_size();
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                TrackerCommand::Seed { x, y } => {
                    self.tracker.request_seed(x * cw as f32, y * ch as f32)
                }
                TrackerCommand::Reset => {
                    info!("tracker reset");
                    self.tracker.reset();
                }
            }
        }
    }

    /// Create the gated frame feed for this processor.  Frames offered while
    /// one is still being processed are dropped.
    pub fn feed(&mut self) -> (FrameFeeder, Receiver<InFlight>) {
        let gate = FrameGate::new();
        self.gate = Some(gate.clone());
        let (tx, rx) = crossbeam_channel::bounded(0);
        (FrameFeeder { gate, tx }, rx)
    }

    /// Process frames from `inbox` until the feed closes or the session
    /// stops.  Returns the number of frames processed.
    pub fn run(&mut self, inbox: &Receiver<InFlight>) -> u64 {
        let mut processed = 0u64;
        for item in inbox.iter() {
            if self.process(&item.frame) == FrameOutcome::Inactive {
                break;
            }
            processed += 1;
        }
        info!(processed, "pipeline loop finished");
        processed
    }

    pub fn canvas(&self) -> &RgbImage {
        &self.canvas
    }

    /// The source → canvas transform of the last built frame.
    pub fn transform(&self) -> Option<&GeometryTransform> {
        self.mapper.current()
    }

    pub fn track_state(&self) -> TrackState {
        self.tracker.state()
    }

    pub fn tracker(&self) -> &RegionTracker {
        &self.tracker
    }
}

// ── Render context ───────────────────────────────────────────────────────────

pub struct OverlayRenderer {
    reader: BoxReader,
    params: OverlayParams,
    snapshot: BoxSnapshot,
    prof_frames: u64,
    prof_render: Duration,
}

impl OverlayRenderer {
    pub fn new(reader: BoxReader, params: OverlayParams) -> Self {
        Self {
            reader,
            params,
            snapshot: BoxSnapshot::default(),
            prof_frames: 0,
            prof_render: Duration::ZERO,
        }
    }

    pub fn params(&self) -> &OverlayParams {
        &self.params
    }

    /// Live switches (privacy toggle, threshold) from the host.
    pub fn params_mut(&mut self) -> &mut OverlayParams {
        &mut self.params
    }

    /// Draw commands for the newest published frame.
    pub fn draw(&mut self, view: &ViewGeometry) -> Vec<DrawCommand> {
        let render_start = Instant::now();
        self.reader.snapshot_into(&mut self.snapshot);
        let commands = render(&self.snapshot, view, &self.params);
        self.prof_render += render_start.elapsed();

        self.prof_frames += 1;
        if self.prof_frames % PROFILE_EVERY == 0 {
            info!(
                frames = self.prof_frames,
                sequence = self.snapshot.sequence,
                render_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_render.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                "overlay timings"
            );
        }
        commands
    }

    /// Draw the overlay straight onto `img`, treating it as the view.
    pub fn composite(&mut self, img: &mut RgbImage, view: &ViewGeometry) {
        let commands = self.draw(view);
        rasterize(&commands, img);
    }

    /// The snapshot used by the last `draw`.
    pub fn last_snapshot(&self) -> &BoxSnapshot {
        &self.snapshot
    }
}

// ── Assembly ─────────────────────────────────────────────────────────────────

pub struct Pipeline {
    processor: FrameProcessor,
    renderer: OverlayRenderer,
    handle: TrackerHandle,
}

impl Pipeline {
    /// Load the SSD model named by `config` and build both contexts.
    pub fn load(config: &PipelineConfig, session: Session) -> Result<Self> {
        let det = &config.detector;
        let detector = SsdDetector::load(
            &det.model,
            det.input_width,
            det.input_height,
            det.tensors.clone(),
        )
        .with_context(|| format!("failed to load detector {}", det.model.display()))?;
        info!(model = %det.model.display(), "detector loaded");
        Self::with_detector(config, session, Box::new(detector))
    }

    /// Build both contexts around an already constructed detector.
    pub fn with_detector(
        config: &PipelineConfig,
        session: Session,
        detector: Box<dyn ObjectDetector>,
    ) -> Result<Self> {
        config.validate()?;
        let (cw, ch) = detector.input_size();
        if cw == 0 || ch == 0 {
            return Err(anyhow!("detector reports a zero input size"));
        }
        // The configured capacity can only lower what the detector emits.
        let capacity = detector.capacity().min(config.detector.capacity).max(1);

        let template = config.tracking.template;
        let factory = move || -> Box<dyn VisualTracker> { Box::new(TemplateTracker::new(template)) };

        let (publisher, reader) = handoff::channel(capacity);
        let (tx, commands) = crossbeam_channel::unbounded();

        let processor = FrameProcessor {
            session,
            mapper: GeometryMapper::new(),
            canvas: RgbImage::new(cw, ch),
            detector,
            detections: DetectionSet::with_capacity(capacity),
            tracker: RegionTracker::new(Box::new(factory)),
            publisher,
            commands,
            gate: None,
            score_threshold: config.tracking.score_threshold,
            landscape_display: config.source.landscape,
            prof_frames: 0,
            prof_skipped: 0,
            prof_canvas: Duration::ZERO,
            prof_detect: Duration::ZERO,
            prof_track: Duration::ZERO,
        };
        let renderer = OverlayRenderer::new(reader, config.overlay_params());

        Ok(Self {
            processor,
            renderer,
            handle: TrackerHandle { tx },
        })
    }

    pub fn into_parts(self) -> (FrameProcessor, OverlayRenderer, TrackerHandle) {
        (self.processor, self.renderer, self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;

    /// Returns the same boxes every frame.
    struct FixedDetector {
        boxes: Vec<BBox>,
        fail: bool,
    }

    impl ObjectDetector for FixedDetector {
        fn input_size(&self) -> (u32, u32) {
            (64, 64)
        }

        fn capacity(&self) -> usize {
            8
        }

        fn detect(&mut self, _canvas: &RgbImage, out: &mut DetectionSet) -> Result<DetectOutcome> {
            if self.fail {
                return Err(anyhow!("backend fell over"));
            }
            let n = self.boxes.len().min(out.capacity());
            out.slots_mut()[..n].copy_from_slice(&self.boxes[..n]);
            out.set_len(n);
            Ok(DetectOutcome::Ready)
        }
    }

    fn person() -> BBox {
        BBox {
            top: 0.25,
            left: 0.25,
            bottom: 0.75,
            right: 0.75,
            score: 0.9,
            label: "person",
            ..BBox::default()
        }
    }

    fn pipeline(fail: bool) -> (FrameProcessor, OverlayRenderer, TrackerHandle, Session) {
        pipeline_with(vec![person()], fail, &PipelineConfig::default())
    }

    fn pipeline_with(
        boxes: Vec<BBox>,
        fail: bool,
        config: &PipelineConfig,
    ) -> (FrameProcessor, OverlayRenderer, TrackerHandle, Session) {
        let session = Session::new();
        let detector = FixedDetector { boxes, fail };
        let p = Pipeline::with_detector(config, session.clone(), Box::new(detector)).unwrap();
        let (proc_, renderer, handle) = p.into_parts();
        (proc_, renderer, handle, session)
    }

    fn square_view() -> ViewGeometry {
        ViewGeometry {
            width: 100,
            height: 100,
            orientation: Default::default(),
        }
    }

    fn grey_frame() -> SourceFrame {
        SourceFrame::new(vec![120u8; 128 * 96 * 3], 128, 96, 0, 0)
    }

    #[test]
    fn publishes_detections_for_the_renderer() {
        let (mut proc_, mut renderer, _, _) = pipeline(false);
        assert_eq!(proc_.process(&grey_frame()), FrameOutcome::Detected);
        let view = ViewGeometry {
            width: 100,
            height: 100,
            orientation: Default::default(),
        };
        let cmds = renderer.draw(&view);
        assert!(renderer.last_snapshot().has_results);
        assert_eq!(renderer.last_snapshot().boxes.len(), 1);
        // Background with one hole, then its outline.
        assert_eq!(cmds.len(), 2);
    }

    #[test]
    fn detector_errors_publish_no_results() {
        let (mut proc_, renderer, _, _) = pipeline(true);
        assert_eq!(proc_.process(&grey_frame()), FrameOutcome::Skipped);
        let mut r = renderer;
        let view = ViewGeometry {
            width: 10,
            height: 10,
            orientation: Default::default(),
        };
        r.draw(&view);
        assert!(!r.last_snapshot().has_results);
        assert_eq!(r.last_snapshot().sequence, 1);
    }

    #[test]
    fn degenerate_frames_are_skipped() {
        let (mut proc_, _, _, _) = pipeline(false);
        let empty = SourceFrame::new(Vec::new(), 0, 0, 0, 0);
        assert_eq!(proc_.process(&empty), FrameOutcome::Skipped);
        let short = SourceFrame::new(vec![0u8; 10], 128, 96, 0, 0);
        assert_eq!(proc_.process(&short), FrameOutcome::Skipped);
    }

    #[test]
    fn stopped_session_ignores_frames() {
        let (mut proc_, _, _, session) = pipeline(false);
        session.stop();
        assert_eq!(proc_.process(&grey_frame()), FrameOutcome::Inactive);
    }

    #[test]
    fn seed_command_reaches_the_tracker() {
        let (mut proc_, _, handle, _) = pipeline(false);
        assert!(handle.seed(0.5, 0.5));
        proc_.process(&grey_frame());
        assert_eq!(proc_.track_state(), TrackState::Tracking);
        assert!(proc_.tracker().reseed_count() >= 1);
        assert!(handle.reset());
        proc_.process(&grey_frame());
        assert_eq!(proc_.track_state(), TrackState::Unseeded);
    }

    #[test]
    fn out_of_range_boxes_are_clamped_while_tracking() {
        let wild = BBox {
            top: f32::NAN,
            left: f32::NEG_INFINITY,
            bottom: 0.9,
            right: f32::INFINITY,
            score: 0.8,
            label: "person",
            ..BBox::default()
        };
        let (mut proc_, mut renderer, handle, _) =
            pipeline_with(vec![person(), wild], false, &PipelineConfig::default());

        assert!(handle.seed(0.5, 0.5));
        for _ in 0..3 {
            assert_eq!(proc_.process(&grey_frame()), FrameOutcome::Detected);
        }
        assert!(proc_.tracker().reseed_count() >= 1);

        let mut img = RgbImage::new(100, 100);
        renderer.composite(&mut img, &square_view());
        let clamped = renderer.last_snapshot().boxes[1];
        assert_eq!((clamped.top, clamped.bottom), (0.0, 0.9));
        assert_eq!((clamped.left, clamped.right), (0.0, 1.0));
    }

    #[test]
    fn configured_capacity_caps_published_boxes() {
        let mut config = PipelineConfig::default();
        config.detector.capacity = 1;
        let (mut proc_, mut renderer, _, _) =
            pipeline_with(vec![person(), person(), person()], false, &config);

        proc_.process(&grey_frame());
        renderer.draw(&square_view());
        assert_eq!(renderer.last_snapshot().boxes.len(), 1);
    }

    #[test]
    fn canvas_matches_detector_input() {
        let (mut proc_, _, _, _) = pipeline(false);
        proc_.process(&grey_frame());
        assert_eq!(proc_.canvas().dimensions(), (64, 64));
        // 128x96 into 64x64: letterbox bands top and bottom.
        assert_eq!(proc_.canvas().get_pixel(32, 2).0, [0, 0, 0]);
        assert_eq!(proc_.canvas().get_pixel(32, 32).0, [120, 120, 120]);
    }
}
