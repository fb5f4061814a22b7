//! runtime — session liveness, frame admission, ONNX Runtime discovery

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

// ── Session ──────────────────────────────────────────────────────────────────

/// Shared "is the preview still running" flag.  Cloned into every context;
/// the pipeline checks it once per frame and bails out early after `stop`.
#[derive(Debug, Clone)]
pub struct Session {
    active: Arc<AtomicBool>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            tracing::info!("session stopped");
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ── Frame gate ───────────────────────────────────────────────────────────────

/// Admits at most one frame into the pipeline at a time.  A frame that
/// arrives while another is in flight is dropped (and counted), never queued.
#[derive(Debug, Clone, Default)]
pub struct FrameGate {
    inner: Arc<GateInner>,
}

#[derive(Debug, Default)]
struct GateInner {
    busy: AtomicBool,
    admitted: AtomicU64,
    dropped: AtomicU64,
}

/// Proof that a frame is in flight.  Dropping it reopens the gate.
#[derive(Debug)]
pub struct FrameTicket {
    inner: Arc<GateInner>,
}

impl FrameGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<FrameTicket> {
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.inner.admitted.fetch_add(1, Ordering::Relaxed);
            Some(FrameTicket {
                inner: Arc::clone(&self.inner),
            })
        } else {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn admitted(&self) -> u64 {
        self.inner.admitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for FrameTicket {
    fn drop(&mut self) {
        self.inner.busy.store(false, Ordering::Release);
    }
}

// ── ONNX Runtime ─────────────────────────────────────────────────────────────

#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(target_os = "windows")]
const ORT_LIB_NAME: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";

/// Resolve and set ORT_DYLIB_PATH when it is missing or invalid.  Must run
/// before the first detector is loaded.
///
/// Priority order:
/// 1) Existing ORT_DYLIB_PATH (if the file exists)
/// 2) models/onnxruntime*/lib/<lib> near the current exe/cwd
/// 3) the platform's usual system location
pub fn configure_ort_dylib() {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using ORT_DYLIB_PATH from environment");
            return;
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    match ort_candidates().into_iter().find(|c| c.is_file()) {
        Some(candidate) => {
            // SAFETY: called from the host's start-up path before any
            // session or worker thread exists.
            unsafe {
                std::env::set_var("ORT_DYLIB_PATH", &candidate);
            }
            tracing::info!(path = %candidate.display(), "configured ORT_DYLIB_PATH");
        }
        None => tracing::warn!(
            lib = ORT_LIB_NAME,
            "could not locate ONNX Runtime; set ORT_DYLIB_PATH to its shared library"
        ),
    }
}

fn ort_candidates() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..5 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }

    let mut candidates = Vec::new();
    for root in roots {
        candidates.push(root.join("models/onnxruntime/lib").join(ORT_LIB_NAME));
        candidates.push(root.join("models").join(ORT_LIB_NAME));
        candidates.push(root.join(ORT_LIB_NAME));
    }

    #[cfg(target_os = "macos")]
    candidates.push(PathBuf::from("/opt/homebrew/lib").join(ORT_LIB_NAME));
    #[cfg(target_os = "linux")]
    candidates.push(PathBuf::from("/usr/local/lib").join(ORT_LIB_NAME));
    candidates
}
