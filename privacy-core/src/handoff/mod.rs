//! handoff — latest-results buffer between the processing and render threads
//!
//! One writer, one reader, last-writer-wins.  The processing thread publishes
//! each frame's boxes; the render thread snapshots whatever is newest when it
//! draws.  Neither side ever observes a half-written frame: both copy under
//! the same mutex, and the critical sections do nothing but copy.
//!
//! A skipped frame publishes `None`: the sentinel "no results" state, with
//! the retained boxes kept but their scores zeroed so stale data can never
//! reveal anything.
//!
//! A poisoned lock is handled asymmetrically.  The writer recovers the guard
//! and keeps publishing.  The reader reports "no results", which the overlay
//! renders as a fully occluding view.

use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::detection::{BBox, DetectionSet};

struct Shared {
    boxes: Vec<BBox>,
    /// Number of boxes from the latest `Some` publish.
    len: usize,
    has_results: bool,
    sequence: u64,
}

/// Processing-thread handle.  Not `Clone`: there is exactly one writer.
pub struct BoxPublisher {
    shared: Arc<Mutex<Shared>>,
}

/// Render-thread handle.  Not `Clone`: there is exactly one reader.
pub struct BoxReader {
    shared: Arc<Mutex<Shared>>,
}

/// Create a connected publisher/reader pair with room for `capacity` boxes.
pub fn channel(capacity: usize) -> (BoxPublisher, BoxReader) {
    let shared = Arc::new(Mutex::new(Shared {
        boxes: vec![BBox::default(); capacity],
        len: 0,
        has_results: false,
        sequence: 0,
    }));
    (
        BoxPublisher {
            shared: Arc::clone(&shared),
        },
        BoxReader { shared },
    )
}

impl BoxPublisher {
    /// Publish this frame's boxes.
    ///
    /// `None` means inference was skipped: the buffer switches to "no
    /// results" and the retained boxes keep their geometry and count but have
    /// their scores zeroed.
    pub fn publish(&self, boxes: Option<&DetectionSet>) {
        let mut guard = match self.shared.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("box buffer lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let shared = &mut *guard;
        match boxes {
            Some(set) => {
                let src = set.boxes();
                if shared.boxes.len() < src.len() {
                    shared.boxes.resize(src.len(), BBox::default());
                }
                shared.boxes[..src.len()].copy_from_slice(src);
                shared.len = src.len();
                shared.has_results = true;
            }
            None => {
                shared.has_results = false;
                let len = shared.len;
                for b in &mut shared.boxes[..len] {
                    b.score = 0.0;
                    b.is_tracked = false;
                }
            }
        }
        shared.sequence += 1;
    }
}

/// A consistent copy of the latest published frame.
#[derive(Debug, Clone, Default)]
pub struct BoxSnapshot {
    pub has_results: bool,
    pub boxes: Vec<BBox>,
    /// Publish count at the time of the copy; 0 before the first publish.
    pub sequence: u64,
}

impl BoxReader {
    pub fn snapshot(&self) -> BoxSnapshot {
        let mut snap = BoxSnapshot::default();
        self.snapshot_into(&mut snap);
        snap
    }

    /// Copy the latest boxes into `out`, reusing its allocation.
    pub fn snapshot_into(&self, out: &mut BoxSnapshot) {
        out.boxes.clear();
        out.has_results = false;
        match self.shared.lock() {
            Ok(guard) => {
                out.boxes.extend_from_slice(&guard.boxes[..guard.len]);
                out.has_results = guard.has_results;
                out.sequence = guard.sequence;
            }
            Err(_) => {
                warn!("box buffer lock poisoned, reporting no results");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn scored(score: f32, tracked: bool) -> BBox {
        BBox {
            top: 0.1,
            left: 0.1,
            bottom: 0.4,
            right: 0.4,
            score,
            label: "person",
            is_tracked: tracked,
            ..BBox::default()
        }
    }

    #[test]
    fn empty_before_first_publish() {
        let (_tx, rx) = channel(10);
        let snap = rx.snapshot();
        assert!(!snap.has_results);
        assert_eq!(snap.sequence, 0);
    }

    #[test]
    fn reader_sees_latest_publish() {
        let (tx, rx) = channel(10);
        tx.publish(Some(&DetectionSet::from_boxes(&[scored(0.9, false)])));
        tx.publish(Some(&DetectionSet::from_boxes(&[
            scored(0.5, true),
            scored(0.7, false),
        ])));
        let snap = rx.snapshot();
        assert_eq!(snap.sequence, 2);
        assert_eq!(snap.boxes.len(), 2);
        assert_eq!(snap.boxes[0].score, 0.5);
        assert!(snap.boxes[0].is_tracked);
    }

    #[test]
    fn skipped_frame_is_no_results_with_zeroed_scores() {
        let (tx, rx) = channel(10);
        tx.publish(Some(&DetectionSet::from_boxes(&[
            scored(0.9, true),
            scored(0.6, false),
        ])));
        tx.publish(None);

        let snap = rx.snapshot();
        assert!(!snap.has_results);
        assert_eq!(snap.boxes.len(), 2);
        assert!(snap.boxes.iter().all(|b| b.score == 0.0 && !b.is_tracked));
        assert_eq!(snap.boxes[0].top, 0.1);
        assert_eq!(snap.sequence, 2);
    }

    #[test]
    fn empty_set_still_counts_as_results() {
        let (tx, rx) = channel(10);
        tx.publish(None);
        tx.publish(Some(&DetectionSet::with_capacity(10)));
        let snap = rx.snapshot();
        assert!(snap.has_results);
        assert!(snap.boxes.is_empty());
    }

    #[test]
    fn snapshots_are_independent_copies() {
        let (tx, rx) = channel(4);
        let mut set = DetectionSet::from_boxes(&[scored(0.9, true)]);
        tx.publish(Some(&set));

        // Neither the producer's set nor an earlier snapshot aliases the buffer.
        set.boxes_mut()[0].score = 0.1;
        let mut first = rx.snapshot();
        first.boxes[0].score = 0.0;
        first.boxes[0].is_tracked = false;
        first.boxes.clear();

        let second = rx.snapshot();
        assert_eq!(second.boxes.len(), 1);
        assert_eq!(second.boxes[0].score, 0.9);
        assert!(second.boxes[0].is_tracked);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let (tx, rx) = channel(1);
        tx.publish(Some(&DetectionSet::from_boxes(&[scored(0.5, false); 4])));
        assert_eq!(rx.snapshot().boxes.len(), 4);
    }

    #[test]
    fn snapshot_into_reuses_buffer() {
        let (tx, rx) = channel(4);
        tx.publish(Some(&DetectionSet::from_boxes(&[scored(0.9, false); 3])));
        let mut snap = BoxSnapshot::default();
        rx.snapshot_into(&mut snap);
        assert_eq!(snap.boxes.len(), 3);
        tx.publish(Some(&DetectionSet::from_boxes(&[scored(0.2, false)])));
        rx.snapshot_into(&mut snap);
        assert_eq!(snap.boxes.len(), 1);
        assert_eq!(snap.boxes[0].score, 0.2);
    }

    #[test]
    fn poisoned_lock_reads_as_no_results() {
        let (tx, rx) = channel(4);
        tx.publish(Some(&DetectionSet::from_boxes(&[scored(0.9, false)])));

        let shared = Arc::clone(&tx.shared);
        let _ = thread::spawn(move || {
            let _guard = shared.lock().unwrap();
            panic!("poison the box buffer");
        })
        .join();

        assert!(!rx.snapshot().has_results);
        // The writer keeps going.
        tx.publish(Some(&DetectionSet::from_boxes(&[scored(0.3, false)])));
    }

    #[test]
    fn frames_are_never_torn() {
        let (tx, rx) = channel(8);
        let writer = thread::spawn(move || {
            for i in 0..2000u32 {
                // Every box in a frame carries the same score.
                let s = (i % 100) as f32 / 100.0;
                let n = 1 + (i as usize % 8);
                tx.publish(Some(&DetectionSet::from_boxes(&vec![scored(s, false); n])));
            }
        });
        let mut snap = BoxSnapshot::default();
        for _ in 0..2000 {
            rx.snapshot_into(&mut snap);
            if let Some(first) = snap.boxes.first() {
                assert!(snap.boxes.iter().all(|b| b.score == first.score));
            }
        }
        writer.join().unwrap();
    }
}
