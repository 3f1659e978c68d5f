// SPDX-License-Identifier: MPL-2.0

//! Bounded frame queue between the decoder's streaming thread and the engine.
//!
//! ```text
//! streaming thread ── push() ──▶ [ FrameQueue ] ── take_latest() ──▶ engine
//!                   drops oldest                  skips stale frames
//! ```
//!
//! Neither side blocks on the other. A wallpaper does not need every frame,
//! only the newest one at the time the engine draws.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

/// Frames buffered before the oldest is dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 3;

/// A decoded frame in BGRx layout.
#[derive(Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width * 4`.
    pub stride: u32,
    /// Presentation timestamp in nanoseconds from the start of the stream.
    pub pts_ns: Option<u64>,
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("bytes", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("pts_ns", &self.pts_ns)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub dropped: u64,
    pub taken: u64,
}

pub struct FrameQueue {
    frames: Mutex<VecDeque<VideoFrame>>,
    capacity: usize,
    stopped: AtomicBool,
    pushed: AtomicU64,
    dropped: AtomicU64,
    taken: AtomicU64,
}

impl FrameQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            stopped: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            taken: AtomicU64::new(0),
        }
    }

    /// Push a frame, dropping the oldest one when full.
    ///
    /// Returns `false` once the queue is stopped.
    pub fn push(&self, frame: VideoFrame) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }

        // Contention means the engine is draining right now; skip the frame.
        let Ok(mut frames) = self.frames.try_lock() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(pts_ns = ?frame.pts_ns, "frame dropped: lock contention");
            return true;
        };

        if frames.len() >= self.capacity {
            frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(pts_ns = ?frame.pts_ns, "frame dropped: queue full");
        }

        frames.push_back(frame);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Take the newest frame, discarding any older ones.
    pub fn take_latest(&self) -> Option<VideoFrame> {
        let mut frames = self.frames.lock().ok()?;
        let skipped = frames.len().saturating_sub(1) as u64;
        let frame = frames.pop_back();
        frames.clear();
        drop(frames);

        if frame.is_some() {
            self.taken.fetch_add(1, Ordering::Relaxed);
            self.dropped.fetch_add(skipped, Ordering::Relaxed);
        }

        frame
    }

    /// Stop accepting frames and discard the buffered ones.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Ok(mut frames) = self.frames.lock() {
            frames.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.frames.lock().map_or(0, |frames| frames.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            taken: self.taken.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

pub type SharedFrameQueue = Arc<FrameQueue>;

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pts: u64) -> VideoFrame {
        VideoFrame {
            data: vec![pts as u8; 4],
            width: 1,
            height: 1,
            stride: 4,
            pts_ns: Some(pts),
        }
    }

    #[test]
    fn take_latest_skips_older_frames() {
        let queue = FrameQueue::new(3);
        queue.push(frame(1));
        queue.push(frame(2));
        queue.push(frame(3));

        assert_eq!(queue.take_latest().and_then(|f| f.pts_ns), Some(3));
        assert!(queue.is_empty());
        assert!(queue.take_latest().is_none());

        let stats = queue.stats();
        assert_eq!(stats.pushed, 3);
        assert_eq!(stats.taken, 1);
        assert_eq!(stats.dropped, 2);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let queue = FrameQueue::new(2);
        queue.push(frame(1));
        queue.push(frame(2));
        queue.push(frame(3));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn stopped_queue_rejects_frames() {
        let queue = FrameQueue::new(2);
        queue.push(frame(1));
        queue.stop();

        assert!(queue.is_empty());
        assert!(!queue.push(frame(2)));
        assert!(queue.take_latest().is_none());
    }

    #[test]
    fn capacity_has_a_floor() {
        let queue = FrameQueue::new(0);
        queue.push(frame(1));
        queue.push(frame(2));
        assert_eq!(queue.len(), 2);
    }
}
