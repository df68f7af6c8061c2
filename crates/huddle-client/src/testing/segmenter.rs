use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use huddle_media::{SegmentationError, SegmentationMask, VideoFrame};

use crate::session::segmentation::{Segmentation, Segmenter};

/// Segmenter that marks the whole frame as foreground
#[derive(Debug, Default)]
pub struct FakeSegmenter {
    ready: AtomicBool,
    fail_next: AtomicUsize,
    calls: AtomicUsize,
    successes: AtomicU64,
}

impl FakeSegmenter {
    pub fn ready() -> Self {
        let segmenter = Self::default();
        segmenter.set_ready(true);
        segmenter
    }

    /// Model still loading
    pub fn loading() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Fail the next `count` submissions
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Segmenter for FakeSegmenter {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn segment(&self, frame: Arc<VideoFrame>) -> Result<Segmentation, SegmentationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_ready() {
            return Err(SegmentationError::NotReady);
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SegmentationError::Failed("injected failure".to_string()));
        }

        tokio::task::yield_now().await;
        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(Segmentation {
            mask: SegmentationMask::filled(frame.width, frame.height, 255),
            image: frame,
        })
    }
}
