use std::sync::Arc;

use async_trait::async_trait;
use huddle_media::{SegmentationError, SegmentationMask, VideoFrame};

/// Result of one segmentation pass
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub mask: SegmentationMask,
    /// The frame the mask was computed for
    pub image: Arc<VideoFrame>,
}

/// Person segmentation model.
///
/// Loading is slow and happens in the background; callers poll
/// [`Segmenter::is_ready`] instead of waiting on it.
#[async_trait]
pub trait Segmenter: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn segment(&self, frame: Arc<VideoFrame>) -> Result<Segmentation, SegmentationError>;
}

/// Stand-in for hosts without a segmentation model.
///
/// Never becomes ready, so the compositor keeps polling and the raw
/// camera stays the outbound source.
#[derive(Debug, Default)]
pub struct NoModel;

#[async_trait]
impl Segmenter for NoModel {
    fn is_ready(&self) -> bool {
        false
    }

    async fn segment(&self, _frame: Arc<VideoFrame>) -> Result<Segmentation, SegmentationError> {
        Err(SegmentationError::NotReady)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use huddle_media::PixelFormat;

    use super::*;

    #[tokio::test]
    async fn no_model_is_never_ready() {
        let segmenter = NoModel;
        let frame = Arc::new(VideoFrame::new(2, 2, PixelFormat::Rgba, vec![0; 16], Duration::ZERO));

        assert!(!segmenter.is_ready());
        assert!(matches!(segmenter.segment(frame).await, Err(SegmentationError::NotReady)));
    }
}
