use std::sync::Arc;
use std::time::Duration;

use huddle_media::{AudioChunk, PixelFormat, VideoFrame};
use tokio::task::JoinHandle;

use crate::media::MediaTrack;

/// Opaque mid-grey RGBA frame
pub fn video_frame(width: u32, height: u32) -> VideoFrame {
    VideoFrame::new(
        width,
        height,
        PixelFormat::Rgba,
        [128u8, 128, 128, 255].repeat(width as usize * height as usize),
        Duration::ZERO,
    )
}

/// 20 ms of stereo silence at 48 kHz
pub fn audio_chunk() -> AudioChunk {
    AudioChunk {
        sample_rate: 48_000,
        channels: 2,
        samples: vec![0; 960 * 2],
        timestamp: Duration::ZERO,
    }
}

/// Publish small frames on `track` until the handle is aborted or the
/// track ends
pub fn feed_video(track: Arc<MediaTrack>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while track.is_live() {
            track.publish_video(video_frame(8, 8));
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    })
}

/// Poll `condition` until it holds; panics after two seconds
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within 2s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
