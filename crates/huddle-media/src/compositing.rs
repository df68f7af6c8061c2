//! Virtual background kernels
//!
//! The compositor keeps source pixels where the segmentation mask marks
//! foreground and fills the rest from either a blurred copy of the frame or
//! a static background image scaled to cover the frame.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbaImage};
use thiserror::Error;

use crate::frame::{PixelFormat, VideoFrame};

/// The blur runs on a frame shrunk by this factor, then scales back up.
const BLUR_DOWNSCALE: u32 = 4;

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("mask buffer holds {actual} bytes, expected {expected}")]
    MaskSize { expected: usize, actual: usize },
    #[error("frame in {0:?} cannot be composited")]
    UnsupportedFrame(PixelFormat),
    #[error("frame has no pixels")]
    Empty,
}

#[derive(Debug, Clone, Error)]
pub enum SegmentationError {
    #[error("segmentation model is not loaded yet")]
    NotReady,
    #[error("segmentation failed: {0}")]
    Failed(String),
}

/// Per-pixel foreground confidence, 0 = background, 255 = person
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationMask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl SegmentationMask {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, CompositeError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(CompositeError::MaskSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize],
        }
    }

    fn scaled_to(&self, width: u32, height: u32) -> Result<GrayImage, CompositeError> {
        let gray = GrayImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            CompositeError::MaskSize {
                expected: self.width as usize * self.height as usize,
                actual: self.data.len(),
            },
        )?;
        if self.width == width && self.height == height {
            return Ok(gray);
        }
        if self.width == 0 || self.height == 0 {
            return Err(CompositeError::Empty);
        }
        Ok(imageops::resize(&gray, width, height, FilterType::Triangle))
    }
}

/// What replaces the background pixels
#[derive(Debug, Clone, Copy)]
pub enum BackgroundFill<'a> {
    Blur { sigma: f32 },
    Image(&'a RgbaImage),
}

/// Cheap gaussian blur: shrink, blur, grow back
pub fn blurred(frame: &RgbaImage, sigma: f32) -> RgbaImage {
    let (width, height) = frame.dimensions();
    let small_w = (width / BLUR_DOWNSCALE).max(1);
    let small_h = (height / BLUR_DOWNSCALE).max(1);

    let small = imageops::resize(frame, small_w, small_h, FilterType::Triangle);
    let small = imageops::blur(&small, (sigma / BLUR_DOWNSCALE as f32).max(0.5));
    imageops::resize(&small, width, height, FilterType::Triangle)
}

/// Scale `background` so it covers `width`x`height`, center-cropped
pub fn cover(background: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    let (bw, bh) = background.dimensions();
    if bw == 0 || bh == 0 {
        return RgbaImage::new(width, height);
    }
    if (bw, bh) == (width, height) {
        return background.clone();
    }

    let scale = f64::max(width as f64 / bw as f64, height as f64 / bh as f64);
    let scaled_w = ((bw as f64 * scale).ceil() as u32).max(width);
    let scaled_h = ((bh as f64 * scale).ceil() as u32).max(height);

    let resized = imageops::resize(background, scaled_w, scaled_h, FilterType::Triangle);
    let x = (scaled_w - width) / 2;
    let y = (scaled_h - height) / 2;
    imageops::crop_imm(&resized, x, y, width, height).to_image()
}

/// Blend `frame` over the chosen fill using the mask as alpha
pub fn composite(
    frame: &RgbaImage,
    mask: &SegmentationMask,
    fill: &BackgroundFill<'_>,
) -> Result<RgbaImage, CompositeError> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return Err(CompositeError::Empty);
    }

    let alpha = mask.scaled_to(width, height)?;
    let mut out = match fill {
        BackgroundFill::Blur { sigma } => blurred(frame, *sigma),
        BackgroundFill::Image(image) => cover(image, width, height),
    };

    for (x, y, px) in out.enumerate_pixels_mut() {
        let a = alpha.get_pixel(x, y).0[0] as u32;
        if a == 0 {
            px.0[3] = 255;
            continue;
        }
        let fg = frame.get_pixel(x, y).0;
        for c in 0..3 {
            px.0[c] = ((fg[c] as u32 * a + px.0[c] as u32 * (255 - a) + 127) / 255) as u8;
        }
        px.0[3] = 255;
    }

    Ok(out)
}

/// [`composite`] on a raw frame, keeping its timestamp
pub fn composite_frame(
    frame: &VideoFrame,
    mask: &SegmentationMask,
    fill: &BackgroundFill<'_>,
) -> Result<VideoFrame, CompositeError> {
    let image = frame
        .to_rgba_image()
        .ok_or(CompositeError::UnsupportedFrame(frame.format))?;
    let out = composite(&image, mask, fill)?;
    Ok(VideoFrame::from_rgba_image(out, frame.timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::time::Duration;

    fn solid(width: u32, height: u32, color: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba(color))
    }

    fn close_to(actual: [u8; 4], expected: [u8; 4]) -> bool {
        actual
            .iter()
            .zip(expected.iter())
            .all(|(a, e)| (*a as i16 - *e as i16).abs() <= 2)
    }

    #[test]
    fn full_foreground_keeps_source_pixels() {
        let frame = solid(8, 8, [200, 10, 10, 255]);
        let mask = SegmentationMask::filled(8, 8, 255);
        let backdrop = solid(8, 8, [0, 0, 255, 255]);

        let out = composite(&frame, &mask, &BackgroundFill::Image(&backdrop)).unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn empty_mask_shows_background_image() {
        let frame = solid(8, 8, [200, 10, 10, 255]);
        let mask = SegmentationMask::filled(8, 8, 0);
        let backdrop = solid(16, 4, [0, 0, 255, 255]);

        let out = composite(&frame, &mask, &BackgroundFill::Image(&backdrop)).unwrap();
        assert!(out.pixels().all(|p| p.0 == [0, 0, 255, 255]));
    }

    #[test]
    fn low_resolution_mask_is_scaled_to_frame() {
        let frame = solid(32, 32, [255, 255, 255, 255]);
        // left half person, right half background
        let mask = SegmentationMask::new(2, 1, vec![255, 0]).unwrap();
        let backdrop = solid(32, 32, [0, 0, 0, 255]);

        let out = composite(&frame, &mask, &BackgroundFill::Image(&backdrop)).unwrap();
        assert!(close_to(out.get_pixel(0, 16).0, [255, 255, 255, 255]));
        assert!(close_to(out.get_pixel(31, 16).0, [0, 0, 0, 255]));
    }

    #[test]
    fn blur_fill_preserves_uniform_frames() {
        let frame = solid(16, 16, [40, 80, 120, 255]);
        let mask = SegmentationMask::filled(4, 4, 0);

        let out = composite(&frame, &mask, &BackgroundFill::Blur { sigma: 12.0 }).unwrap();
        assert_eq!(out.dimensions(), (16, 16));
        assert!(out.pixels().all(|p| close_to(p.0, [40, 80, 120, 255])));
    }

    #[test]
    fn mask_length_is_validated() {
        let err = SegmentationMask::new(4, 4, vec![0; 3]).unwrap_err();
        assert!(matches!(err, CompositeError::MaskSize { expected: 16, actual: 3 }));
    }

    #[test]
    fn planar_frames_are_not_composited() {
        let frame = VideoFrame::new(2, 2, PixelFormat::I420, vec![0; 6], Duration::ZERO);
        let mask = SegmentationMask::filled(2, 2, 255);
        let err = composite_frame(&frame, &mask, &BackgroundFill::Blur { sigma: 1.0 }).unwrap_err();
        assert!(matches!(err, CompositeError::UnsupportedFrame(PixelFormat::I420)));
    }
}
