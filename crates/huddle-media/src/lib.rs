//! Media primitives for Huddle
//!
//! This crate provides the pieces of the media path that do not need a
//! runtime:
//! - Raw frame types shared by capture, compositing and encoding
//! - Segmentation masks and the virtual background kernels
//! - Encoder traits and recording format selection

pub mod audio;
pub mod codec;
pub mod compositing;
pub mod frame;
pub mod recording;

pub use codec::*;
pub use compositing::{BackgroundFill, CompositeError, SegmentationError, SegmentationMask};
pub use frame::*;
pub use recording::*;
