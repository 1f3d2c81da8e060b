//! Audio capture, encoding and segmentation.

pub mod capture;
pub mod codec;
pub mod encoder;
pub mod segmenter;

pub use capture::{CaptureSource, MockCaptureSource};
pub use encoder::{CaptureEvent, CaptureHandle, EncoderConfig};
pub use segmenter::{
    Clock, SegmenterConfig, SegmenterEvent, SegmenterState, SystemClock, UtteranceSegmenter,
};
