/// Video decoding: per-display pipelines producing RGBA frames
pub mod decoder;
pub mod frame;
pub mod stream;

pub use decoder::{FfmpegVideoDecoder, VideoCodec};
pub use frame::{DecodedPicture, VideoFrame};
pub use stream::{DisplayDecoder, FrameListener, VideoDecoder};
