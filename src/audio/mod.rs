/// Audio decoding and playback module
pub mod decoder;
pub mod player;
pub mod stream;

pub use decoder::{AudioCodec, AudioSamples, FfmpegAudioDecoder};
pub use player::{AudioPlayer, playback_queue};
pub use stream::{AudioDecoder, AudioFormat, AudioStreamListener};
