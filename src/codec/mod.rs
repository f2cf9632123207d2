//! Pieces shared by the video and audio decoding pipelines.

pub mod ffmpeg;

use crate::audio::decoder::AudioCodec;
use crate::network::{NetworkError, ProtocolError};
use crate::video::decoder::VideoCodec;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

pub use self::ffmpeg::FfmpegCodecFactory;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The decoder refused one access unit. The stream is still usable.
    #[error("Decoder rejected packet: {0}")]
    Rejected(String),

    #[error("Unsupported codec: {0}")]
    Unsupported(String),

    #[error("Decoder initialization failed: {0}")]
    Init(String),
}

impl CodecError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::Rejected(_))
    }
}

/// Why a media pipeline stopped.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<NetworkError> for PipelineError {
    fn from(e: NetworkError) -> Self {
        PipelineError::Protocol(e.into())
    }
}

impl PipelineError {
    /// True for a clean end of the channel.
    pub fn is_lost_connection(&self) -> bool {
        matches!(self, PipelineError::Protocol(e) if e.is_lost_connection())
    }
}

/// One unit of compressed data handed to a codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub presentation_timestamp_us: i64,
}

/// Holds config packets until the next data packet arrives.
///
/// Config data is never decoded on its own: it is prepended to the following
/// data packet. The pending buffer is taken out before the merged packet is
/// returned, so it never outlives one decode attempt.
#[derive(Debug, Default)]
pub struct PacketAccumulator {
    pending: Option<BytesMut>,
}

impl PacketAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_config(&mut self, data: &[u8]) {
        self.pending
            .get_or_insert_with(|| BytesMut::with_capacity(data.len()))
            .extend_from_slice(data);
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns `data` with any pending config data in front of it.
    pub fn merge(&mut self, data: Bytes) -> Bytes {
        match self.pending.take() {
            Some(mut pending) => {
                pending.extend_from_slice(&data);
                pending.freeze()
            }
            None => data,
        }
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}

/// Creates codecs by the name announced on the media channel.
pub trait CodecFactory: Send + Sync {
    fn create_video_codec(&self, codec_name: &str) -> Result<Box<dyn VideoCodec>, CodecError>;

    fn create_audio_codec(
        &self,
        codec_name: &str,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Box<dyn AudioCodec>, CodecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_is_prepended_once() {
        let mut acc = PacketAccumulator::new();
        assert_eq!(acc.merge(Bytes::from_static(b"data")), &b"data"[..]);

        acc.push_config(b"sps");
        acc.push_config(b"pps");
        assert!(acc.has_pending());
        assert_eq!(acc.merge(Bytes::from_static(b"idr")), &b"spsppsidr"[..]);

        assert!(!acc.has_pending());
        assert_eq!(acc.merge(Bytes::from_static(b"p")), &b"p"[..]);
    }

    #[test]
    fn test_clear_drops_pending() {
        let mut acc = PacketAccumulator::new();
        acc.push_config(b"cfg");
        acc.clear();
        assert_eq!(acc.merge(Bytes::from_static(b"x")), &b"x"[..]);
    }

    #[test]
    fn test_only_rejection_is_recoverable() {
        assert!(CodecError::Rejected("bad".into()).is_recoverable());
        assert!(!CodecError::Unsupported("vp9".into()).is_recoverable());
        assert!(!CodecError::Init("oom".into()).is_recoverable());
    }
}
