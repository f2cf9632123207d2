//! FFmpeg glue shared by the video and audio decoders.

use super::{CodecError, CodecFactory};
use crate::audio::decoder::{AudioCodec, FfmpegAudioDecoder};
use crate::video::decoder::{FfmpegVideoDecoder, VideoCodec};
use ffmpeg::codec::Context;
use ffmpeg::codec::parameters::Parameters;
use ffmpeg::ffi;
use ffmpeg_next as ffmpeg;

pub fn init() -> Result<(), CodecError> {
    ffmpeg::init().map_err(|e| CodecError::Init(format!("FFmpeg: {}", e)))
}

/// Maps the codec name announced by the agent to an FFmpeg decoder.
pub fn find_decoder(codec_name: &str) -> Result<ffmpeg::Codec, CodecError> {
    let name = match codec_name.to_ascii_lowercase().as_str() {
        "avc" | "h264" => "h264",
        "hevc" | "h265" => "hevc",
        "vp8" => "vp8",
        "vp9" => "vp9",
        "av01" | "av1" => "av1",
        "opus" => "opus",
        "aac" | "mp4a-latm" => "aac",
        "raw" | "pcm" => "pcm_s16le",
        other => return Err(CodecError::Unsupported(other.to_string())),
    };
    ffmpeg::codec::decoder::find_by_name(name)
        .ok_or_else(|| CodecError::Unsupported(codec_name.to_string()))
}

/// Creates an unopened codec context for `codec`.
pub fn create_context(codec: &ffmpeg::Codec) -> Result<Context, CodecError> {
    let mut params = Parameters::new();
    unsafe {
        (*params.as_mut_ptr()).codec_id = codec.id().into();
    }
    Context::from_parameters(params).map_err(|e| CodecError::Init(e.to_string()))
}

/// Creates an unopened audio codec context with the stream's sample rate.
pub fn create_audio_context(codec: &ffmpeg::Codec, sample_rate: u32) -> Result<Context, CodecError> {
    let mut params = Parameters::new();
    unsafe {
        let raw = params.as_mut_ptr();
        (*raw).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
        (*raw).codec_id = codec.id().into();
        (*raw).sample_rate = sample_rate as i32;
    }
    Context::from_parameters(params).map_err(|e| CodecError::Init(e.to_string()))
}

/// True when `e` means "feed more input" or "drained".
pub fn is_again(e: &ffmpeg::Error) -> bool {
    matches!(e, ffmpeg::Error::Other { errno } if *errno == ffmpeg::util::error::EAGAIN)
        || matches!(e, ffmpeg::Error::Eof)
}

/// One access unit produced by [`BitstreamParser`].
#[derive(Debug)]
pub struct AccessUnit {
    pub data: Vec<u8>,
    pub key_frame: bool,
}

/// Splits an elementary stream into access units.
pub struct BitstreamParser {
    ctx: *mut ffi::AVCodecParserContext,
}

// The parser context is owned exclusively and only touched through &mut self.
unsafe impl Send for BitstreamParser {}

impl BitstreamParser {
    pub fn new(codec_id: ffmpeg::codec::Id) -> Result<Self, CodecError> {
        let ctx = unsafe { ffi::av_parser_init(ffi::AVCodecID::from(codec_id) as i32) };
        if ctx.is_null() {
            return Err(CodecError::Init(format!("no parser for {:?}", codec_id)));
        }
        // Each packet from the agent holds whole frames.
        unsafe {
            (*ctx).flags |= ffi::PARSER_FLAG_COMPLETE_FRAMES as i32;
        }
        Ok(Self { ctx })
    }

    /// Parses `data` into the access units it contains.
    pub fn parse(
        &mut self,
        decoder: &mut ffmpeg::decoder::Video,
        data: &[u8],
        pts: i64,
    ) -> Result<Vec<AccessUnit>, CodecError> {
        let mut units = Vec::new();
        let mut input = data;
        loop {
            let mut out_buf: *mut u8 = std::ptr::null_mut();
            let mut out_size: i32 = 0;
            let consumed = unsafe {
                ffi::av_parser_parse2(
                    self.ctx,
                    decoder.as_mut_ptr(),
                    &mut out_buf,
                    &mut out_size,
                    input.as_ptr(),
                    input.len() as i32,
                    pts,
                    ffi::AV_NOPTS_VALUE,
                    0,
                )
            };
            if consumed < 0 {
                return Err(CodecError::Rejected(format!(
                    "bitstream parser error {}",
                    consumed
                )));
            }
            if out_size > 0 && !out_buf.is_null() {
                let unit = unsafe { std::slice::from_raw_parts(out_buf, out_size as usize) };
                units.push(AccessUnit {
                    data: unit.to_vec(),
                    key_frame: unsafe { (*self.ctx).key_frame } == 1,
                });
            }
            input = &input[consumed as usize..];
            if input.is_empty() || (consumed == 0 && out_size == 0) {
                break;
            }
        }
        Ok(units)
    }
}

impl Drop for BitstreamParser {
    fn drop(&mut self) {
        unsafe { ffi::av_parser_close(self.ctx) };
    }
}

/// Creates FFmpeg-backed codecs.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegCodecFactory;

impl CodecFactory for FfmpegCodecFactory {
    fn create_video_codec(&self, codec_name: &str) -> Result<Box<dyn VideoCodec>, CodecError> {
        Ok(Box::new(FfmpegVideoDecoder::new(codec_name)?))
    }

    fn create_audio_codec(
        &self,
        codec_name: &str,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Box<dyn AudioCodec>, CodecError> {
        Ok(Box::new(FfmpegAudioDecoder::new(
            codec_name,
            sample_rate,
            channels,
        )?))
    }
}
