use super::frame::DecodedPicture;
use crate::codec::ffmpeg::{self as ff, BitstreamParser};
use crate::codec::{CodecError, EncodedPacket};
use ffmpeg::codec::decoder::Video as FfmpegDecoder;
use ffmpeg::codec::packet::{Flags as PacketFlags, Packet};
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{context::Context as ScalingContext, flag::Flags};
use ffmpeg::util::frame::video::Video as FfmpegFrame;
use ffmpeg_next as ffmpeg;

/// A video decoder turning access units into RGBA pictures.
#[cfg_attr(test, mockall::automock)]
pub trait VideoCodec: Send {
    /// Decodes `packet`, returning the newest picture it produced, if any.
    fn decode(&mut self, packet: &EncodedPacket) -> Result<Option<DecodedPicture>, CodecError>;
}

/// Software or hardware FFmpeg decoder with RGBA conversion.
pub struct FfmpegVideoDecoder {
    decoder: FfmpegDecoder,
    parser: BitstreamParser,
    scaler: Option<ScalingContext>,
    /// Source geometry the scaler was built for.
    scaler_input: Option<(Pixel, u32, u32)>,
    codec_name: String,
}

// FFmpeg contexts are only touched through &mut self.
unsafe impl Send for FfmpegVideoDecoder {}

impl FfmpegVideoDecoder {
    pub fn new(codec_name: &str) -> Result<Self, CodecError> {
        ff::init()?;
        let codec = ff::find_decoder(codec_name)?;
        let context = ff::create_context(&codec)?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| CodecError::Init(format!("{}: {}", codec_name, e)))?;
        let parser = BitstreamParser::new(codec.id())?;
        tracing::info!("Using video decoder {} for {}", codec.name(), codec_name);

        Ok(Self {
            decoder,
            parser,
            scaler: None,
            scaler_input: None,
            codec_name: codec_name.to_string(),
        })
    }

    fn send(&mut self, data: &[u8], pts: i64, key_frame: bool) -> Result<(), CodecError> {
        let mut packet = Packet::copy(data);
        packet.set_pts(Some(pts));
        if key_frame {
            packet.set_flags(PacketFlags::KEY);
        }
        self.decoder
            .send_packet(&packet)
            .map_err(|e| CodecError::Rejected(e.to_string()))
    }

    fn receive_latest(&mut self) -> Result<Option<DecodedPicture>, CodecError> {
        let mut latest = None;
        loop {
            let mut frame = FfmpegFrame::empty();
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => latest = Some(self.convert_frame(&frame)?),
                Err(e) if ff::is_again(&e) => return Ok(latest),
                Err(e) => return Err(CodecError::Rejected(e.to_string())),
            }
        }
    }

    fn convert_frame(&mut self, frame: &FfmpegFrame) -> Result<DecodedPicture, CodecError> {
        let width = frame.width();
        let height = frame.height();
        let input = (frame.format(), width, height);

        if self.scaler_input != Some(input) {
            let scaler = ScalingContext::get(
                frame.format(),
                width,
                height,
                Pixel::RGBA,
                width,
                height,
                Flags::BILINEAR,
            )
            .map_err(|e| CodecError::Init(format!("scaling context: {}", e)))?;
            self.scaler = Some(scaler);
            self.scaler_input = Some(input);
        }
        let Some(scaler) = self.scaler.as_mut() else {
            return Err(CodecError::Init("scaling context missing".into()));
        };

        let mut converted = FfmpegFrame::empty();
        scaler
            .run(frame, &mut converted)
            .map_err(|e| CodecError::Rejected(format!("color conversion: {}", e)))?;

        // Strip row padding.
        let stride = converted.stride(0);
        let row = width as usize * 4;
        let data = converted.data(0);
        let mut rgba = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            rgba.extend_from_slice(&data[start..start + row]);
        }

        Ok(DecodedPicture {
            width,
            height,
            rgba,
        })
    }
}

impl VideoCodec for FfmpegVideoDecoder {
    fn decode(&mut self, packet: &EncodedPacket) -> Result<Option<DecodedPicture>, CodecError> {
        let units =
            self.parser
                .parse(&mut self.decoder, &packet.data, packet.presentation_timestamp_us)?;
        let mut latest = None;
        for unit in units {
            self.send(&unit.data, packet.presentation_timestamp_us, unit.key_frame)?;
            if let Some(picture) = self.receive_latest()? {
                latest = Some(picture);
            }
        }
        Ok(latest)
    }
}

impl std::fmt::Debug for FfmpegVideoDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegVideoDecoder")
            .field("codec", &self.codec_name)
            .field("width", &self.decoder.width())
            .field("height", &self.decoder.height())
            .finish()
    }
}
