use crate::codec::ffmpeg as ff;
use crate::codec::{CodecError, EncodedPacket};
use ffmpeg::ChannelLayout;
use ffmpeg::codec::decoder::Audio as FfmpegDecoder;
use ffmpeg::codec::packet::Packet;
use ffmpeg::format::{Sample, sample::Type as SampleType};
use ffmpeg::software::resampling::context::Context as ResamplingContext;
use ffmpeg::util::frame::audio::Audio as FfmpegFrame;
use ffmpeg_next as ffmpeg;

/// Interleaved f32 samples ready for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSamples {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSamples {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait AudioCodec: Send {
    /// Decodes `packet` into samples at the playback rate and layout.
    fn decode(&mut self, packet: &EncodedPacket) -> Result<Option<AudioSamples>, CodecError>;
}

/// FFmpeg decoder resampling to interleaved f32 at a fixed rate.
pub struct FfmpegAudioDecoder {
    decoder: FfmpegDecoder,
    resampler: Option<ResamplingContext>,
    resampler_input: Option<(Sample, ChannelLayout, u32)>,
    sample_rate: u32,
    channels: u16,
}

unsafe impl Send for FfmpegAudioDecoder {}

impl FfmpegAudioDecoder {
    pub fn new(codec_name: &str, sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        if channels == 0 || sample_rate == 0 {
            return Err(CodecError::Init(format!(
                "{} Hz with {} channels",
                sample_rate, channels
            )));
        }
        ff::init()?;
        let codec = ff::find_decoder(codec_name)?;
        let decoder = ff::create_audio_context(&codec, sample_rate)?
            .decoder()
            .audio()
            .map_err(|e| CodecError::Init(format!("{}: {}", codec_name, e)))?;
        tracing::info!(
            "Using audio decoder {} ({} Hz, {} channels)",
            codec.name(),
            sample_rate,
            channels
        );

        Ok(Self {
            decoder,
            resampler: None,
            resampler_input: None,
            sample_rate,
            channels,
        })
    }

    fn output_layout(&self) -> ChannelLayout {
        ChannelLayout::default(self.channels as i32)
    }

    fn resample(&mut self, frame: &FfmpegFrame, out: &mut Vec<f32>) -> Result<(), CodecError> {
        let layout = if frame.channel_layout().is_empty() {
            ChannelLayout::default(frame.channels() as i32)
        } else {
            frame.channel_layout()
        };
        let input = (frame.format(), layout, frame.rate());

        if self.resampler_input != Some(input) {
            let resampler = ResamplingContext::get(
                frame.format(),
                layout,
                frame.rate(),
                Sample::F32(SampleType::Packed),
                self.output_layout(),
                self.sample_rate,
            )
            .map_err(|e| CodecError::Init(format!("resampler: {}", e)))?;
            self.resampler = Some(resampler);
            self.resampler_input = Some(input);
        }
        let Some(resampler) = self.resampler.as_mut() else {
            return Err(CodecError::Init("resampler missing".into()));
        };

        let mut converted = FfmpegFrame::empty();
        resampler
            .run(frame, &mut converted)
            .map_err(|e| CodecError::Rejected(format!("resampling: {}", e)))?;

        let len = converted.samples() * self.channels as usize * 4;
        let data = converted.data(0);
        let len = len.min(data.len());
        out.extend(
            data[..len]
                .chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
        );
        Ok(())
    }
}

impl AudioCodec for FfmpegAudioDecoder {
    fn decode(&mut self, packet: &EncodedPacket) -> Result<Option<AudioSamples>, CodecError> {
        let mut ffmpeg_packet = Packet::copy(&packet.data);
        ffmpeg_packet.set_pts(Some(packet.presentation_timestamp_us));
        self.decoder
            .send_packet(&ffmpeg_packet)
            .map_err(|e| CodecError::Rejected(e.to_string()))?;

        let mut samples = Vec::new();
        loop {
            let mut frame = FfmpegFrame::empty();
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => self.resample(&frame, &mut samples)?,
                Err(e) if ff::is_again(&e) => break,
                Err(e) => return Err(CodecError::Rejected(e.to_string())),
            }
        }

        if samples.is_empty() {
            return Ok(None);
        }
        Ok(Some(AudioSamples {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_count() {
        let samples = AudioSamples {
            samples: vec![0.0; 960 * 2],
            sample_rate: 48_000,
            channels: 2,
        };
        assert_eq!(samples.frames(), 960);
    }

    #[test]
    fn test_rejects_zero_channels() {
        assert!(matches!(
            FfmpegAudioDecoder::new("opus", 48_000, 0),
            Err(CodecError::Init(_))
        ));
    }
}
