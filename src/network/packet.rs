//! Fixed-size headers of the media channels and the channel handshake.

use super::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};

/// First byte sent by the agent on each connection, identifying its role.
pub const VIDEO_CHANNEL_MARKER: u8 = b'V';
pub const CONTROL_CHANNEL_MARKER: u8 = b'C';
pub const AUDIO_CHANNEL_MARKER: u8 = b'A';

/// Length of the space-padded codec name following the video marker.
pub const CODEC_NAME_LENGTH: usize = 20;

/// Upper bound on a single packet payload.
pub const MAX_PACKET_SIZE: i32 = 64 * 1024 * 1024;

/// Role of an accepted agent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Video,
    Control,
    Audio,
}

impl ChannelRole {
    pub fn from_marker(marker: u8) -> Result<Self, ProtocolError> {
        match marker {
            VIDEO_CHANNEL_MARKER => Ok(ChannelRole::Video),
            CONTROL_CHANNEL_MARKER => Ok(ChannelRole::Control),
            AUDIO_CHANNEL_MARKER => Ok(ChannelRole::Audio),
            other => Err(ProtocolError::UnexpectedMarker(other)),
        }
    }

    pub fn marker(self) -> u8 {
        match self {
            ChannelRole::Video => VIDEO_CHANNEL_MARKER,
            ChannelRole::Control => CONTROL_CHANNEL_MARKER,
            ChannelRole::Audio => AUDIO_CHANNEL_MARKER,
        }
    }
}

/// Parses the codec name block sent after the video marker.
pub fn parse_codec_name(raw: &[u8; CODEC_NAME_LENGTH]) -> Result<String, ProtocolError> {
    let name = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)?;
    let name = name.trim_end_matches([' ', '\0']);
    if name.is_empty() {
        return Err(ProtocolError::InvalidHeader("empty codec name".into()));
    }
    Ok(name.to_string())
}

/// Pads a codec name into its fixed-size wire block.
pub fn codec_name_block(name: &str) -> [u8; CODEC_NAME_LENGTH] {
    let mut block = [b' '; CODEC_NAME_LENGTH];
    let len = name.len().min(CODEC_NAME_LENGTH);
    block[..len].copy_from_slice(&name.as_bytes()[..len]);
    block
}

pub const FLAG_ROUND_DISPLAY: u16 = 0x01;
pub const FLAG_BIT_RATE_REDUCED: u16 = 0x02;

/// Header preceding every video packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoPacketHeader {
    pub display_id: i32,
    pub width: i32,
    pub height: i32,
    /// Display orientation in quarter turns.
    pub orientation: u8,
    /// Rotation, in quarter turns, the host must apply to decoded frames.
    pub orientation_correction: u8,
    pub flags: u16,
    pub bit_rate: i32,
    pub frame_number: u32,
    pub origination_timestamp_us: i64,
    /// Zero for config packets.
    pub presentation_timestamp_us: i64,
    pub packet_size: i32,
}

impl VideoPacketHeader {
    pub const SIZE: usize = 44;

    pub fn parse(raw: &[u8; Self::SIZE]) -> Self {
        let mut buf = &raw[..];
        Self {
            display_id: buf.get_i32_le(),
            width: buf.get_i32_le(),
            height: buf.get_i32_le(),
            orientation: buf.get_u8(),
            orientation_correction: buf.get_u8(),
            flags: buf.get_u16_le(),
            bit_rate: buf.get_i32_le(),
            frame_number: buf.get_u32_le(),
            origination_timestamp_us: buf.get_i64_le(),
            presentation_timestamp_us: buf.get_i64_le(),
            packet_size: buf.get_i32_le(),
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.display_id);
        buf.put_i32_le(self.width);
        buf.put_i32_le(self.height);
        buf.put_u8(self.orientation);
        buf.put_u8(self.orientation_correction);
        buf.put_u16_le(self.flags);
        buf.put_i32_le(self.bit_rate);
        buf.put_u32_le(self.frame_number);
        buf.put_i64_le(self.origination_timestamp_us);
        buf.put_i64_le(self.presentation_timestamp_us);
        buf.put_i32_le(self.packet_size);
    }

    /// Rejects headers a well-behaved agent never sends.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.packet_size <= 0 || self.packet_size > MAX_PACKET_SIZE {
            return Err(ProtocolError::InvalidHeader(format!(
                "video packet size {} out of range",
                self.packet_size
            )));
        }
        if self.width <= 0 || self.height <= 0 {
            return Err(ProtocolError::InvalidHeader(format!(
                "display size {}x{} of display {}",
                self.width, self.height, self.display_id
            )));
        }
        Ok(())
    }

    pub fn is_config(&self) -> bool {
        self.presentation_timestamp_us == 0
    }

    pub fn is_round_display(&self) -> bool {
        self.flags & FLAG_ROUND_DISPLAY != 0
    }

    pub fn is_bit_rate_reduced(&self) -> bool {
        self.flags & FLAG_BIT_RATE_REDUCED != 0
    }

    pub fn payload_len(&self) -> usize {
        self.packet_size.max(0) as usize
    }
}

/// Header preceding every audio packet: a signed little-endian length,
/// negative for config packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioPacketHeader {
    pub packet_size: usize,
    pub is_config: bool,
}

impl AudioPacketHeader {
    pub const SIZE: usize = 4;

    pub fn parse(raw: &[u8; Self::SIZE]) -> Result<Self, ProtocolError> {
        let length = i32::from_le_bytes(*raw);
        if length == 0 || length == i32::MIN || length.abs() > MAX_PACKET_SIZE {
            return Err(ProtocolError::InvalidHeader(format!(
                "audio packet length {}",
                length
            )));
        }
        Ok(Self {
            packet_size: length.unsigned_abs() as usize,
            is_config: length < 0,
        })
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        let length = self.packet_size as i32;
        buf.put_i32_le(if self.is_config { -length } else { length });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> VideoPacketHeader {
        VideoPacketHeader {
            display_id: 2,
            width: 1080,
            height: 2400,
            orientation: 1,
            orientation_correction: 3,
            flags: FLAG_BIT_RATE_REDUCED,
            bit_rate: 4_000_000,
            frame_number: 77,
            origination_timestamp_us: 1_700_000_000_000_000,
            presentation_timestamp_us: 33_333,
            packet_size: 5120,
        }
    }

    #[test]
    fn test_video_header_layout() {
        let mut buf = BytesMut::new();
        header().write_to(&mut buf);
        assert_eq!(buf.len(), VideoPacketHeader::SIZE);
        // display id, then width, little-endian
        assert_eq!(&buf[0..4], &[2, 0, 0, 0]);
        assert_eq!(&buf[4..8], &1080i32.to_le_bytes());
        assert_eq!(buf[12], 1);
        assert_eq!(buf[13], 3);
        assert_eq!(&buf[40..44], &5120i32.to_le_bytes());

        let raw: [u8; VideoPacketHeader::SIZE] = buf[..].try_into().unwrap();
        let parsed = VideoPacketHeader::parse(&raw);
        assert_eq!(parsed, header());
        assert!(parsed.is_bit_rate_reduced());
        assert!(!parsed.is_round_display());
        assert!(!parsed.is_config());
        parsed.validate().unwrap();
    }

    #[test]
    fn test_video_header_validation() {
        let mut h = header();
        h.packet_size = 0;
        assert!(h.validate().is_err());
        h.packet_size = MAX_PACKET_SIZE + 1;
        assert!(h.validate().is_err());
        h.packet_size = 10;
        h.width = 0;
        assert!(h.validate().is_err());

        let mut config = header();
        config.presentation_timestamp_us = 0;
        assert!(config.is_config());
    }

    #[test]
    fn test_audio_header_sign_marks_config() {
        let config = AudioPacketHeader::parse(&(-42i32).to_le_bytes()).unwrap();
        assert_eq!(
            config,
            AudioPacketHeader {
                packet_size: 42,
                is_config: true
            }
        );
        let data = AudioPacketHeader::parse(&960i32.to_le_bytes()).unwrap();
        assert!(!data.is_config);
        assert_eq!(data.packet_size, 960);

        assert!(AudioPacketHeader::parse(&0i32.to_le_bytes()).is_err());
        assert!(AudioPacketHeader::parse(&i32::MIN.to_le_bytes()).is_err());
    }

    #[test]
    fn test_codec_name_block() {
        let block = codec_name_block("hevc");
        assert_eq!(&block[..6], b"hevc  ");
        assert_eq!(parse_codec_name(&block).unwrap(), "hevc");
        assert!(parse_codec_name(&[b' '; CODEC_NAME_LENGTH]).is_err());
    }

    #[test]
    fn test_markers() {
        assert_eq!(ChannelRole::from_marker(b'V').unwrap(), ChannelRole::Video);
        assert_eq!(ChannelRole::from_marker(b'C').unwrap(), ChannelRole::Control);
        assert_eq!(ChannelRole::from_marker(b'A').unwrap(), ChannelRole::Audio);
        assert!(matches!(
            ChannelRole::from_marker(b'X'),
            Err(ProtocolError::UnexpectedMarker(b'X'))
        ));
    }
}
