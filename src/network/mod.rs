use std::io::ErrorKind;
use std::time::Duration;
use thiserror::Error;

pub mod base128;
pub mod channel;
pub mod packet;
pub mod protocol;

pub use channel::{ChannelListener, SuspendingChannel};
pub use packet::{AudioPacketHeader, VideoPacketHeader};
pub use protocol::{ControlMessage, ControlMessageCodec};

/// Transport faults, translated at the channel boundary into a small closed set.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("End of stream")]
    EndOfStream,

    #[error("Channel closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// True when the peer went away: end of stream, reset or broken pipe.
    /// Callers treat these as normal termination rather than failures.
    pub fn is_lost_connection(&self) -> bool {
        match self {
            NetworkError::EndOfStream | NetworkError::Closed => true,
            NetworkError::Io(e) => matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
            ),
            NetworkError::Timeout(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;

/// Wire format faults. Any of these leaves the stream unusable.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unrecognized control message type {0}")]
    UnknownMessageType(u32),

    #[error("Unrecognized key event action {0}")]
    UnknownKeyAction(i32),

    #[error("Truncated {0}")]
    Truncated(&'static str),

    #[error("Malformed varint")]
    MalformedVarint,

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Invalid packet header: {0}")]
    InvalidHeader(String),

    #[error("Unexpected channel marker 0x{0:02X}")]
    UnexpectedMarker(u8),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Network(NetworkError::Io(e))
    }
}

impl ProtocolError {
    pub fn is_lost_connection(&self) -> bool {
        matches!(self, ProtocolError::Network(e) if e.is_lost_connection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_connection_classification() {
        assert!(NetworkError::EndOfStream.is_lost_connection());
        assert!(NetworkError::Io(ErrorKind::ConnectionReset.into()).is_lost_connection());
        assert!(!NetworkError::Timeout(Duration::from_millis(5)).is_lost_connection());
        assert!(!NetworkError::Io(ErrorKind::PermissionDenied.into()).is_lost_connection());

        let e: ProtocolError = NetworkError::EndOfStream.into();
        assert!(e.is_lost_connection());
        assert!(!ProtocolError::UnknownMessageType(99).is_lost_connection());
    }
}
