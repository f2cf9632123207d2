//! Reconciles video stream requests from independent consumers of one display.

use crate::network::ControlMessage;
use crate::network::protocol::Size;
use std::collections::HashMap;

/// Identifies one consumer of a display's video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequesterId(pub u64);

/// A change the device has to be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    Start(Size),
    Resize(Size),
    Stop,
}

impl StreamCommand {
    pub fn to_message(self, display_id: i32) -> ControlMessage {
        match self {
            StreamCommand::Start(max_size) => ControlMessage::StartVideoStream {
                display_id,
                max_size,
            },
            StreamCommand::Resize(max_size) => ControlMessage::SetMaxVideoResolution {
                display_id,
                max_size,
            },
            StreamCommand::Stop => ControlMessage::StopVideoStream { display_id },
        }
    }
}

/// Requester to requested maximum resolution for a single display. The
/// stream is on while any requester is registered, at the component-wise
/// maximum of all requested resolutions.
#[derive(Debug, Default)]
pub struct VideoStreamArbiter {
    requests: HashMap<RequesterId, Size>,
}

impl VideoStreamArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self) -> bool {
        !self.requests.is_empty()
    }

    pub fn effective_size(&self) -> Option<Size> {
        self.requests.values().copied().reduce(Size::max)
    }

    /// Registers `requester`, or updates its resolution if already registered.
    pub fn start(&mut self, requester: RequesterId, max_size: Size) -> Option<StreamCommand> {
        let before = self.effective_size();
        self.requests.insert(requester, max_size);
        transition(before, self.effective_size())
    }

    pub fn stop(&mut self, requester: RequesterId) -> Option<StreamCommand> {
        let before = self.effective_size();
        self.requests.remove(&requester);
        transition(before, self.effective_size())
    }

    /// Changes the resolution of an already registered requester. Unknown
    /// requesters are ignored.
    pub fn set_max_size(&mut self, requester: RequesterId, max_size: Size) -> Option<StreamCommand> {
        if !self.requests.contains_key(&requester) {
            return None;
        }
        self.start(requester, max_size)
    }

    /// The command that brings a freshly connected device to the current state.
    pub fn replay(&self) -> Option<StreamCommand> {
        self.effective_size().map(StreamCommand::Start)
    }
}

fn transition(before: Option<Size>, after: Option<Size>) -> Option<StreamCommand> {
    match (before, after) {
        (None, Some(size)) => Some(StreamCommand::Start(size)),
        (Some(_), None) => Some(StreamCommand::Stop),
        (Some(old), Some(new)) if old != new => Some(StreamCommand::Resize(new)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: RequesterId = RequesterId(1);
    const B: RequesterId = RequesterId(2);

    #[test]
    fn test_effective_resolution_follows_requesters() {
        let mut arbiter = VideoStreamArbiter::new();
        assert_eq!(
            arbiter.start(A, Size::new(1080, 1920)),
            Some(StreamCommand::Start(Size::new(1080, 1920)))
        );
        assert_eq!(
            arbiter.start(B, Size::new(1440, 2560)),
            Some(StreamCommand::Resize(Size::new(1440, 2560)))
        );
        assert_eq!(arbiter.effective_size(), Some(Size::new(1440, 2560)));

        assert_eq!(
            arbiter.stop(B),
            Some(StreamCommand::Resize(Size::new(1080, 1920)))
        );
        assert_eq!(arbiter.stop(A), Some(StreamCommand::Stop));
        assert!(!arbiter.is_on());
    }

    #[test]
    fn test_redundant_requests_produce_no_commands() {
        let mut arbiter = VideoStreamArbiter::new();
        arbiter.start(A, Size::new(1440, 2560));
        assert_eq!(arbiter.start(B, Size::new(1080, 1920)), None);
        assert_eq!(arbiter.start(B, Size::new(1080, 1920)), None);
        assert_eq!(arbiter.stop(B), None);
        assert_eq!(arbiter.stop(B), None);
        assert_eq!(arbiter.set_max_size(B, Size::new(4000, 4000)), None);
    }

    #[test]
    fn test_max_is_component_wise() {
        let mut arbiter = VideoStreamArbiter::new();
        arbiter.start(A, Size::new(2000, 500));
        arbiter.start(B, Size::new(800, 1200));
        assert_eq!(arbiter.effective_size(), Some(Size::new(2000, 1200)));
        assert_eq!(
            arbiter.set_max_size(A, Size::new(700, 500)),
            Some(StreamCommand::Resize(Size::new(800, 1200)))
        );
    }

    #[test]
    fn test_replay_and_messages() {
        let mut arbiter = VideoStreamArbiter::new();
        assert_eq!(arbiter.replay(), None);
        arbiter.start(A, Size::new(640, 480));
        let command = arbiter.replay().unwrap();
        assert_eq!(
            command.to_message(3),
            ControlMessage::StartVideoStream {
                display_id: 3,
                max_size: Size::new(640, 480)
            }
        );
        assert_eq!(
            StreamCommand::Stop.to_message(3),
            ControlMessage::StopVideoStream { display_id: 3 }
        );
    }
}
