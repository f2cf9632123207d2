//! Connection orchestration for one device.

pub mod agent;
pub mod arbiter;
mod device_client;

pub use agent::{
    Adb, AdbAgentDeployer, AdbAgentLauncher, AgentDeployer, AgentError, AgentExit, AgentLauncher,
    AgentTerminationReport,
};
pub use arbiter::{RequesterId, StreamCommand, VideoStreamArbiter};
pub use device_client::DeviceClient;

use crate::network::{NetworkError, ProtocolError};
use thiserror::Error;

/// Connection faults. Cloneable because every caller awaiting the shared
/// connection attempt receives the same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Device is not responding")]
    NotResponding,

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Client is disposed")]
    Disposed,
}

impl From<NetworkError> for ClientError {
    fn from(e: NetworkError) -> Self {
        ClientError::Connection(e.to_string())
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Network(e) => e.into(),
            e => ClientError::Protocol(e.to_string()),
        }
    }
}

impl From<AgentError> for ClientError {
    fn from(e: AgentError) -> Self {
        ClientError::Agent(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Terminated,
}

impl ClientState {
    /// No transitions leave a final state.
    pub fn is_final(self) -> bool {
        matches!(self, ClientState::Disconnected | ClientState::Terminated)
    }
}

pub trait ClientListener: Send + Sync {
    fn on_state_changed(&self, state: ClientState) {
        let _ = state;
    }

    /// The agent died while the device stayed online.
    fn on_agent_terminated(&self, report: &AgentTerminationReport) {
        let _ = report;
    }
}
