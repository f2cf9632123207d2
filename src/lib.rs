//! Device mirroring transport and media pipeline
//!
//! Streams a device's displays and audio to the host over raw byte channels,
//! relays input back, and learns a sustainable video bit rate per device type.

pub mod assets;
pub mod audio;
pub mod client;
pub mod codec;
pub mod config;
pub mod control;
pub mod logging;
pub mod network;
pub mod sync;
pub mod video;

pub use client::{ClientError, ClientState, DeviceClient};
pub use config::Config;
