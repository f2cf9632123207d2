/// Control channel: input injection, device notifications, bit rate learning
pub mod bitrate;
pub mod controller;
pub mod keys;

pub use bitrate::{BitRateTracker, DeviceKey};
pub use controller::{ControllerError, DeviceController, NotificationListener};
pub use keys::KeyStroke;
