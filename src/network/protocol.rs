//! Control channel messages.
//!
//! Every message starts with a varint discriminant followed by its fields in
//! base-128 form (see [`super::base128`]). Host-to-device messages carry input
//! and stream commands; device-to-host messages are notifications and
//! responses to correlated requests.

use super::ProtocolError;
use super::base128::{Base128Reader, Base128Writer};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Stable wire discriminants.
pub mod message_type {
    pub const MOTION_EVENT: u32 = 1;
    pub const KEY_EVENT: u32 = 2;
    pub const TEXT_INPUT: u32 = 3;
    pub const SET_DEVICE_ORIENTATION: u32 = 4;
    pub const SET_MAX_VIDEO_RESOLUTION: u32 = 5;
    pub const START_VIDEO_STREAM: u32 = 6;
    pub const STOP_VIDEO_STREAM: u32 = 7;
    pub const START_AUDIO_STREAM: u32 = 8;
    pub const STOP_AUDIO_STREAM: u32 = 9;
    pub const START_CLIPBOARD_SYNC: u32 = 10;
    pub const STOP_CLIPBOARD_SYNC: u32 = 11;
    pub const REQUEST_DEVICE_STATE: u32 = 12;
    pub const DISPLAY_CONFIGURATION_REQUEST: u32 = 13;
    pub const ERROR_RESPONSE: u32 = 14;
    pub const DISPLAY_CONFIGURATION_RESPONSE: u32 = 15;
    pub const CLIPBOARD_CHANGED: u32 = 16;
    pub const SUPPORTED_DEVICE_STATES: u32 = 17;
    pub const DEVICE_STATE: u32 = 18;
    pub const DISPLAY_ADDED: u32 = 19;
    pub const DISPLAY_REMOVED: u32 = 20;
    pub const UI_SETTINGS_REQUEST: u32 = 21;
    pub const UI_SETTINGS_RESPONSE: u32 = 22;
    pub const SET_DARK_MODE: u32 = 23;
    pub const SET_FONT_SIZE: u32 = 24;
    pub const SET_SCREEN_DENSITY: u32 = 25;
    pub const SET_TALK_BACK: u32 = 26;
    pub const SET_SELECT_TO_SPEAK: u32 = 27;
    pub const SET_APP_LANGUAGE: u32 = 28;
    pub const SET_GESTURE_NAVIGATION: u32 = 29;
}

/// Constants from android.view.MotionEvent.
pub mod motion {
    pub const ACTION_DOWN: i32 = 0;
    pub const ACTION_UP: i32 = 1;
    pub const ACTION_MOVE: i32 = 2;
    pub const ACTION_CANCEL: i32 = 3;
    pub const ACTION_POINTER_DOWN: i32 = 5;
    pub const ACTION_POINTER_UP: i32 = 6;
    pub const ACTION_HOVER_MOVE: i32 = 7;
    pub const ACTION_SCROLL: i32 = 8;

    pub const AXIS_VSCROLL: i32 = 9;
    pub const AXIS_HSCROLL: i32 = 10;

    pub const BUTTON_PRIMARY: i32 = 1 << 0;
    pub const BUTTON_SECONDARY: i32 = 1 << 1;
    pub const BUTTON_TERTIARY: i32 = 1 << 2;

    pub const ACTION_POINTER_INDEX_SHIFT: i32 = 8;
}

/// Device state id meaning "return to the physical state".
pub const PHYSICAL_DEVICE_STATE: i32 = -1;

/// Width and height in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

impl Size {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    /// Component-wise maximum.
    pub fn max(self, other: Size) -> Size {
        Size::new(self.width.max(other.width), self.height.max(other.height))
    }

    /// Size after rotating by the given number of quarter turns.
    pub fn rotated_by_quadrants(self, quadrants: i32) -> Size {
        if quadrants.rem_euclid(2) == 0 {
            self
        } else {
            Size::new(self.height, self.width)
        }
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One touch point of a motion event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pointer {
    pub x: i32,
    pub y: i32,
    pub pointer_id: i32,
    /// Axis id and value pairs, e.g. scroll deltas.
    pub axis_values: Vec<(i32, f32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down,
    Up,
    DownAndUp,
}

impl KeyAction {
    pub fn value(self) -> i32 {
        match self {
            KeyAction::Down => 0,
            KeyAction::Up => 1,
            KeyAction::DownAndUp => 8,
        }
    }

    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(KeyAction::Down),
            1 => Some(KeyAction::Up),
            8 => Some(KeyAction::DownAndUp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayType {
    Unknown,
    Internal,
    External,
    Overlay,
    Virtual,
}

impl DisplayType {
    fn ordinal(self) -> i32 {
        self as i32
    }

    fn from_ordinal(ordinal: i32) -> Self {
        match ordinal {
            1 => DisplayType::Internal,
            2 => DisplayType::External,
            3 => DisplayType::Overlay,
            4 => DisplayType::Virtual,
            _ => DisplayType::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayDescriptor {
    pub display_id: i32,
    pub size: Size,
    pub orientation: i32,
    pub display_type: DisplayType,
}

/// A folding state supported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub id: i32,
    pub name: String,
}

/// UI settings reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UiSettings {
    pub dark_mode: bool,
    pub gesture_overlay_installed: bool,
    pub gesture_navigation: bool,
    pub foreground_application_id: String,
    pub app_locale: String,
    pub talk_back_installed: bool,
    pub talk_back_on: bool,
    pub select_to_speak_on: bool,
    pub font_size_settable: bool,
    pub font_size: i32,
    pub density_settable: bool,
    pub density: i32,
}

/// All messages exchanged over the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    // Host to device.
    MotionEvent {
        pointers: Vec<Pointer>,
        action: i32,
        button_state: i32,
        action_button: i32,
        display_id: i32,
    },
    KeyEvent {
        action: KeyAction,
        key_code: i32,
        meta_state: i32,
    },
    TextInput {
        text: String,
    },
    SetDeviceOrientation {
        orientation: i32,
    },
    SetMaxVideoResolution {
        display_id: i32,
        max_size: Size,
    },
    StartVideoStream {
        display_id: i32,
        max_size: Size,
    },
    StopVideoStream {
        display_id: i32,
    },
    StartAudioStream,
    StopAudioStream,
    StartClipboardSync {
        max_synced_length: i32,
        text: String,
    },
    StopClipboardSync,
    RequestDeviceState {
        device_state_id: i32,
    },
    DisplayConfigurationRequest {
        request_id: i32,
    },
    UiSettingsRequest {
        request_id: i32,
    },
    SetDarkMode {
        dark_mode: bool,
    },
    SetFontSize {
        font_size: i32,
    },
    SetScreenDensity {
        density: i32,
    },
    SetTalkBack {
        on: bool,
    },
    SetSelectToSpeak {
        on: bool,
    },
    SetAppLanguage {
        application_id: String,
        locale: String,
    },
    SetGestureNavigation {
        on: bool,
    },

    // Device to host.
    ErrorResponse {
        request_id: i32,
        error_message: String,
    },
    DisplayConfigurationResponse {
        request_id: i32,
        displays: Vec<DisplayDescriptor>,
    },
    UiSettingsResponse {
        request_id: i32,
        settings: UiSettings,
    },
    ClipboardChanged {
        text: String,
    },
    SupportedDeviceStates {
        device_states: Vec<DeviceState>,
        device_state_id: i32,
    },
    DeviceStateChanged {
        device_state_id: i32,
    },
    DisplayAdded {
        display_id: i32,
    },
    DisplayRemoved {
        display_id: i32,
    },
}

impl ControlMessage {
    /// Wire discriminant of this message.
    pub fn message_type(&self) -> u32 {
        use message_type::*;
        match self {
            ControlMessage::MotionEvent { .. } => MOTION_EVENT,
            ControlMessage::KeyEvent { .. } => KEY_EVENT,
            ControlMessage::TextInput { .. } => TEXT_INPUT,
            ControlMessage::SetDeviceOrientation { .. } => SET_DEVICE_ORIENTATION,
            ControlMessage::SetMaxVideoResolution { .. } => SET_MAX_VIDEO_RESOLUTION,
            ControlMessage::StartVideoStream { .. } => START_VIDEO_STREAM,
            ControlMessage::StopVideoStream { .. } => STOP_VIDEO_STREAM,
            ControlMessage::StartAudioStream => START_AUDIO_STREAM,
            ControlMessage::StopAudioStream => STOP_AUDIO_STREAM,
            ControlMessage::StartClipboardSync { .. } => START_CLIPBOARD_SYNC,
            ControlMessage::StopClipboardSync => STOP_CLIPBOARD_SYNC,
            ControlMessage::RequestDeviceState { .. } => REQUEST_DEVICE_STATE,
            ControlMessage::DisplayConfigurationRequest { .. } => DISPLAY_CONFIGURATION_REQUEST,
            ControlMessage::UiSettingsRequest { .. } => UI_SETTINGS_REQUEST,
            ControlMessage::SetDarkMode { .. } => SET_DARK_MODE,
            ControlMessage::SetFontSize { .. } => SET_FONT_SIZE,
            ControlMessage::SetScreenDensity { .. } => SET_SCREEN_DENSITY,
            ControlMessage::SetTalkBack { .. } => SET_TALK_BACK,
            ControlMessage::SetSelectToSpeak { .. } => SET_SELECT_TO_SPEAK,
            ControlMessage::SetAppLanguage { .. } => SET_APP_LANGUAGE,
            ControlMessage::SetGestureNavigation { .. } => SET_GESTURE_NAVIGATION,
            ControlMessage::ErrorResponse { .. } => ERROR_RESPONSE,
            ControlMessage::DisplayConfigurationResponse { .. } => DISPLAY_CONFIGURATION_RESPONSE,
            ControlMessage::UiSettingsResponse { .. } => UI_SETTINGS_RESPONSE,
            ControlMessage::ClipboardChanged { .. } => CLIPBOARD_CHANGED,
            ControlMessage::SupportedDeviceStates { .. } => SUPPORTED_DEVICE_STATES,
            ControlMessage::DeviceStateChanged { .. } => DEVICE_STATE,
            ControlMessage::DisplayAdded { .. } => DISPLAY_ADDED,
            ControlMessage::DisplayRemoved { .. } => DISPLAY_REMOVED,
        }
    }

    /// Request id of correlated requests and responses.
    pub fn request_id(&self) -> Option<i32> {
        match self {
            ControlMessage::DisplayConfigurationRequest { request_id }
            | ControlMessage::UiSettingsRequest { request_id }
            | ControlMessage::ErrorResponse { request_id, .. }
            | ControlMessage::DisplayConfigurationResponse { request_id, .. }
            | ControlMessage::UiSettingsResponse { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// True for responses to correlated requests.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            ControlMessage::ErrorResponse { .. }
                | ControlMessage::DisplayConfigurationResponse { .. }
                | ControlMessage::UiSettingsResponse { .. }
        )
    }

    /// Appends the wire form of this message to `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) {
        let mut w = Base128Writer::new(buf);
        w.write_u32(self.message_type());
        match self {
            ControlMessage::MotionEvent {
                pointers,
                action,
                button_state,
                action_button,
                display_id,
            } => {
                w.write_u32(pointers.len() as u32);
                for pointer in pointers {
                    w.write_i32(pointer.x);
                    w.write_i32(pointer.y);
                    w.write_i32(pointer.pointer_id);
                    w.write_u32(pointer.axis_values.len() as u32);
                    for (axis, value) in &pointer.axis_values {
                        w.write_i32(*axis);
                        w.write_f32(*value);
                    }
                }
                w.write_i32(*action);
                w.write_i32(*button_state);
                w.write_i32(*action_button);
                w.write_i32(*display_id);
            }
            ControlMessage::KeyEvent {
                action,
                key_code,
                meta_state,
            } => {
                w.write_i32(action.value());
                w.write_i32(*key_code);
                w.write_i32(*meta_state);
            }
            ControlMessage::TextInput { text } | ControlMessage::ClipboardChanged { text } => {
                w.write_str(text)
            }
            ControlMessage::SetDeviceOrientation { orientation } => w.write_i32(*orientation),
            ControlMessage::SetMaxVideoResolution {
                display_id,
                max_size,
            }
            | ControlMessage::StartVideoStream {
                display_id,
                max_size,
            } => {
                w.write_i32(*display_id);
                w.write_i32(max_size.width);
                w.write_i32(max_size.height);
            }
            ControlMessage::StopVideoStream { display_id }
            | ControlMessage::DisplayAdded { display_id }
            | ControlMessage::DisplayRemoved { display_id } => w.write_i32(*display_id),
            ControlMessage::StartAudioStream
            | ControlMessage::StopAudioStream
            | ControlMessage::StopClipboardSync => {}
            ControlMessage::StartClipboardSync {
                max_synced_length,
                text,
            } => {
                w.write_i32(*max_synced_length);
                w.write_str(text);
            }
            // Device state ids are shifted by one so that -1 fits in one byte.
            ControlMessage::RequestDeviceState { device_state_id }
            | ControlMessage::DeviceStateChanged { device_state_id } => {
                w.write_i32(device_state_id.wrapping_add(1))
            }
            ControlMessage::DisplayConfigurationRequest { request_id }
            | ControlMessage::UiSettingsRequest { request_id } => w.write_i32(*request_id),
            ControlMessage::SetDarkMode { dark_mode } => w.write_bool(*dark_mode),
            ControlMessage::SetFontSize { font_size } => w.write_i32(*font_size),
            ControlMessage::SetScreenDensity { density } => w.write_i32(*density),
            ControlMessage::SetTalkBack { on }
            | ControlMessage::SetSelectToSpeak { on }
            | ControlMessage::SetGestureNavigation { on } => w.write_bool(*on),
            ControlMessage::SetAppLanguage {
                application_id,
                locale,
            } => {
                w.write_str(application_id);
                w.write_str(locale);
            }
            ControlMessage::ErrorResponse {
                request_id,
                error_message,
            } => {
                w.write_i32(*request_id);
                w.write_str(error_message);
            }
            ControlMessage::DisplayConfigurationResponse {
                request_id,
                displays,
            } => {
                w.write_i32(*request_id);
                w.write_u32(displays.len() as u32);
                for display in displays {
                    w.write_i32(display.display_id);
                    w.write_i32(display.size.width);
                    w.write_i32(display.size.height);
                    w.write_i32(display.orientation);
                    w.write_i32(display.display_type.ordinal());
                }
            }
            ControlMessage::UiSettingsResponse {
                request_id,
                settings: s,
            } => {
                w.write_i32(*request_id);
                w.write_bool(s.dark_mode);
                w.write_bool(s.gesture_overlay_installed);
                w.write_bool(s.gesture_navigation);
                w.write_str(&s.foreground_application_id);
                w.write_str(&s.app_locale);
                w.write_bool(s.talk_back_installed);
                w.write_bool(s.talk_back_on);
                w.write_bool(s.select_to_speak_on);
                w.write_bool(s.font_size_settable);
                w.write_i32(s.font_size);
                w.write_bool(s.density_settable);
                w.write_i32(s.density);
            }
            ControlMessage::SupportedDeviceStates {
                device_states,
                device_state_id,
            } => {
                w.write_u32(device_states.len() as u32);
                for state in device_states {
                    w.write_i32(state.id);
                    w.write_str(&state.name);
                }
                w.write_i32(device_state_id.wrapping_add(1));
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.serialize(&mut buf);
        buf.freeze()
    }

    /// Decodes exactly one message from `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Self::deserialize(&mut Base128Reader::new(data))
    }

    /// Decodes the next message. One arm per discriminant; anything else is a
    /// fatal format error.
    pub fn deserialize(r: &mut Base128Reader<'_>) -> Result<Self, ProtocolError> {
        use message_type::*;
        let message = match r.read_u32()? {
            MOTION_EVENT => {
                let (count, capacity) = r.read_len()?;
                let mut pointers = Vec::with_capacity(capacity);
                for _ in 0..count {
                    let x = r.read_i32()?;
                    let y = r.read_i32()?;
                    let pointer_id = r.read_i32()?;
                    let (axis_count, capacity) = r.read_len()?;
                    let mut axis_values = Vec::with_capacity(capacity);
                    for _ in 0..axis_count {
                        axis_values.push((r.read_i32()?, r.read_f32()?));
                    }
                    pointers.push(Pointer {
                        x,
                        y,
                        pointer_id,
                        axis_values,
                    });
                }
                ControlMessage::MotionEvent {
                    pointers,
                    action: r.read_i32()?,
                    button_state: r.read_i32()?,
                    action_button: r.read_i32()?,
                    display_id: r.read_i32()?,
                }
            }
            KEY_EVENT => {
                let value = r.read_i32()?;
                let action =
                    KeyAction::from_value(value).ok_or(ProtocolError::UnknownKeyAction(value))?;
                ControlMessage::KeyEvent {
                    action,
                    key_code: r.read_i32()?,
                    meta_state: r.read_i32()?,
                }
            }
            TEXT_INPUT => ControlMessage::TextInput {
                text: r.read_string()?,
            },
            SET_DEVICE_ORIENTATION => ControlMessage::SetDeviceOrientation {
                orientation: r.read_i32()?,
            },
            SET_MAX_VIDEO_RESOLUTION => ControlMessage::SetMaxVideoResolution {
                display_id: r.read_i32()?,
                max_size: read_size(r)?,
            },
            START_VIDEO_STREAM => ControlMessage::StartVideoStream {
                display_id: r.read_i32()?,
                max_size: read_size(r)?,
            },
            STOP_VIDEO_STREAM => ControlMessage::StopVideoStream {
                display_id: r.read_i32()?,
            },
            START_AUDIO_STREAM => ControlMessage::StartAudioStream,
            STOP_AUDIO_STREAM => ControlMessage::StopAudioStream,
            START_CLIPBOARD_SYNC => ControlMessage::StartClipboardSync {
                max_synced_length: r.read_i32()?,
                text: r.read_string()?,
            },
            STOP_CLIPBOARD_SYNC => ControlMessage::StopClipboardSync,
            REQUEST_DEVICE_STATE => ControlMessage::RequestDeviceState {
                device_state_id: r.read_i32()?.wrapping_sub(1),
            },
            DISPLAY_CONFIGURATION_REQUEST => ControlMessage::DisplayConfigurationRequest {
                request_id: r.read_i32()?,
            },
            ERROR_RESPONSE => ControlMessage::ErrorResponse {
                request_id: r.read_i32()?,
                error_message: r.read_string()?,
            },
            DISPLAY_CONFIGURATION_RESPONSE => {
                let request_id = r.read_i32()?;
                let (count, capacity) = r.read_len()?;
                let mut displays = Vec::with_capacity(capacity);
                for _ in 0..count {
                    displays.push(DisplayDescriptor {
                        display_id: r.read_i32()?,
                        size: read_size(r)?,
                        orientation: r.read_i32()?,
                        display_type: DisplayType::from_ordinal(r.read_i32()?),
                    });
                }
                ControlMessage::DisplayConfigurationResponse {
                    request_id,
                    displays,
                }
            }
            CLIPBOARD_CHANGED => ControlMessage::ClipboardChanged {
                text: r.read_string()?,
            },
            SUPPORTED_DEVICE_STATES => {
                let (count, capacity) = r.read_len()?;
                let mut device_states = Vec::with_capacity(capacity);
                for _ in 0..count {
                    device_states.push(DeviceState {
                        id: r.read_i32()?,
                        name: r.read_string()?,
                    });
                }
                ControlMessage::SupportedDeviceStates {
                    device_states,
                    device_state_id: r.read_i32()?.wrapping_sub(1),
                }
            }
            DEVICE_STATE => ControlMessage::DeviceStateChanged {
                device_state_id: r.read_i32()?.wrapping_sub(1),
            },
            DISPLAY_ADDED => ControlMessage::DisplayAdded {
                display_id: r.read_i32()?,
            },
            DISPLAY_REMOVED => ControlMessage::DisplayRemoved {
                display_id: r.read_i32()?,
            },
            UI_SETTINGS_REQUEST => ControlMessage::UiSettingsRequest {
                request_id: r.read_i32()?,
            },
            UI_SETTINGS_RESPONSE => ControlMessage::UiSettingsResponse {
                request_id: r.read_i32()?,
                settings: UiSettings {
                    dark_mode: r.read_bool()?,
                    gesture_overlay_installed: r.read_bool()?,
                    gesture_navigation: r.read_bool()?,
                    foreground_application_id: r.read_string()?,
                    app_locale: r.read_string()?,
                    talk_back_installed: r.read_bool()?,
                    talk_back_on: r.read_bool()?,
                    select_to_speak_on: r.read_bool()?,
                    font_size_settable: r.read_bool()?,
                    font_size: r.read_i32()?,
                    density_settable: r.read_bool()?,
                    density: r.read_i32()?,
                },
            },
            SET_DARK_MODE => ControlMessage::SetDarkMode {
                dark_mode: r.read_bool()?,
            },
            SET_FONT_SIZE => ControlMessage::SetFontSize {
                font_size: r.read_i32()?,
            },
            SET_SCREEN_DENSITY => ControlMessage::SetScreenDensity {
                density: r.read_i32()?,
            },
            SET_TALK_BACK => ControlMessage::SetTalkBack { on: r.read_bool()? },
            SET_SELECT_TO_SPEAK => ControlMessage::SetSelectToSpeak { on: r.read_bool()? },
            SET_APP_LANGUAGE => ControlMessage::SetAppLanguage {
                application_id: r.read_string()?,
                locale: r.read_string()?,
            },
            SET_GESTURE_NAVIGATION => ControlMessage::SetGestureNavigation { on: r.read_bool()? },
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(message)
    }
}

fn read_size(r: &mut Base128Reader<'_>) -> Result<Size, ProtocolError> {
    Ok(Size::new(r.read_i32()?, r.read_i32()?))
}

/// Frames control messages over a byte stream.
///
/// A partially received message leaves the buffer untouched and yields
/// `Ok(None)`; everything else that fails to parse is fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlMessageCodec;

impl Decoder for ControlMessageCodec {
    type Item = ControlMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ControlMessage>, ProtocolError> {
        if src.is_empty() {
            return Ok(None);
        }
        let decoded = {
            let mut reader = Base128Reader::new(&src[..]);
            ControlMessage::deserialize(&mut reader).map(|message| (message, reader.position()))
        };
        match decoded {
            Ok((message, consumed)) => {
                src.advance(consumed);
                Ok(Some(message))
            }
            Err(ProtocolError::Truncated(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Encoder<ControlMessage> for ControlMessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: ControlMessage, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        message.serialize(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_messages() -> Vec<ControlMessage> {
        vec![
            ControlMessage::MotionEvent {
                pointers: vec![
                    Pointer {
                        x: 10,
                        y: 20,
                        pointer_id: 0,
                        axis_values: vec![],
                    },
                    Pointer {
                        x: 300,
                        y: -4,
                        pointer_id: 1,
                        axis_values: vec![(motion::AXIS_VSCROLL, -1.5), (motion::AXIS_HSCROLL, 0.25)],
                    },
                ],
                action: motion::ACTION_POINTER_DOWN | (1 << motion::ACTION_POINTER_INDEX_SHIFT),
                button_state: motion::BUTTON_PRIMARY,
                action_button: 0,
                display_id: 2,
            },
            ControlMessage::KeyEvent {
                action: KeyAction::DownAndUp,
                key_code: 29,
                meta_state: 0x1001,
            },
            ControlMessage::TextInput {
                text: "Привет, world".into(),
            },
            ControlMessage::SetDeviceOrientation { orientation: 3 },
            ControlMessage::SetMaxVideoResolution {
                display_id: 0,
                max_size: Size::new(1080, 1920),
            },
            ControlMessage::StartVideoStream {
                display_id: 5,
                max_size: Size::new(640, 480),
            },
            ControlMessage::StopVideoStream { display_id: 5 },
            ControlMessage::StartAudioStream,
            ControlMessage::StopAudioStream,
            ControlMessage::StartClipboardSync {
                max_synced_length: 5000,
                text: "clip".into(),
            },
            ControlMessage::StopClipboardSync,
            ControlMessage::RequestDeviceState {
                device_state_id: PHYSICAL_DEVICE_STATE,
            },
            ControlMessage::DisplayConfigurationRequest { request_id: 7 },
            ControlMessage::UiSettingsRequest { request_id: 8 },
            ControlMessage::SetDarkMode { dark_mode: true },
            ControlMessage::SetFontSize { font_size: 130 },
            ControlMessage::SetScreenDensity { density: 480 },
            ControlMessage::SetTalkBack { on: true },
            ControlMessage::SetSelectToSpeak { on: false },
            ControlMessage::SetAppLanguage {
                application_id: "com.example.app".into(),
                locale: "fr-CA".into(),
            },
            ControlMessage::SetGestureNavigation { on: true },
            ControlMessage::ErrorResponse {
                request_id: 7,
                error_message: "no such display".into(),
            },
            ControlMessage::DisplayConfigurationResponse {
                request_id: 7,
                displays: vec![
                    DisplayDescriptor {
                        display_id: 0,
                        size: Size::new(1080, 2400),
                        orientation: 0,
                        display_type: DisplayType::Internal,
                    },
                    DisplayDescriptor {
                        display_id: 3,
                        size: Size::new(1920, 1080),
                        orientation: 1,
                        display_type: DisplayType::External,
                    },
                ],
            },
            ControlMessage::UiSettingsResponse {
                request_id: 8,
                settings: UiSettings {
                    dark_mode: true,
                    foreground_application_id: "com.example.app".into(),
                    app_locale: "en-US".into(),
                    font_size: 100,
                    density: 420,
                    ..Default::default()
                },
            },
            ControlMessage::ClipboardChanged {
                text: "copied text".into(),
            },
            ControlMessage::SupportedDeviceStates {
                device_states: vec![
                    DeviceState {
                        id: 0,
                        name: "CLOSE".into(),
                    },
                    DeviceState {
                        id: 3,
                        name: "OPEN".into(),
                    },
                ],
                device_state_id: 3,
            },
            ControlMessage::DeviceStateChanged { device_state_id: 0 },
            ControlMessage::DisplayAdded { display_id: 3 },
            ControlMessage::DisplayRemoved { display_id: 3 },
        ]
    }

    #[test]
    fn test_every_message_survives_the_wire() {
        let messages = all_messages();
        let mut seen_types = std::collections::HashSet::new();
        for message in messages {
            assert!(seen_types.insert(message.message_type()));
            let bytes = message.to_bytes();
            assert_eq!(ControlMessage::from_bytes(&bytes).unwrap(), message);
        }
        assert_eq!(seen_types.len(), 29);
    }

    #[test]
    fn test_unknown_discriminant_is_protocol_error() {
        for bad in [0u32, 30, 127, 10_000] {
            let mut buf = BytesMut::new();
            Base128Writer::new(&mut buf).write_u32(bad);
            buf.extend_from_slice(&[1, 2, 3]);
            match ControlMessage::from_bytes(&buf) {
                Err(ProtocolError::UnknownMessageType(t)) => assert_eq!(t, bad),
                other => panic!("unexpected result {:?}", other),
            }
        }
    }

    #[test]
    fn test_unknown_key_action_rejected() {
        let mut buf = BytesMut::new();
        let mut w = Base128Writer::new(&mut buf);
        w.write_u32(message_type::KEY_EVENT);
        w.write_i32(5);
        w.write_i32(29);
        w.write_i32(0);
        assert!(matches!(
            ControlMessage::from_bytes(&buf),
            Err(ProtocolError::UnknownKeyAction(5))
        ));
    }

    #[test]
    fn test_physical_state_is_one_byte() {
        let bytes = ControlMessage::RequestDeviceState {
            device_state_id: PHYSICAL_DEVICE_STATE,
        }
        .to_bytes();
        assert_eq!(&bytes[..], &[message_type::REQUEST_DEVICE_STATE as u8, 0]);
    }

    #[test]
    fn test_codec_handles_partial_and_back_to_back_messages() {
        let first = ControlMessage::ClipboardChanged {
            text: "a fairly long clipboard string".into(),
        };
        let second = ControlMessage::DisplayAdded { display_id: 4 };
        let mut wire = BytesMut::new();
        first.serialize(&mut wire);
        second.serialize(&mut wire);

        let mut codec = ControlMessageCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);

        buf.extend_from_slice(&wire[10..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_reports_unknown_type() {
        let mut codec = ControlMessageCodec;
        let mut buf = BytesMut::from(&[99u8, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::UnknownMessageType(99))
        ));
    }

    #[test]
    fn test_size_helpers() {
        let a = Size::new(1080, 1920);
        let b = Size::new(1440, 1800);
        assert_eq!(a.max(b), Size::new(1440, 1920));
        assert_eq!(a.rotated_by_quadrants(1), Size::new(1920, 1080));
        assert_eq!(a.rotated_by_quadrants(-2), a);
        assert_eq!(a.to_string(), "1080x1920");
    }
}
