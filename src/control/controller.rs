use crate::control::keys::KeyStroke;
use crate::network::protocol::{DeviceState, DisplayDescriptor, UiSettings};
use crate::network::{ControlMessage, ControlMessageCodec, ProtocolError, SuspendingChannel};
use crate::sync::ListenerSet;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;

/// How long disposal waits for queued messages to be written.
const DISPOSE_GRACE_PERIOD: Duration = Duration::from_secs(2);
const READ_CHUNK_SIZE: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("Device controller is closed")]
    Closed,

    #[error("No response from device within {0:?}")]
    Timeout(Duration),

    #[error("Device reported an error: {0}")]
    Device(String),

    #[error("Unexpected response of type {0}")]
    UnexpectedResponse(u32),
}

/// Device-to-host notifications. Called on the controller's reader task.
pub trait NotificationListener: Send + Sync {
    fn on_clipboard_changed(&self, text: &str) {
        let _ = text;
    }

    fn on_supported_device_states_changed(&self, states: &[DeviceState], current_state_id: i32) {
        let _ = (states, current_state_id);
    }

    fn on_device_state_changed(&self, device_state_id: i32) {
        let _ = device_state_id;
    }

    fn on_display_added(&self, display_id: i32) {
        let _ = display_id;
    }

    fn on_display_removed(&self, display_id: i32) {
        let _ = display_id;
    }

    /// The control channel failed with something other than a disconnect.
    fn on_controller_error(&self, error: &ProtocolError) {
        let _ = error;
    }
}

/// Sends control messages to the device and dispatches its notifications.
pub struct DeviceController {
    channel: Arc<SuspendingChannel>,
    sender: Mutex<Option<mpsc::UnboundedSender<ControlMessage>>>,
    queue: Mutex<Option<mpsc::UnboundedReceiver<ControlMessage>>>,
    listeners: Arc<ListenerSet<dyn NotificationListener>>,
    pending: Mutex<HashMap<i32, oneshot::Sender<ControlMessage>>>,
    next_request_id: AtomicI32,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl DeviceController {
    pub fn new(
        channel: Arc<SuspendingChannel>,
        listeners: Arc<ListenerSet<dyn NotificationListener>>,
    ) -> Self {
        let (sender, queue) = mpsc::unbounded_channel();
        Self {
            channel,
            sender: Mutex::new(Some(sender)),
            queue: Mutex::new(Some(queue)),
            listeners,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicI32::new(1),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Starts the writer and reader tasks. Messages queued earlier are sent
    /// first.
    pub fn start(self: &Arc<Self>) {
        let Some(queue) = self.queue.lock().take() else {
            return;
        };

        let this = self.clone();
        *self.writer.lock() = Some(tokio::spawn(async move {
            this.write_loop(queue).await;
        }));

        let this = self.clone();
        *self.reader.lock() = Some(tokio::spawn(async move {
            match this.read_loop().await {
                Ok(()) => {}
                Err(e) if e.is_lost_connection() => {
                    tracing::debug!("Control channel closed")
                }
                Err(e) => {
                    tracing::error!("Control channel failed: {}", e);
                    this.listeners.for_each(|l| l.on_controller_error(&e));
                }
            }
            // Wakes up requests still waiting for an answer.
            this.pending.lock().clear();
        }));
    }

    /// Queues `message`. Messages are written in the order they are queued.
    pub fn send_control_message(&self, message: ControlMessage) -> Result<(), ControllerError> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(ControllerError::Closed)?;
        sender.send(message).map_err(|_| ControllerError::Closed)
    }

    /// Queues the key events making up `stroke`.
    pub fn send_key_stroke(&self, stroke: KeyStroke) -> Result<(), ControllerError> {
        for message in stroke.to_messages() {
            self.send_control_message(message)?;
        }
        Ok(())
    }

    pub async fn request_display_configuration(
        &self,
        timeout: Duration,
    ) -> Result<Vec<DisplayDescriptor>, ControllerError> {
        let response = self
            .request(
                |request_id| ControlMessage::DisplayConfigurationRequest { request_id },
                timeout,
            )
            .await?;
        match response {
            ControlMessage::DisplayConfigurationResponse { displays, .. } => Ok(displays),
            other => Err(ControllerError::UnexpectedResponse(other.message_type())),
        }
    }

    pub async fn request_ui_settings(&self, timeout: Duration) -> Result<UiSettings, ControllerError> {
        let response = self
            .request(
                |request_id| ControlMessage::UiSettingsRequest { request_id },
                timeout,
            )
            .await?;
        match response {
            ControlMessage::UiSettingsResponse { settings, .. } => Ok(settings),
            other => Err(ControllerError::UnexpectedResponse(other.message_type())),
        }
    }

    async fn request(
        &self,
        make_request: impl FnOnce(i32) -> ControlMessage,
        timeout: Duration,
    ) -> Result<ControlMessage, ControllerError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        if let Err(e) = self.send_control_message(make_request(request_id)) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(ControllerError::Timeout(timeout))
            }
            Ok(Err(_)) => Err(ControllerError::Closed),
            Ok(Ok(ControlMessage::ErrorResponse { error_message, .. })) => {
                Err(ControllerError::Device(error_message))
            }
            Ok(Ok(response)) => Ok(response),
        }
    }

    async fn write_loop(&self, mut queue: mpsc::UnboundedReceiver<ControlMessage>) {
        let mut buf = BytesMut::with_capacity(256);
        while let Some(message) = queue.recv().await {
            buf.clear();
            message.serialize(&mut buf);
            if let Err(e) = self.channel.write_fully(&buf, None).await {
                if e.is_lost_connection() {
                    tracing::debug!("Control channel closed while sending");
                } else {
                    tracing::error!("Failed to send control message: {}", e);
                    let e = ProtocolError::from(e);
                    self.listeners.for_each(|l| l.on_controller_error(&e));
                }
                return;
            }
            tracing::trace!("Sent control message {}", message.message_type());
        }
    }

    async fn read_loop(&self) -> Result<(), ProtocolError> {
        let mut codec = ControlMessageCodec;
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            while let Some(message) = codec.decode(&mut buf)? {
                self.dispatch(message);
            }
            let n = self.channel.read(&mut chunk, None).await?;
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn dispatch(&self, message: ControlMessage) {
        if message.is_response() {
            let Some(request_id) = message.request_id() else {
                return;
            };
            match self.pending.lock().remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(message);
                }
                None => tracing::debug!("Response to unknown request {}", request_id),
            }
            return;
        }

        match message {
            ControlMessage::ClipboardChanged { text } => {
                self.listeners.for_each(|l| l.on_clipboard_changed(&text))
            }
            ControlMessage::SupportedDeviceStates {
                device_states,
                device_state_id,
            } => self
                .listeners
                .for_each(|l| l.on_supported_device_states_changed(&device_states, device_state_id)),
            ControlMessage::DeviceStateChanged { device_state_id } => self
                .listeners
                .for_each(|l| l.on_device_state_changed(device_state_id)),
            ControlMessage::DisplayAdded { display_id } => {
                self.listeners.for_each(|l| l.on_display_added(display_id))
            }
            ControlMessage::DisplayRemoved { display_id } => {
                self.listeners.for_each(|l| l.on_display_removed(display_id))
            }
            other => tracing::warn!(
                "Ignoring unexpected control message of type {}",
                other.message_type()
            ),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Flushes queued messages for up to two seconds, then closes the
    /// channel. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender lets the writer finish once the queue is empty.
        self.sender.lock().take();
        self.queue.lock().take();

        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(DISPOSE_GRACE_PERIOD, &mut writer)
                .await
                .is_err()
            {
                tracing::warn!("Control messages still pending after {:?}", DISPOSE_GRACE_PERIOD);
                writer.abort();
            }
        }

        self.channel.close().await;
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
        self.pending.lock().clear();
        self.listeners.clear();
    }
}
