use super::agent::{AgentCommand, AgentDeployer, AgentExit, AgentLauncher};
use super::arbiter::{RequesterId, StreamCommand, VideoStreamArbiter};
use super::{ClientError, ClientListener, ClientState};
use crate::audio::{AudioDecoder, AudioFormat, AudioPlayer, AudioSamples, playback_queue};
use crate::codec::{CodecError, CodecFactory};
use crate::config::Config;
use crate::control::{BitRateTracker, DeviceController, DeviceKey, KeyStroke, NotificationListener};
use crate::network::packet::{CODEC_NAME_LENGTH, ChannelRole, parse_codec_name};
use crate::network::protocol::Size;
use crate::network::{ChannelListener, ControlMessage, ProtocolError, SuspendingChannel};
use crate::sync::ListenerSet;
use crate::video::{FrameListener, VideoDecoder, VideoFrame};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// A bit rate the device keeps this long is reported as sustainable.
const STABLE_BIT_RATE_PERIOD: Duration = Duration::from_secs(60);

/// The one connection attempt, running as its own task.
type ConnectAttempt = Shared<BoxFuture<'static, Result<(), ClientError>>>;

struct Session {
    controller: Arc<DeviceController>,
    video: Arc<VideoDecoder>,
    audio: Option<Arc<AudioDecoder>>,
    player: Mutex<Option<AudioPlayer>>,
}

impl Session {
    fn start(&self) {
        self.controller.start();
        self.video.start();
        if let Some(audio) = &self.audio {
            audio.start();
        }
    }

    fn apply(&self, display_id: i32, command: StreamCommand) {
        match command {
            StreamCommand::Start(_) => self.video.enable_decoding(display_id),
            StreamCommand::Stop => self.video.disable_decoding(display_id),
            StreamCommand::Resize(_) => {}
        }
        if let Err(e) = self
            .controller
            .send_control_message(command.to_message(display_id))
        {
            tracing::debug!("Dropped {:?} for display {}: {}", command, display_id, e);
        }
    }

    async fn close(&self) {
        self.controller.dispose().await;
        self.video.dispose().await;
        if let Some(audio) = &self.audio {
            audio.dispose().await;
        }
        let player = self.player.lock().take();
        if let Some(mut player) = player {
            let _ = tokio::task::spawn_blocking(move || player.stop()).await;
        }
    }
}

#[derive(Default)]
struct Streams {
    arbiters: HashMap<i32, VideoStreamArbiter>,
    session: Option<Arc<Session>>,
}

struct AcceptedChannels {
    video: SuspendingChannel,
    control: SuspendingChannel,
    audio: Option<SuspendingChannel>,
}

/// One mirroring session with one device.
pub struct DeviceClient {
    config: Config,
    launcher: Arc<dyn AgentLauncher>,
    deployer: Arc<dyn AgentDeployer>,
    factory: Arc<dyn CodecFactory>,
    tracker: Arc<BitRateTracker>,
    state: watch::Sender<ClientState>,
    connection: Mutex<Option<ConnectAttempt>>,
    streams: Mutex<Streams>,
    frame_listeners: Arc<ListenerSet<dyn FrameListener>>,
    notification_listeners: Arc<ListenerSet<dyn NotificationListener>>,
    client_listeners: ListenerSet<dyn ClientListener>,
    audio_output: Mutex<Option<mpsc::Sender<AudioSamples>>>,
    agent_stop: CancellationToken,
    shutdown: CancellationToken,
    reversed: AtomicBool,
    next_requester: AtomicU64,
    disposed: AtomicBool,
}

impl DeviceClient {
    pub fn new(
        config: Config,
        launcher: Arc<dyn AgentLauncher>,
        deployer: Arc<dyn AgentDeployer>,
        factory: Arc<dyn CodecFactory>,
        tracker: Arc<BitRateTracker>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ClientState::Idle);
        Arc::new(Self {
            config,
            launcher,
            deployer,
            factory,
            tracker,
            state,
            connection: Mutex::new(None),
            streams: Mutex::new(Streams::default()),
            frame_listeners: Arc::new(ListenerSet::new()),
            notification_listeners: Arc::new(ListenerSet::new()),
            client_listeners: ListenerSet::new(),
            audio_output: Mutex::new(None),
            agent_stop: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            reversed: AtomicBool::new(false),
            next_requester: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Sends decoded audio to `output` instead of the default output device.
    /// Takes effect on connection.
    pub fn set_audio_output(&self, output: mpsc::Sender<AudioSamples>) {
        *self.audio_output.lock() = Some(output);
    }

    /// Connects to the device. Only the first call starts an attempt; every
    /// caller gets that attempt's outcome. The attempt runs on its own task,
    /// so callers that stop waiting do not abort it.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        let attempt = self
            .connection
            .lock()
            .get_or_insert_with(|| {
                let client = self.clone();
                let task = tokio::spawn(async move { client.connect_once().await });
                async move {
                    task.await
                        .unwrap_or_else(|e| Err(ClientError::Connection(e.to_string())))
                }
                .boxed()
                .shared()
            })
            .clone();
        attempt.await
    }

    /// Waits for the connection attempt started elsewhere to finish.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut state = self.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            state.wait_for(|s| !matches!(s, ClientState::Idle | ClientState::Connecting)),
        )
        .await;
        match settled {
            Err(_) => Err(ClientError::NotResponding),
            Ok(Err(_)) => Err(ClientError::Disposed),
            Ok(Ok(state)) if *state == ClientState::Connected => Ok(()),
            Ok(Ok(_)) => Err(ClientError::Disconnected),
        }
    }

    async fn connect_once(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }
        self.transition(ClientState::Connecting);

        let timeout = self.config.connect_timeout();
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(ClientError::Disposed),
            result = tokio::time::timeout(timeout, self.establish()) => {
                result.unwrap_or(Err(ClientError::NotResponding))
            }
        };

        match result {
            Ok(session) => {
                if self.activate(session.clone()) {
                    self.transition(ClientState::Connected);
                    tracing::info!("Connected to device");
                    Ok(())
                } else {
                    session.close().await;
                    self.release_agent().await;
                    Err(ClientError::Disposed)
                }
            }
            Err(ClientError::Disposed) => {
                tracing::debug!("Connection attempt abandoned on dispose");
                self.release_agent().await;
                Err(ClientError::Disposed)
            }
            Err(e) => {
                tracing::error!("Failed to connect: {}", e);
                self.release_agent().await;
                self.transition(ClientState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<Arc<Session>, ClientError> {
        self.deployer.deploy().await?;

        let listener = ChannelListener::bind(SocketAddr::new(self.config.connection.host, 0)).await?;
        let port = listener.local_addr()?.port();
        let socket_name = &self.config.connection.socket_name;
        self.launcher.reverse(socket_name, port).await?;
        self.reversed.store(true, Ordering::SeqCst);

        let device_key = match self.launcher.device_properties().await {
            Ok(properties) => DeviceKey::from_properties(&properties),
            Err(e) => {
                tracing::warn!("Failed to read device properties: {}", e);
                DeviceKey::from_properties(&HashMap::new())
            }
        };
        let command = self.agent_command(&device_key);
        let exit = self
            .launcher
            .start_agent(&command.to_command_line(), self.agent_stop.clone())
            .await?;
        self.watch_agent(exit);

        let channels = accept_channels(&listener, self.config.audio.enabled).await;
        listener.close();
        let channels = channels?;

        let mut name = [0u8; CODEC_NAME_LENGTH];
        channels.video.read_fully(&mut name, None).await?;
        let codec_name = parse_codec_name(&name)?;
        tracing::info!("Video codec: {}", codec_name);

        let controller = Arc::new(DeviceController::new(
            Arc::new(channels.control),
            self.notification_listeners.clone(),
        ));
        let video = Arc::new(VideoDecoder::new(
            Arc::new(channels.video),
            codec_name,
            self.factory.clone(),
        ));
        video.add_frame_listener(Arc::new(FrameBridge {
            listeners: self.frame_listeners.clone(),
            feedback: BitRateFeedback::new(
                self.tracker.clone(),
                device_key,
                self.config.storage.bit_rate_table.clone(),
                STABLE_BIT_RATE_PERIOD,
            ),
        }));

        let (audio, player) = match channels.audio {
            Some(channel) => {
                let (output, player) = self.open_audio_output().await;
                let format = AudioFormat {
                    codec_name: self.config.audio.codec.clone(),
                    sample_rate: self.config.audio.sample_rate,
                    channels: self.config.audio.channels,
                };
                let decoder = AudioDecoder::new(Arc::new(channel), format, self.factory.clone(), output);
                (Some(Arc::new(decoder)), player)
            }
            None => (None, None),
        };

        let session = Arc::new(Session {
            controller,
            video,
            audio,
            player: Mutex::new(player),
        });
        session.start();
        Ok(session)
    }

    fn agent_command(&self, device_key: &DeviceKey) -> AgentCommand {
        let configured = self.config.video.bit_rate;
        let learned = self.tracker.bit_rate(device_key);
        let max_bit_rate = if learned > 0 {
            tracing::info!("Using learned bit rate {} for {}", learned, device_key);
            learned.min(configured)
        } else {
            configured
        };
        AgentCommand {
            device_dir: self.config.agent.device_dir.clone(),
            socket_name: self.config.connection.socket_name.clone(),
            max_size: self.config.video.max_size,
            max_bit_rate,
            codec: self.config.video.codec.clone(),
            audio: self.config.audio.enabled,
            log_level: self.config.agent.log_level.clone(),
        }
    }

    async fn open_audio_output(&self) -> (mpsc::Sender<AudioSamples>, Option<AudioPlayer>) {
        let output = self.audio_output.lock().take();
        if let Some(output) = output {
            return (output, None);
        }
        let (tx, rx) = playback_queue(self.config.audio.queue_capacity);
        let (sample_rate, channels) = (self.config.audio.sample_rate, self.config.audio.channels);
        match tokio::task::spawn_blocking(move || AudioPlayer::start(sample_rate, channels, rx)).await {
            Ok(Ok(player)) => (tx, Some(player)),
            Ok(Err(e)) => {
                tracing::warn!("Audio playback unavailable: {:#}", e);
                (tx, None)
            }
            Err(e) => {
                tracing::warn!("Audio playback unavailable: {}", e);
                (tx, None)
            }
        }
    }

    /// Publishes the session and replays stream requests made so far.
    /// Returns false when the client was disposed in the meantime.
    fn activate(&self, session: Arc<Session>) -> bool {
        let mut streams = self.streams.lock();
        if self.is_disposed() {
            return false;
        }
        for (&display_id, arbiter) in &streams.arbiters {
            if let Some(command) = arbiter.replay() {
                session.apply(display_id, command);
            }
        }
        streams.session = Some(session);
        true
    }

    fn watch_agent(self: &Arc<Self>, exit: oneshot::Receiver<AgentExit>) {
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            // No value means the agent was stopped by us.
            let Ok(exit) = exit.await else {
                return;
            };
            if let Some(client) = Weak::upgrade(&client) {
                client.on_agent_exit(exit);
            }
        });
    }

    fn on_agent_exit(&self, exit: AgentExit) {
        if self.is_disposed() {
            return;
        }
        match exit {
            AgentExit::Normal => {
                tracing::info!("Agent exited");
                self.transition(ClientState::Disconnected);
            }
            AgentExit::DeviceOffline => {
                tracing::debug!("Device went offline");
                self.transition(ClientState::Disconnected);
            }
            AgentExit::Crashed(report) => {
                tracing::error!("Agent terminated: {}", report);
                for line in &report.last_errors {
                    tracing::error!("agent: {}", line);
                }
                self.client_listeners
                    .for_each(|l| l.on_agent_terminated(&report));
                self.transition(ClientState::Terminated);
            }
        }
    }

    fn transition(&self, to: ClientState) {
        let changed = self.state.send_if_modified(|state| {
            if state.is_final() || *state == to {
                return false;
            }
            *state = to;
            true
        });
        if changed {
            tracing::debug!("Client state: {:?}", to);
            self.client_listeners.for_each(|l| l.on_state_changed(to));
        }
    }

    async fn release_agent(&self) {
        self.agent_stop.cancel();
        if self.reversed.swap(false, Ordering::SeqCst) {
            let socket_name = &self.config.connection.socket_name;
            if let Err(e) = self.launcher.remove_reverse(socket_name).await {
                tracing::debug!("Failed to remove reverse forward: {}", e);
            }
        }
    }

    /// Allocates an identity for a consumer of video streams.
    pub fn new_requester(&self) -> RequesterId {
        RequesterId(self.next_requester.fetch_add(1, Ordering::Relaxed))
    }

    pub fn start_video_stream(
        &self,
        requester: RequesterId,
        display_id: i32,
        max_size: Size,
    ) -> Result<(), ClientError> {
        self.update_stream(display_id, |arbiter| arbiter.start(requester, max_size))
    }

    pub fn stop_video_stream(&self, requester: RequesterId, display_id: i32) -> Result<(), ClientError> {
        self.update_stream(display_id, |arbiter| arbiter.stop(requester))
    }

    pub fn set_max_video_resolution(
        &self,
        requester: RequesterId,
        display_id: i32,
        max_size: Size,
    ) -> Result<(), ClientError> {
        self.update_stream(display_id, |arbiter| arbiter.set_max_size(requester, max_size))
    }

    fn update_stream(
        &self,
        display_id: i32,
        update: impl FnOnce(&mut VideoStreamArbiter) -> Option<StreamCommand>,
    ) -> Result<(), ClientError> {
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }
        let mut streams = self.streams.lock();
        let Streams { arbiters, session } = &mut *streams;
        let arbiter = arbiters.entry(display_id).or_default();
        let command = update(arbiter);
        if !arbiter.is_on() {
            arbiters.remove(&display_id);
        }
        if let (Some(command), Some(session)) = (command, session.as_ref()) {
            session.apply(display_id, command);
        }
        Ok(())
    }

    fn session(&self) -> Result<Arc<Session>, ClientError> {
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }
        self.streams
            .lock()
            .session
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    pub fn send_control_message(&self, message: ControlMessage) -> Result<(), ClientError> {
        self.session()?
            .controller
            .send_control_message(message)
            .map_err(|_| ClientError::Disconnected)
    }

    pub fn send_key_stroke(&self, stroke: KeyStroke) -> Result<(), ClientError> {
        self.session()?
            .controller
            .send_key_stroke(stroke)
            .map_err(|_| ClientError::Disconnected)
    }

    /// The device controller, once connected.
    pub fn controller(&self) -> Option<Arc<DeviceController>> {
        self.session().ok().map(|s| s.controller.clone())
    }

    /// A copy of the latest frame of `display_id`.
    pub fn current_frame(&self, display_id: i32) -> Option<VideoFrame> {
        self.session().ok()?.video.current_frame(display_id)
    }

    /// Runs `f` on the latest frame of `display_id` without copying it. The
    /// decoder cannot publish a new frame for that display until `f` returns.
    pub fn with_current_frame<R>(&self, display_id: i32, f: impl FnOnce(&VideoFrame) -> R) -> Option<R> {
        self.session().ok()?.video.with_current_frame(display_id, f)
    }

    pub fn add_frame_listener(&self, listener: Arc<dyn FrameListener>) {
        self.frame_listeners.add(listener);
    }

    pub fn remove_frame_listener(&self, listener: &Arc<dyn FrameListener>) {
        self.frame_listeners.remove(listener);
    }

    pub fn add_notification_listener(&self, listener: Arc<dyn NotificationListener>) {
        self.notification_listeners.add(listener);
    }

    pub fn remove_notification_listener(&self, listener: &Arc<dyn NotificationListener>) {
        self.notification_listeners.remove(listener);
    }

    pub fn add_client_listener(&self, listener: Arc<dyn ClientListener>) {
        self.client_listeners.add(listener);
    }

    pub fn remove_client_listener(&self, listener: &Arc<dyn ClientListener>) {
        self.client_listeners.remove(listener);
    }

    /// Tears down the session, the reverse forward and the agent. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let session = {
            let mut streams = self.streams.lock();
            streams.arbiters.clear();
            streams.session.take()
        };
        if let Some(session) = session {
            session.close().await;
        }
        self.release_agent().await;
        self.transition(ClientState::Disconnected);
        self.frame_listeners.clear();
        self.notification_listeners.clear();
        self.client_listeners.clear();
        tracing::info!("Device client disposed");
    }
}

/// Accepts the agent's connections and sorts them by their marker byte.
/// Markers are read concurrently so one slow connection cannot hold up the
/// others.
async fn accept_channels(
    listener: &ChannelListener,
    audio: bool,
) -> Result<AcceptedChannels, ClientError> {
    let count = if audio { 3 } else { 2 };
    let mut accepted = Vec::with_capacity(count);
    for _ in 0..count {
        accepted.push(listener.accept(None).await?);
    }

    let identified = futures::future::try_join_all(accepted.into_iter().map(identify)).await?;
    let mut roles: HashMap<ChannelRole, SuspendingChannel> = HashMap::new();
    for (role, channel) in identified {
        if roles.insert(role, channel).is_some() {
            return Err(ClientError::Protocol(format!("Duplicate {:?} channel", role)));
        }
    }

    let missing = |role| ClientError::Protocol(format!("Missing {:?} channel", role));
    let video = roles
        .remove(&ChannelRole::Video)
        .ok_or_else(|| missing(ChannelRole::Video))?;
    let control = roles
        .remove(&ChannelRole::Control)
        .ok_or_else(|| missing(ChannelRole::Control))?;
    let audio_channel = roles.remove(&ChannelRole::Audio);
    if audio && audio_channel.is_none() {
        return Err(missing(ChannelRole::Audio));
    }
    Ok(AcceptedChannels {
        video,
        control,
        audio: audio_channel,
    })
}

async fn identify(channel: SuspendingChannel) -> Result<(ChannelRole, SuspendingChannel), ProtocolError> {
    let mut marker = [0u8; 1];
    channel.read_fully(&mut marker, None).await?;
    Ok((ChannelRole::from_marker(marker[0])?, channel))
}

/// Forwards decoder events to the client's frame listeners and feeds the
/// bit rate tracker.
struct FrameBridge {
    listeners: Arc<ListenerSet<dyn FrameListener>>,
    feedback: BitRateFeedback,
}

impl FrameListener for FrameBridge {
    fn on_new_frame_available(&self, display_id: i32, frame_number: u32) {
        self.listeners
            .for_each(|l| l.on_new_frame_available(display_id, frame_number));
    }

    fn on_end_of_video_stream(&self, display_id: i32) {
        self.listeners
            .for_each(|l| l.on_end_of_video_stream(display_id));
    }

    fn on_invalid_frame(&self, display_id: i32, error: &CodecError) {
        self.listeners
            .for_each(|l| l.on_invalid_frame(display_id, error));
    }

    fn on_bit_rate(&self, display_id: i32, bit_rate: i32, reduced: bool) {
        self.feedback.observe(display_id, bit_rate, reduced);
        self.listeners
            .for_each(|l| l.on_bit_rate(display_id, bit_rate, reduced));
    }
}

struct ObservedBitRate {
    bit_rate: i32,
    since: Instant,
    reported_stable: bool,
}

#[derive(Debug, PartialEq)]
enum BitRateReport {
    Reduced,
    Stable,
}

/// Turns the bit rates seen in video packets into tracker reports: a change
/// flagged as a reduction is reported once, a bit rate held for the stable
/// period is reported once.
struct BitRateFeedback {
    tracker: Arc<BitRateTracker>,
    key: DeviceKey,
    table: Option<PathBuf>,
    stable_period: Duration,
    displays: Mutex<HashMap<i32, ObservedBitRate>>,
}

impl BitRateFeedback {
    fn new(
        tracker: Arc<BitRateTracker>,
        key: DeviceKey,
        table: Option<PathBuf>,
        stable_period: Duration,
    ) -> Self {
        Self {
            tracker,
            key,
            table,
            stable_period,
            displays: Mutex::new(HashMap::new()),
        }
    }

    fn observe(&self, display_id: i32, bit_rate: i32, reduced: bool) {
        if bit_rate <= 0 {
            return;
        }
        let now = Instant::now();
        let report = {
            let mut displays = self.displays.lock();
            match displays.get_mut(&display_id) {
                Some(observed) if observed.bit_rate == bit_rate => {
                    if !observed.reported_stable
                        && now.duration_since(observed.since) >= self.stable_period
                    {
                        observed.reported_stable = true;
                        Some(BitRateReport::Stable)
                    } else {
                        None
                    }
                }
                _ => {
                    displays.insert(
                        display_id,
                        ObservedBitRate {
                            bit_rate,
                            since: now,
                            reported_stable: false,
                        },
                    );
                    reduced.then_some(BitRateReport::Reduced)
                }
            }
        };

        match report {
            Some(BitRateReport::Reduced) => {
                tracing::info!("Device {} reduced bit rate to {}", self.key, bit_rate);
                self.tracker.reduced(&self.key, bit_rate);
            }
            Some(BitRateReport::Stable) => {
                tracing::debug!("Bit rate {} stable on {}", bit_rate, self.key);
                self.tracker.stable(&self.key, bit_rate);
            }
            None => return,
        }
        self.persist();
    }

    fn persist(&self) {
        let Some(path) = self.table.clone() else {
            return;
        };
        let tracker = self.tracker.clone();
        let save = move || {
            if let Err(e) = tracker.save(&path) {
                tracing::warn!("Failed to save bit rate table: {:#}", e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(save);
            }
            Err(_) => save(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioCodec;
    use crate::client::agent::{AgentError, AgentTerminationReport, MockAgentDeployer};
    use crate::network::packet::{
        AUDIO_CHANNEL_MARKER, CONTROL_CHANNEL_MARKER, VIDEO_CHANNEL_MARKER, codec_name_block,
    };
    use crate::network::ControlMessageCodec;
    use crate::network::packet::VideoPacketHeader;
    use crate::video::VideoCodec;
    use crate::video::decoder::MockVideoCodec;
    use crate::video::frame::DecodedPicture;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_util::codec::Decoder;

    struct NoCodecs;

    impl CodecFactory for NoCodecs {
        fn create_video_codec(&self, codec_name: &str) -> Result<Box<dyn VideoCodec>, CodecError> {
            Err(CodecError::Unsupported(codec_name.to_string()))
        }

        fn create_audio_codec(
            &self,
            codec_name: &str,
            _sample_rate: u32,
            _channels: u16,
        ) -> Result<Box<dyn AudioCodec>, CodecError> {
            Err(CodecError::Unsupported(codec_name.to_string()))
        }
    }

    /// Decodes every packet into a small white picture.
    struct WhitePictures;

    impl CodecFactory for WhitePictures {
        fn create_video_codec(&self, _codec_name: &str) -> Result<Box<dyn VideoCodec>, CodecError> {
            let mut codec = MockVideoCodec::new();
            codec.expect_decode().returning(|_| {
                Ok(Some(DecodedPicture {
                    width: 4,
                    height: 8,
                    rgba: vec![255; 4 * 8 * 4],
                }))
            });
            Ok(Box::new(codec))
        }

        fn create_audio_codec(
            &self,
            codec_name: &str,
            _sample_rate: u32,
            _channels: u16,
        ) -> Result<Box<dyn AudioCodec>, CodecError> {
            Err(CodecError::Unsupported(codec_name.to_string()))
        }
    }

    /// Plays the device: connects agent sockets in the given marker order.
    struct FakeDevice {
        markers: Vec<u8>,
        port: Mutex<Option<u16>>,
        command_line: Mutex<Option<String>>,
        sockets: tokio::sync::Mutex<Vec<(u8, TcpStream)>>,
        exit: Mutex<Option<oneshot::Sender<AgentExit>>>,
        stop: Mutex<Option<CancellationToken>>,
        starts: AtomicUsize,
        reverse_removed: AtomicBool,
    }

    impl FakeDevice {
        fn new(markers: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                markers: markers.to_vec(),
                port: Mutex::new(None),
                command_line: Mutex::new(None),
                sockets: tokio::sync::Mutex::new(Vec::new()),
                exit: Mutex::new(None),
                stop: Mutex::new(None),
                starts: AtomicUsize::new(0),
                reverse_removed: AtomicBool::new(false),
            })
        }

        async fn socket(&self, marker: u8) -> TcpStream {
            let mut sockets = self.sockets.lock().await;
            let index = sockets
                .iter()
                .position(|(m, _)| *m == marker)
                .unwrap();
            sockets.remove(index).1
        }

        fn exit_agent(&self, exit: AgentExit) {
            let sender = self.exit.lock().take().unwrap();
            sender.send(exit).unwrap();
        }
    }

    #[async_trait]
    impl AgentLauncher for FakeDevice {
        async fn reverse(&self, _socket_name: &str, local_port: u16) -> Result<(), AgentError> {
            *self.port.lock() = Some(local_port);
            Ok(())
        }

        async fn remove_reverse(&self, _socket_name: &str) -> Result<(), AgentError> {
            self.reverse_removed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn device_properties(&self) -> Result<HashMap<String, String>, AgentError> {
            Ok(HashMap::from([
                ("ro.product.manufacturer".to_string(), "Google".to_string()),
                ("ro.product.model".to_string(), "Pixel 7".to_string()),
                ("ro.product.cpu.abi".to_string(), "arm64-v8a".to_string()),
                ("ro.build.version.sdk".to_string(), "34".to_string()),
            ]))
        }

        async fn start_agent(
            &self,
            command_line: &str,
            stop: CancellationToken,
        ) -> Result<oneshot::Receiver<AgentExit>, AgentError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.command_line.lock() = Some(command_line.to_string());
            *self.stop.lock() = Some(stop);
            let (tx, rx) = oneshot::channel();
            *self.exit.lock() = Some(tx);

            let port = *self.port.lock();
            let port = port.unwrap();
            let mut sockets = self.sockets.lock().await;
            for &marker in &self.markers {
                let mut socket = TcpStream::connect(("127.0.0.1", port)).await?;
                socket.write_all(&[marker]).await?;
                if marker == VIDEO_CHANNEL_MARKER {
                    socket.write_all(&codec_name_block("avc")).await?;
                }
                sockets.push((marker, socket));
            }
            Ok(rx)
        }
    }

    fn deployer() -> Arc<MockAgentDeployer> {
        let mut deployer = MockAgentDeployer::new();
        deployer.expect_deploy().times(1).returning(|| Ok(()));
        Arc::new(deployer)
    }

    fn client_with(device: &Arc<FakeDevice>, config: Config, tracker: Arc<BitRateTracker>) -> Arc<DeviceClient> {
        DeviceClient::new(config, device.clone(), deployer(), Arc::new(NoCodecs), tracker)
    }

    fn client(device: &Arc<FakeDevice>) -> Arc<DeviceClient> {
        client_with(device, Config::default(), Arc::new(BitRateTracker::new()))
    }

    async fn read_messages(socket: &mut TcpStream, count: usize) -> Vec<ControlMessage> {
        let mut codec = ControlMessageCodec;
        let mut buf = BytesMut::new();
        let mut messages = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            while let Some(m) = codec.decode(&mut buf).unwrap() {
                messages.push(m);
            }
            if messages.len() >= count {
                return messages;
            }
            let n = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut chunk))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0);
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[derive(Default)]
    struct StateLog {
        states: Mutex<Vec<ClientState>>,
        reports: Mutex<Vec<AgentTerminationReport>>,
    }

    impl ClientListener for StateLog {
        fn on_state_changed(&self, state: ClientState) {
            self.states.lock().push(state);
        }

        fn on_agent_terminated(&self, report: &AgentTerminationReport) {
            self.reports.lock().push(report.clone());
        }
    }

    async fn wait_for_state(client: &DeviceClient, state: ClientState) {
        let mut rx = client.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_channels_are_identified_by_marker() {
        let device = FakeDevice::new(&[CONTROL_CHANNEL_MARKER, VIDEO_CHANNEL_MARKER]);
        let client = client(&device);
        let log = Arc::new(StateLog::default());
        client.add_client_listener(log.clone());

        client.connect().await.unwrap();
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(
            *log.states.lock(),
            vec![ClientState::Connecting, ClientState::Connected]
        );
        let command_line = device.command_line.lock().clone().unwrap();
        assert!(command_line.contains("--codec=avc"));
        assert!(command_line.contains("--max_bit_rate=8000000"));

        client
            .send_control_message(ControlMessage::TextInput { text: "hi".into() })
            .unwrap();
        let mut control = device.socket(CONTROL_CHANNEL_MARKER).await;
        assert_eq!(
            read_messages(&mut control, 1).await,
            vec![ControlMessage::TextInput { text: "hi".into() }]
        );
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_audio_channel_joins_when_enabled() {
        let device = FakeDevice::new(&[AUDIO_CHANNEL_MARKER, VIDEO_CHANNEL_MARKER, CONTROL_CHANNEL_MARKER]);
        let mut config = Config::default();
        config.audio.enabled = true;
        let client = client_with(&device, config, Arc::new(BitRateTracker::new()));
        let (tx, _rx) = playback_queue(4);
        client.set_audio_output(tx);

        client.connect().await.unwrap();
        assert!(device.command_line.lock().clone().unwrap().contains("--audio"));
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let device = FakeDevice::new(&[VIDEO_CHANNEL_MARKER, CONTROL_CHANNEL_MARKER]);
        let client = client(&device);

        let (first, second, waited) = tokio::join!(
            client.connect(),
            client.connect(),
            client.wait_until_connected(Duration::from_secs(2))
        );
        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert_eq!(waited, Ok(()));
        assert_eq!(device.starts.load(Ordering::SeqCst), 1);
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_abandoned_connect_keeps_the_attempt_running() {
        let device = FakeDevice::new(&[CONTROL_CHANNEL_MARKER]);
        let mut config = Config::default();
        config.connection.connect_timeout_ms = 300;
        let client = client_with(&device, config, Arc::new(BitRateTracker::new()));

        let gave_up = tokio::time::timeout(Duration::from_millis(50), client.connect()).await;
        assert!(gave_up.is_err());
        assert_eq!(client.connect().await, Err(ClientError::NotResponding));
        assert_eq!(device.starts.load(Ordering::SeqCst), 1);
        assert!(device.stop.lock().as_ref().unwrap().is_cancelled());
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_fails_a_pending_connect_promptly() {
        let device = FakeDevice::new(&[CONTROL_CHANNEL_MARKER]);
        let client = client(&device);
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.connect().await }
        });
        tokio::time::timeout(Duration::from_secs(2), async {
            while device.starts.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        client.dispose().await;
        let result = tokio::time::timeout(Duration::from_millis(100), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ClientError::Disposed));
        let again = tokio::time::timeout(Duration::from_millis(100), client.connect())
            .await
            .unwrap();
        assert_eq!(again, Err(ClientError::Disposed));
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(device.reverse_removed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_silent_agent_is_not_responding() {
        let device = FakeDevice::new(&[CONTROL_CHANNEL_MARKER]);
        let mut config = Config::default();
        config.connection.connect_timeout_ms = 200;
        let client = client_with(&device, config, Arc::new(BitRateTracker::new()));

        assert_eq!(client.connect().await, Err(ClientError::NotResponding));
        assert_eq!(client.connect().await, Err(ClientError::NotResponding));
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(device.reverse_removed.load(Ordering::SeqCst));
        assert!(device.stop.lock().as_ref().unwrap().is_cancelled());
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_stream_requests_are_replayed_once_connected() {
        let device = FakeDevice::new(&[VIDEO_CHANNEL_MARKER, CONTROL_CHANNEL_MARKER]);
        let client = client(&device);
        let a = client.new_requester();
        let b = client.new_requester();
        client.start_video_stream(a, 0, Size::new(1080, 1920)).unwrap();
        client.start_video_stream(b, 0, Size::new(1440, 2560)).unwrap();
        assert_eq!(client.send_control_message(ControlMessage::StopClipboardSync), Err(ClientError::NotConnected));

        client.connect().await.unwrap();
        client.stop_video_stream(b, 0).unwrap();
        client.stop_video_stream(a, 0).unwrap();

        let mut control = device.socket(CONTROL_CHANNEL_MARKER).await;
        assert_eq!(
            read_messages(&mut control, 3).await,
            vec![
                ControlMessage::StartVideoStream {
                    display_id: 0,
                    max_size: Size::new(1440, 2560)
                },
                ControlMessage::SetMaxVideoResolution {
                    display_id: 0,
                    max_size: Size::new(1080, 1920)
                },
                ControlMessage::StopVideoStream { display_id: 0 },
            ]
        );
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_learned_bit_rate_caps_agent_bit_rate() {
        let device = FakeDevice::new(&[VIDEO_CHANNEL_MARKER, CONTROL_CHANNEL_MARKER]);
        let tracker = Arc::new(BitRateTracker::new());
        let key = DeviceKey::new("Google", "Pixel 7", "arm64-v8a", 34);
        for _ in 0..5 {
            tracker.reduced(&key, 2_000_000);
        }
        assert_eq!(tracker.bit_rate(&key), 2_000_000);

        let client = client_with(&device, Config::default(), tracker);
        client.connect().await.unwrap();
        let command_line = device.command_line.lock().clone().unwrap();
        assert!(command_line.contains("--max_bit_rate=2000000"));
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_agent_crash_is_reported() {
        let device = FakeDevice::new(&[VIDEO_CHANNEL_MARKER, CONTROL_CHANNEL_MARKER]);
        let client = client(&device);
        let log = Arc::new(StateLog::default());
        client.add_client_listener(log.clone());
        client.connect().await.unwrap();

        let report = AgentTerminationReport {
            exit_code: Some(134),
            run_duration: Duration::from_secs(3),
            last_errors: vec!["Aborted".into()],
        };
        device.exit_agent(AgentExit::Crashed(report.clone()));
        wait_for_state(&client, ClientState::Terminated).await;
        assert_eq!(*log.reports.lock(), vec![report]);
        client.dispose().await;
        assert_eq!(client.state(), ClientState::Terminated);
    }

    #[tokio::test]
    async fn test_device_offline_is_silent() {
        let device = FakeDevice::new(&[VIDEO_CHANNEL_MARKER, CONTROL_CHANNEL_MARKER]);
        let client = client(&device);
        let log = Arc::new(StateLog::default());
        client.add_client_listener(log.clone());
        client.connect().await.unwrap();

        device.exit_agent(AgentExit::DeviceOffline);
        wait_for_state(&client, ClientState::Disconnected).await;
        assert!(log.reports.lock().is_empty());
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let device = FakeDevice::new(&[VIDEO_CHANNEL_MARKER, CONTROL_CHANNEL_MARKER]);
        let client = client(&device);
        client.connect().await.unwrap();
        let mut control = device.socket(CONTROL_CHANNEL_MARKER).await;

        client.dispose().await;
        client.dispose().await;
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(device.reverse_removed.load(Ordering::SeqCst));
        assert!(device.stop.lock().as_ref().unwrap().is_cancelled());
        assert_eq!(
            client.send_control_message(ControlMessage::StopClipboardSync),
            Err(ClientError::Disposed)
        );
        assert!(client.current_frame(0).is_none());

        let mut rest = Vec::new();
        control.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_current_frame_is_readable_in_place() {
        let device = FakeDevice::new(&[VIDEO_CHANNEL_MARKER, CONTROL_CHANNEL_MARKER]);
        let client = DeviceClient::new(
            Config::default(),
            device.clone(),
            deployer(),
            Arc::new(WhitePictures),
            Arc::new(BitRateTracker::new()),
        );
        let requester = client.new_requester();
        client.start_video_stream(requester, 0, Size::default()).unwrap();
        client.connect().await.unwrap();
        assert_eq!(client.with_current_frame(0, |f| f.frame_number), None);

        let header = VideoPacketHeader {
            display_id: 0,
            width: 4,
            height: 8,
            frame_number: 1,
            presentation_timestamp_us: 1000,
            packet_size: 3,
            bit_rate: 2_000_000,
            ..Default::default()
        };
        let mut packet = BytesMut::new();
        header.write_to(&mut packet);
        packet.extend_from_slice(b"IDR");
        let mut video = device.socket(VIDEO_CHANNEL_MARKER).await;
        video.write_all(&packet).await.unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(seen) = client.with_current_frame(0, |f| (f.frame_number, f.pixels.len())) {
                    return seen;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(seen, (1, 4 * 8 * 4));
        assert_eq!(client.current_frame(0).map(|f| f.frame_number), Some(1));
        client.dispose().await;
    }

    #[test]
    fn test_bit_rate_feedback_reports_each_reduction_once() {
        let tracker = Arc::new(BitRateTracker::new());
        let key = DeviceKey::new("Google", "Pixel 7", "arm64-v8a", 34);
        let feedback =
            BitRateFeedback::new(tracker.clone(), key.clone(), None, Duration::from_secs(3600));

        for _ in 0..4 {
            feedback.observe(0, 4_000_000, true);
            feedback.observe(0, 4_000_000, true);
            feedback.observe(0, 5_000_000, false);
        }
        assert_eq!(tracker.bit_rate(&key), 0);
        feedback.observe(0, 4_000_000, true);
        assert_eq!(tracker.bit_rate(&key), 4_000_000);
    }

    #[test]
    fn test_unflagged_changes_are_not_reductions() {
        let tracker = Arc::new(BitRateTracker::new());
        let key = DeviceKey::new("a", "b", "c", 30);
        let feedback = BitRateFeedback::new(tracker.clone(), key.clone(), None, Duration::from_secs(3600));
        for rate in [1_000_000, 2_000_000, 1_000_000] {
            feedback.observe(0, rate, false);
        }
        assert!(tracker.is_empty());
    }
}
