//! Video channel pipeline: reads packets, decodes them per display and
//! publishes the resulting frames.

use super::decoder::VideoCodec;
use super::frame::{VideoFrame, compose_frame};
use crate::codec::{CodecError, CodecFactory, EncodedPacket, PacketAccumulator};
use crate::network::{ProtocolError, SuspendingChannel, VideoPacketHeader};
use crate::sync::ListenerSet;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Receives video pipeline events. Called on the pipeline task; keep it short.
pub trait FrameListener: Send + Sync {
    fn on_new_frame_available(&self, display_id: i32, frame_number: u32);

    /// The display stopped producing frames, either because the channel
    /// ended or because its decoder could not be created.
    fn on_end_of_video_stream(&self, display_id: i32) {
        let _ = display_id;
    }

    /// One packet could not be decoded. Later packets are still processed.
    fn on_invalid_frame(&self, display_id: i32, error: &CodecError) {
        let _ = (display_id, error);
    }

    /// Bit rate carried by every data packet.
    fn on_bit_rate(&self, display_id: i32, bit_rate: i32, reduced: bool) {
        let _ = (display_id, bit_rate, reduced);
    }
}

struct DecodingState {
    codec: Option<Box<dyn VideoCodec>>,
    accumulator: PacketAccumulator,
}

/// Decoding context of one display.
pub struct DisplayDecoder {
    display_id: i32,
    state: Mutex<DecodingState>,
    frame: Mutex<Option<VideoFrame>>,
    listeners: Arc<ListenerSet<dyn FrameListener>>,
}

impl DisplayDecoder {
    fn new(display_id: i32, listeners: Arc<ListenerSet<dyn FrameListener>>) -> Self {
        Self {
            display_id,
            state: Mutex::new(DecodingState {
                codec: None,
                accumulator: PacketAccumulator::new(),
            }),
            frame: Mutex::new(None),
            listeners,
        }
    }

    pub fn display_id(&self) -> i32 {
        self.display_id
    }

    /// Handles one packet. Only codec creation failures are returned; a
    /// rejected packet is reported to listeners instead.
    fn process(
        &self,
        header: &VideoPacketHeader,
        payload: Bytes,
        factory: &dyn CodecFactory,
        codec_name: &str,
    ) -> Result<(), CodecError> {
        let mut state = self.state.lock();
        if header.is_config() {
            state.accumulator.push_config(&payload);
            return Ok(());
        }

        let packet = EncodedPacket {
            data: state.accumulator.merge(payload),
            presentation_timestamp_us: header.presentation_timestamp_us,
        };
        let mut codec = match state.codec.take() {
            Some(codec) => codec,
            None => factory.create_video_codec(codec_name)?,
        };
        let result = codec.decode(&packet);
        state.codec = Some(codec);
        drop(state);

        match result {
            Ok(Some(picture)) => {
                compose_frame(&mut self.frame.lock(), &picture, header);
                self.listeners
                    .for_each(|l| l.on_new_frame_available(self.display_id, header.frame_number));
            }
            Ok(None) => {}
            Err(e) if e.is_recoverable() => {
                tracing::warn!("Display {}: {}", self.display_id, e);
                self.listeners
                    .for_each(|l| l.on_invalid_frame(self.display_id, &e));
            }
            Err(e) => return Err(e),
        }
        self.listeners.for_each(|l| {
            l.on_bit_rate(self.display_id, header.bit_rate, header.is_bit_rate_reduced())
        });
        Ok(())
    }

    fn take_codec(&self) -> Option<Box<dyn VideoCodec>> {
        let mut state = self.state.lock();
        state.accumulator.clear();
        state.codec.take()
    }
}

/// Frees codec resources away from the calling thread when a runtime is
/// available.
fn release_codecs(codecs: Vec<Box<dyn VideoCodec>>) {
    if codecs.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || drop(codecs));
        }
        Err(_) => drop(codecs),
    }
}

/// Decodes the video channel of one device.
pub struct VideoDecoder {
    channel: Arc<SuspendingChannel>,
    codec_name: String,
    factory: Arc<dyn CodecFactory>,
    displays: RwLock<HashMap<i32, Arc<DisplayDecoder>>>,
    listeners: Arc<ListenerSet<dyn FrameListener>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VideoDecoder {
    pub fn new(
        channel: Arc<SuspendingChannel>,
        codec_name: impl Into<String>,
        factory: Arc<dyn CodecFactory>,
    ) -> Self {
        Self {
            channel,
            codec_name: codec_name.into(),
            factory,
            displays: RwLock::new(HashMap::new()),
            listeners: Arc::new(ListenerSet::new()),
            task: Mutex::new(None),
        }
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn add_frame_listener(&self, listener: Arc<dyn FrameListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_frame_listener(&self, listener: &Arc<dyn FrameListener>) {
        self.listeners.remove(listener);
    }

    /// Starts decoding packets of `display_id`. Packets of displays without
    /// a decoding context are read and discarded.
    pub fn enable_decoding(&self, display_id: i32) {
        let mut displays = self.displays.write();
        displays.entry(display_id).or_insert_with(|| {
            tracing::debug!("Decoding enabled for display {}", display_id);
            Arc::new(DisplayDecoder::new(display_id, self.listeners.clone()))
        });
    }

    pub fn disable_decoding(&self, display_id: i32) {
        let removed = self.displays.write().remove(&display_id);
        if let Some(display) = removed {
            tracing::debug!("Decoding disabled for display {}", display_id);
            release_codecs(display.take_codec().into_iter().collect());
        }
    }

    pub fn is_decoding(&self, display_id: i32) -> bool {
        self.displays.read().contains_key(&display_id)
    }

    /// Copy of the latest frame of `display_id`.
    pub fn current_frame(&self, display_id: i32) -> Option<VideoFrame> {
        self.with_current_frame(display_id, VideoFrame::clone)
    }

    /// Runs `f` on the latest frame while holding the display's frame lock.
    pub fn with_current_frame<R>(&self, display_id: i32, f: impl FnOnce(&VideoFrame) -> R) -> Option<R> {
        let display = self.displays.read().get(&display_id).cloned()?;
        let frame = display.frame.lock();
        frame.as_ref().map(f)
    }

    /// Spawns the pipeline task. Calling it again has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let this = self.clone();
        *task = Some(tokio::spawn(async move {
            match this.run().await {
                Ok(()) => {}
                Err(e) if e.is_lost_connection() => {
                    tracing::info!("Video stream from {} ended", this.channel.peer_addr())
                }
                Err(e) => tracing::error!("Video stream failed: {}", e),
            }
            this.end_all_displays();
        }));
    }

    async fn run(&self) -> Result<(), ProtocolError> {
        let mut raw = [0u8; VideoPacketHeader::SIZE];
        loop {
            self.channel.read_fully(&mut raw, None).await?;
            let header = VideoPacketHeader::parse(&raw);
            header.validate()?;

            let mut payload = vec![0u8; header.payload_len()];
            self.channel.read_fully(&mut payload, None).await?;

            let display = self.displays.read().get(&header.display_id).cloned();
            let Some(display) = display else {
                tracing::trace!("Skipping packet of display {}", header.display_id);
                continue;
            };
            if let Err(e) = display.process(
                &header,
                Bytes::from(payload),
                self.factory.as_ref(),
                &self.codec_name,
            ) {
                tracing::error!("Display {}: {}", header.display_id, e);
                self.disable_decoding(header.display_id);
                self.listeners
                    .for_each(|l| l.on_end_of_video_stream(header.display_id));
            }
        }
    }

    fn end_all_displays(&self) {
        let displays: Vec<_> = self.displays.write().drain().map(|(_, d)| d).collect();
        let mut codecs = Vec::new();
        for display in &displays {
            codecs.extend(display.take_codec());
            self.listeners
                .for_each(|l| l.on_end_of_video_stream(display.display_id));
        }
        release_codecs(codecs);
    }

    /// Stops the pipeline and frees all decoding contexts. Idempotent.
    pub async fn dispose(&self) {
        self.channel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!("Video pipeline task failed: {}", e);
                }
            }
        }
        self.channel.close().await;
        self.end_all_displays();
        self.listeners.clear();
    }
}
