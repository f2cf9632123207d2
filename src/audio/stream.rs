use super::decoder::{AudioCodec, AudioSamples};
use crate::codec::{CodecError, CodecFactory, EncodedPacket, PacketAccumulator, PipelineError};
use crate::network::{AudioPacketHeader, SuspendingChannel};
use crate::sync::ListenerSet;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub trait AudioStreamListener: Send + Sync {
    fn on_end_of_audio_stream(&self) {}

    fn on_invalid_audio_packet(&self, error: &CodecError) {
        let _ = error;
    }
}

#[derive(Debug, Clone)]
pub struct AudioFormat {
    pub codec_name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

struct DecodingState {
    codec: Option<Box<dyn AudioCodec>>,
    accumulator: PacketAccumulator,
}

/// Decodes the audio channel into the playback queue.
pub struct AudioDecoder {
    channel: Arc<SuspendingChannel>,
    format: AudioFormat,
    factory: Arc<dyn CodecFactory>,
    state: Mutex<DecodingState>,
    output: mpsc::Sender<AudioSamples>,
    listeners: ListenerSet<dyn AudioStreamListener>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AudioDecoder {
    pub fn new(
        channel: Arc<SuspendingChannel>,
        format: AudioFormat,
        factory: Arc<dyn CodecFactory>,
        output: mpsc::Sender<AudioSamples>,
    ) -> Self {
        Self {
            channel,
            format,
            factory,
            state: Mutex::new(DecodingState {
                codec: None,
                accumulator: PacketAccumulator::new(),
            }),
            output,
            listeners: ListenerSet::new(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn AudioStreamListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn AudioStreamListener>) {
        self.listeners.remove(listener);
    }

    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let this = self.clone();
        *task = Some(tokio::spawn(async move {
            match this.run().await {
                Ok(()) => {}
                Err(e) if e.is_lost_connection() => tracing::info!("Audio stream ended"),
                Err(e) => tracing::error!("Audio stream failed: {}", e),
            }
            this.release_codec();
            this.listeners.for_each(|l| l.on_end_of_audio_stream());
        }));
    }

    async fn run(&self) -> Result<(), PipelineError> {
        let mut raw = [0u8; AudioPacketHeader::SIZE];
        loop {
            self.channel.read_fully(&mut raw, None).await?;
            let header = AudioPacketHeader::parse(&raw)?;
            let mut payload = vec![0u8; header.packet_size];
            self.channel.read_fully(&mut payload, None).await?;

            let samples = match self.decode(&header, Bytes::from(payload)) {
                Ok(Some(samples)) => samples,
                Ok(None) => continue,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("Audio packet rejected: {}", e);
                    self.listeners.for_each(|l| l.on_invalid_audio_packet(&e));
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            // Suspends while the playback queue is full.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                sent = self.output.send(samples) => {
                    if sent.is_err() {
                        tracing::debug!("Audio playback queue closed");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn decode(&self, header: &AudioPacketHeader, payload: Bytes) -> Result<Option<AudioSamples>, CodecError> {
        let mut state = self.state.lock();
        if header.is_config {
            state.accumulator.push_config(&payload);
            return Ok(None);
        }
        let packet = EncodedPacket {
            data: state.accumulator.merge(payload),
            presentation_timestamp_us: 0,
        };
        let mut codec = match state.codec.take() {
            Some(codec) => codec,
            None => self.factory.create_audio_codec(
                &self.format.codec_name,
                self.format.sample_rate,
                self.format.channels,
            )?,
        };
        let result = codec.decode(&packet);
        state.codec = Some(codec);
        result
    }

    fn release_codec(&self) {
        let codec = {
            let mut state = self.state.lock();
            state.accumulator.clear();
            state.codec.take()
        };
        if let Some(codec) = codec {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || drop(codec));
                }
                Err(_) => drop(codec),
            }
        }
    }

    /// Stops the pipeline. Idempotent.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        self.channel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Audio pipeline task failed: {}", e);
            }
        }
        self.channel.close().await;
        self.release_codec();
        self.listeners.clear();
    }
}
