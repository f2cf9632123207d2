use crate::audio::decoder::AudioSamples;
use anyhow::{Context, Result, anyhow};
use cpal::{
    SampleRate, StreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Creates the bounded queue between the audio pipeline and the player.
/// The pipeline suspends when the queue is full.
pub fn playback_queue(capacity: usize) -> (mpsc::Sender<AudioSamples>, mpsc::Receiver<AudioSamples>) {
    mpsc::channel(capacity.max(1))
}

/// Pulls queued samples into the device buffer, padding with silence on
/// underrun.
pub struct SampleFeeder {
    queue: mpsc::Receiver<AudioSamples>,
    current: Vec<f32>,
    position: usize,
    underruns: u64,
}

impl SampleFeeder {
    pub fn new(queue: mpsc::Receiver<AudioSamples>) -> Self {
        Self {
            queue,
            current: Vec::new(),
            position: 0,
            underruns: 0,
        }
    }

    pub fn fill(&mut self, out: &mut [f32]) {
        let mut written = 0;
        while written < out.len() {
            if self.position >= self.current.len() {
                match self.queue.try_recv() {
                    Ok(next) => {
                        self.current = next.samples;
                        self.position = 0;
                        continue;
                    }
                    Err(_) => {
                        out[written..].fill(0.0);
                        self.underruns += 1;
                        return;
                    }
                }
            }
            let n = (self.current.len() - self.position).min(out.len() - written);
            out[written..written + n]
                .copy_from_slice(&self.current[self.position..self.position + n]);
            self.position += n;
            written += n;
        }
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }
}

/// Plays queued samples on the default output device.
///
/// cpal streams are not `Send` on every platform, so the stream lives on its
/// own thread for the lifetime of the player.
pub struct AudioPlayer {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioPlayer {
    /// Opens the output device and starts consuming `queue`.
    pub fn start(sample_rate: u32, channels: u16, queue: mpsc::Receiver<AudioSamples>) -> Result<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                let stream = match Self::open_stream(sample_rate, channels, queue) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns when the player is stopped or dropped.
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("Audio playback stopped");
            })
            .context("Failed to spawn audio thread")?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("Audio thread exited during startup"))??;

        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn open_stream(
        sample_rate: u32,
        channels: u16,
        queue: mpsc::Receiver<AudioSamples>,
    ) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("No audio output device available")?;

        tracing::info!(
            "Using audio device: {}",
            device.name().unwrap_or("Unknown".to_string())
        );

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let mut feeder = SampleFeeder::new(queue);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| feeder.fill(data),
                |err| {
                    tracing::error!("Audio stream error: {}", err);
                },
                None,
            )
            .context("Failed to build audio output stream")?;

        stream.play().context("Failed to start audio stream")?;
        Ok(stream)
    }

    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Audio thread panicked");
            }
        }
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}
