use anyhow::{Context, Result};
use clap::Parser;
use device_mirror::{
    assets::Assets,
    client::{Adb, AdbAgentDeployer, AdbAgentLauncher, AgentTerminationReport, ClientListener, ClientState, DeviceClient},
    codec::{self, CodecError, FfmpegCodecFactory},
    config::Config,
    control::{BitRateTracker, NotificationListener},
    logging,
    network::protocol::Size,
    video::FrameListener,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

/// Mirrors a device's primary display and audio
#[derive(Parser, Debug, Clone)]
#[command(name = "device-mirror")]
#[command(about = "Device mirroring over adb", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device serial
    #[arg(short, long)]
    serial: Option<String>,

    /// adb binary
    #[arg(long)]
    adb: Option<PathBuf>,

    /// Max video size, e.g. 1080x1920
    #[arg(long, value_parser = parse_size)]
    max_size: Option<Size>,

    /// Initial video bit rate in bps
    #[arg(short, long)]
    bit_rate: Option<i32>,

    /// Video codec (avc, hevc, vp8, vp9, av1)
    #[arg(long)]
    codec: Option<String>,

    /// Stream device audio
    #[arg(long, default_value_t = false)]
    audio: bool,

    /// File the learned bit rates are kept in
    #[arg(long)]
    bit_rate_table: Option<PathBuf>,

    /// Default log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(serial) = &self.serial {
            config.connection.serial = Some(serial.clone());
        }
        if let Some(adb) = &self.adb {
            config.connection.adb_path = Some(adb.clone());
        }
        if let Some(max_size) = self.max_size {
            config.video.max_size = Some(max_size);
        }
        if let Some(bit_rate) = self.bit_rate {
            config.video.bit_rate = bit_rate;
        }
        if let Some(codec) = &self.codec {
            config.video.codec = codec.clone();
        }
        if self.audio {
            config.audio.enabled = true;
        }
        if let Some(table) = &self.bit_rate_table {
            config.storage.bit_rate_table = Some(table.clone());
        }
    }
}

fn parse_size(s: &str) -> Result<Size, String> {
    let (width, height) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {}", s))?;
    let width = width.trim().parse().map_err(|e| format!("bad width: {}", e))?;
    let height = height.trim().parse().map_err(|e| format!("bad height: {}", e))?;
    Ok(Size::new(width, height))
}

#[derive(Default)]
struct FrameLogger {
    frames: AtomicU64,
}

impl FrameListener for FrameLogger {
    fn on_new_frame_available(&self, display_id: i32, frame_number: u32) {
        if self.frames.fetch_add(1, Ordering::Relaxed) == 0 {
            info!("First frame of display {} (#{})", display_id, frame_number);
        }
    }

    fn on_end_of_video_stream(&self, display_id: i32) {
        info!(
            "Video stream of display {} ended after {} frames",
            display_id,
            self.frames.load(Ordering::Relaxed)
        );
    }

    fn on_invalid_frame(&self, display_id: i32, error: &CodecError) {
        warn!("Display {}: {}", display_id, error);
    }
}

struct EventLogger;

impl NotificationListener for EventLogger {
    fn on_clipboard_changed(&self, text: &str) {
        info!("Device clipboard changed ({} chars)", text.chars().count());
    }

    fn on_display_added(&self, display_id: i32) {
        info!("Display {} added", display_id);
    }

    fn on_display_removed(&self, display_id: i32) {
        info!("Display {} removed", display_id);
    }

    fn on_device_state_changed(&self, device_state_id: i32) {
        info!("Device state {}", device_state_id);
    }
}

impl ClientListener for EventLogger {
    fn on_agent_terminated(&self, report: &AgentTerminationReport) {
        error!("Agent terminated: {}", report);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);

    codec::ffmpeg::init()?;
    let adb_path = Assets::get_adb_path(config.connection.adb_path.as_deref())?;
    let jar = Assets::get_agent_path(config.agent.jar_path.as_deref())?;
    let adb = Adb::new(adb_path, config.connection.serial.clone());

    let tracker = Arc::new(match &config.storage.bit_rate_table {
        Some(path) => BitRateTracker::load(path)?,
        None => BitRateTracker::new(),
    });

    info!("Starting device-mirror");
    let client = DeviceClient::new(
        config.clone(),
        Arc::new(AdbAgentLauncher::new(adb.clone())),
        Arc::new(AdbAgentDeployer::new(adb, &jar, config.agent.device_dir.clone())),
        Arc::new(FfmpegCodecFactory),
        tracker.clone(),
    );
    let events = Arc::new(EventLogger);
    client.add_frame_listener(Arc::new(FrameLogger::default()));
    client.add_notification_listener(events.clone());
    client.add_client_listener(events);

    // 0x0 leaves the resolution to the device.
    let requester = client.new_requester();
    client.start_video_stream(requester, 0, config.video.max_size.unwrap_or_default())?;
    client.connect().await.context("Failed to connect to device")?;

    let mut state = client.subscribe_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = state.wait_for(|s| s.is_final()) => {
            if client.state() == ClientState::Terminated {
                warn!("Session terminated by the agent");
            }
        }
    }

    client.dispose().await;
    if let Some(path) = &config.storage.bit_rate_table {
        tracker
            .save(path)
            .with_context(|| format!("Failed to save {}", path.display()))?;
    }
    Ok(())
}
