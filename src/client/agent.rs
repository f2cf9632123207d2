//! Starting and watching the on-device agent through adb.

use crate::network::protocol::Size;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub const AGENT_JAR_NAME: &str = "mirror-agent.jar";
const AGENT_MAIN_CLASS: &str = "dev.mirror.agent.Main";
/// Number of agent stderr lines kept for crash reports.
pub const MAX_STDERR_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to run adb: {0}")]
    Io(#[from] std::io::Error),

    #[error("adb {command} failed: {message}")]
    Command { command: String, message: String },
}

/// Diagnostics captured when the agent dies on an online device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTerminationReport {
    pub exit_code: Option<i32>,
    pub run_duration: Duration,
    pub last_errors: Vec<String>,
}

impl fmt::Display for AgentTerminationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "exit code {}", code)?,
            None => write!(f, "killed by signal")?,
        }
        write!(f, " after {:.1}s", self.run_duration.as_secs_f64())?;
        if let Some(last) = self.last_errors.last() {
            write!(f, ", last error: {}", last)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    Normal,
    DeviceOffline,
    Crashed(AgentTerminationReport),
}

/// Copies the agent onto the device before it is started.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentDeployer: Send + Sync {
    async fn deploy(&self) -> Result<(), AgentError>;
}

/// Device-side operations needed to bring up a mirroring session.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Forwards the device socket `socket_name` to `local_port` on the host.
    async fn reverse(&self, socket_name: &str, local_port: u16) -> Result<(), AgentError>;

    async fn remove_reverse(&self, socket_name: &str) -> Result<(), AgentError>;

    async fn device_properties(&self) -> Result<HashMap<String, String>, AgentError>;

    /// Starts the agent. The receiver completes when it exits on its own;
    /// it is dropped without a value when `stop` is cancelled.
    async fn start_agent(
        &self,
        command_line: &str,
        stop: CancellationToken,
    ) -> Result<oneshot::Receiver<AgentExit>, AgentError>;
}

/// Agent invocation flags.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCommand {
    pub device_dir: String,
    pub socket_name: String,
    pub max_size: Option<Size>,
    pub max_bit_rate: i32,
    pub codec: String,
    pub audio: bool,
    pub log_level: String,
}

impl AgentCommand {
    pub fn to_command_line(&self) -> String {
        let dir = self.device_dir.trim_end_matches('/');
        let mut line = format!(
            "CLASSPATH={dir}/{AGENT_JAR_NAME} app_process {dir} {AGENT_MAIN_CLASS} --socket={} --codec={}",
            self.socket_name, self.codec
        );
        if let Some(size) = self.max_size {
            line.push_str(&format!(" --max_size={},{}", size.width, size.height));
        }
        if self.max_bit_rate > 0 {
            line.push_str(&format!(" --max_bit_rate={}", self.max_bit_rate));
        }
        if self.audio {
            line.push_str(" --audio");
        }
        if !self.log_level.is_empty() {
            line.push_str(&format!(" --log={}", self.log_level));
        }
        line
    }
}

/// Ring of the most recent lines.
#[derive(Debug)]
pub struct StderrTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Parses `getprop` output (`[key]: [value]` per line).
pub fn parse_properties(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once("]: [")?;
            let key = key.trim().strip_prefix('[')?;
            let value = value.trim().strip_suffix(']')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// An adb binary bound to one device.
#[derive(Debug, Clone)]
pub struct Adb {
    path: PathBuf,
    serial: Option<String>,
}

impl Adb {
    pub fn new(path: impl Into<PathBuf>, serial: Option<String>) -> Self {
        Self {
            path: path.into(),
            serial,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.path);
        if let Some(serial) = &self.serial {
            command.args(["-s", serial]);
        }
        command
    }

    /// Runs adb to completion and returns its stdout.
    async fn run(&self, args: &[&str]) -> Result<String, AgentError> {
        let output = self.command().args(args).stdin(Stdio::null()).output().await?;
        if !output.status.success() {
            return Err(AgentError::Command {
                command: args.join(" "),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn is_device_online(&self) -> bool {
        matches!(self.run(&["get-state"]).await, Ok(state) if state.trim() == "device")
    }
}

/// Pushes the agent jar into the device directory.
pub struct AdbAgentDeployer {
    adb: Adb,
    local_jar: PathBuf,
    device_dir: String,
}

impl AdbAgentDeployer {
    pub fn new(adb: Adb, local_jar: &Path, device_dir: impl Into<String>) -> Self {
        Self {
            adb,
            local_jar: local_jar.to_path_buf(),
            device_dir: device_dir.into(),
        }
    }
}

#[async_trait]
impl AgentDeployer for AdbAgentDeployer {
    async fn deploy(&self) -> Result<(), AgentError> {
        let target = format!("{}/{}", self.device_dir.trim_end_matches('/'), AGENT_JAR_NAME);
        tracing::info!("Pushing {} to {}", self.local_jar.display(), target);
        let local = self.local_jar.to_string_lossy();
        self.adb.run(&["push", &local, &target]).await?;
        Ok(())
    }
}

pub struct AdbAgentLauncher {
    adb: Adb,
}

impl AdbAgentLauncher {
    pub fn new(adb: Adb) -> Self {
        Self { adb }
    }
}

#[async_trait]
impl AgentLauncher for AdbAgentLauncher {
    async fn reverse(&self, socket_name: &str, local_port: u16) -> Result<(), AgentError> {
        let remote = format!("localabstract:{}", socket_name);
        let local = format!("tcp:{}", local_port);
        self.adb.run(&["reverse", &remote, &local]).await?;
        Ok(())
    }

    async fn remove_reverse(&self, socket_name: &str) -> Result<(), AgentError> {
        let remote = format!("localabstract:{}", socket_name);
        self.adb.run(&["reverse", "--remove", &remote]).await?;
        Ok(())
    }

    async fn device_properties(&self) -> Result<HashMap<String, String>, AgentError> {
        let output = self.adb.run(&["shell", "getprop"]).await?;
        Ok(parse_properties(&output))
    }

    async fn start_agent(
        &self,
        command_line: &str,
        stop: CancellationToken,
    ) -> Result<oneshot::Receiver<AgentExit>, AgentError> {
        tracing::info!("Starting agent: {}", command_line);
        let mut child = self
            .adb
            .command()
            .args(["shell", command_line])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let started = Instant::now();
        let (exit_tx, exit_rx) = oneshot::channel();
        let adb = self.adb.clone();

        let tail = Arc::new(Mutex::new(StderrTail::new(MAX_STDERR_LINES)));
        let stderr_reader = child.stderr.take().map(|stderr| {
            let tail = tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("agent: {}", line);
                    tail.lock().push(line);
                }
            })
        });

        tokio::spawn(async move {
            let status = tokio::select! {
                _ = stop.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill agent: {}", e);
                    }
                    return;
                }
                status = child.wait() => status,
            };
            if let Some(reader) = stderr_reader {
                let _ = reader.await;
            }

            let exit = match status {
                Ok(status) if status.success() => AgentExit::Normal,
                status => {
                    if adb.is_device_online().await {
                        AgentExit::Crashed(AgentTerminationReport {
                            exit_code: status.ok().and_then(|s| s.code()),
                            run_duration: started.elapsed(),
                            last_errors: tail.lock().lines(),
                        })
                    } else {
                        AgentExit::DeviceOffline
                    }
                }
            };
            let _ = exit_tx.send(exit);
        });

        Ok(exit_rx)
    }
}
