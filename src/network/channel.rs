use super::{NetworkError, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Absolute deadline shared by all iterations of a `*_fully` loop.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    fn after(timeout: Option<Duration>) -> Option<Self> {
        timeout.map(|timeout| Self {
            at: Instant::now() + timeout,
            timeout,
        })
    }
}

/// Byte channel over a TCP socket where every operation is a cancellable
/// suspension point.
///
/// Reads and writes use independent halves, so one task may sit in a read loop
/// while another writes. [`cancel`](Self::cancel) fails every in-flight and
/// future operation with [`NetworkError::Closed`].
pub struct SuspendingChannel {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
    peer_addr: SocketAddr,
}

impl SuspendingChannel {
    /// Connects to `addr`, failing with [`NetworkError::Timeout`] after `timeout`.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout(timeout))??;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        // Control messages are tiny, don't let Nagle hold them back
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            cancel: CancellationToken::new(),
            peer_addr,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Reads at least one byte into `buf` and returns the count.
    pub async fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = Deadline::after(timeout);
        let mut reader = self.acquire(&self.reader).await?;
        self.read_some(&mut reader, buf, deadline).await
    }

    /// Fills `buf` completely. On failure the bytes received so far stay in
    /// `buf`; the deadline covers the whole operation, not each read.
    pub async fn read_fully(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::after(timeout);
        let mut reader = self.acquire(&self.reader).await?;
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read_some(&mut reader, &mut buf[filled..], deadline).await?;
        }
        Ok(())
    }

    /// Writes some of `buf` and returns the count.
    pub async fn write(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = Deadline::after(timeout);
        let mut writer = self.acquire(&self.writer).await?;
        self.suspend(writer.write(buf), deadline).await
    }

    /// Writes all of `buf` under a single deadline.
    pub async fn write_fully(&self, buf: &[u8], timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::after(timeout);
        let mut writer = self.acquire(&self.writer).await?;
        let mut written = 0;
        while written < buf.len() {
            let n = self.suspend(writer.write(&buf[written..]), deadline).await?;
            if n == 0 {
                return Err(NetworkError::EndOfStream);
            }
            written += n;
        }
        Ok(())
    }

    /// Fails all pending and future operations without waiting for them.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels pending operations and shuts down the write side so the peer
    /// observes end of stream. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Shutdown of channel to {} failed: {}", self.peer_addr, e);
        }
    }

    async fn read_some(
        &self,
        reader: &mut OwnedReadHalf,
        buf: &mut [u8],
        deadline: Option<Deadline>,
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.suspend(reader.read(buf), deadline).await? {
            0 => Err(NetworkError::EndOfStream),
            n => Ok(n),
        }
    }

    async fn acquire<'a, T>(&self, mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NetworkError::Closed),
            guard = mutex.lock() => Ok(guard),
        }
    }

    /// Races `op` against cancellation and the optional deadline.
    async fn suspend<T, F>(&self, op: F, deadline: Option<Deadline>) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(NetworkError::Closed);
        }
        let bounded = async {
            match deadline {
                Some(d) => tokio::time::timeout_at(d.at, op)
                    .await
                    .map_err(|_| NetworkError::Timeout(d.timeout))?
                    .map_err(NetworkError::from),
                None => op.await.map_err(NetworkError::from),
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NetworkError::Closed),
            result = bounded => result,
        }
    }
}

impl std::fmt::Debug for SuspendingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendingChannel")
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Listening side: accepts inbound connections as [`SuspendingChannel`]s.
pub struct ChannelListener {
    listener: TcpListener,
    cancel: CancellationToken,
}

impl ChannelListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self, timeout: Option<Duration>) -> Result<SuspendingChannel> {
        if self.cancel.is_cancelled() {
            return Err(NetworkError::Closed);
        }
        let accept = async {
            let (stream, addr) = match timeout {
                Some(t) => tokio::time::timeout(t, self.listener.accept())
                    .await
                    .map_err(|_| NetworkError::Timeout(t))??,
                None => self.listener.accept().await?,
            };
            tracing::debug!("Accepted connection from {}", addr);
            SuspendingChannel::from_stream(stream)
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NetworkError::Closed),
            result = accept => result,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}
