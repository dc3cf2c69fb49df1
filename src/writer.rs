//! Dedicated writer task for the transport.
//!
//! Every frame leaving the host goes through one task that owns the write
//! half of the transport. Callers hand it encoded frames over an mpsc channel,
//! so no lock is held around the serial port and frames queued together are
//! written in a single vectored call.
//!
//! # Architecture
//!
//! ```text
//! request 1 ─┐
//! request 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► serial port
//! ping      ─┘
//! ```
//!
//! The channel is bounded: when the port drains slower than requests are
//! produced, `send` waits for room.

use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Mup1Error, Result};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default time to wait for room in the channel.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// An encoded frame ready to be written.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub bytes: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for room in the queue.
    pub send_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    timeout: Duration,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<OutboundFrame>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }

    /// Queue a frame, waiting for room up to the configured timeout.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Mup1Error::ConnectionClosed),
            Err(_) => Err(Mup1Error::BackpressureTimeout),
        }
    }

    /// True once the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends with `Ok(())` when every handle is dropped, or with the
/// first write error.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let handle = WriterHandle::new(tx, config.send_timeout);
    let task = tokio::spawn(writer_loop(rx, writer));
    (handle, task)
}

/// Receive frames and write them, batching whatever is already queued.
async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while let Some(first) = rx.recv().await {
        batch.clear();
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!("serial write failed: {}", e);
            return Err(e);
        }
        tracing::trace!("wrote {} frame(s)", batch.len());
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames with vectored writes, resuming after partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(Mup1Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.size();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.bytes[start..]));
        }
        offset = end;
    }

    slices
}
