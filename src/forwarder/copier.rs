//! Unidirectional stream copy with idle-timeout resets and transfer telemetry.
//!
//! # Responsibilities
//! - Copy one byte stream into another, one bounded buffer at a time
//! - Classify the outcome by the side that failed (input, output, canceled)
//! - Enforce a promised length when the source declared one
//! - Keep the activity timer alive while bytes move
//!
//! # Design Decisions
//! - A zero-length read probes for data before a buffer is held, so idle
//!   connections (websockets, long polls) do not pin 64 KiB each
//! - Buffers come from a shared pool and go back when the guard drops
//! - Cancellation is raced against every I/O call; a cancelled copy returns
//!   promptly even when the peer never reads or writes again

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::forwarder::activity::ActivityToken;
use crate::observability::telemetry::{ForwarderTelemetry, TransferSample, TRANSFERRING_INTERVAL};

/// Size of every copy buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

const MAX_POOLED_BUFFERS: usize = 256;

/// How a copy ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCopyOutcome {
    Success,
    /// Reading the source failed, or the source broke its promised length.
    InputError,
    /// Writing or flushing the destination failed.
    OutputError,
    Canceled,
}

/// Outcome of a copy, the error behind it and the bytes moved.
#[derive(Debug, Clone)]
pub struct StreamCopyResult {
    pub outcome: StreamCopyOutcome,
    pub error: Option<Arc<io::Error>>,
    pub bytes: u64,
}

impl StreamCopyResult {
    fn success(bytes: u64) -> Self {
        Self {
            outcome: StreamCopyOutcome::Success,
            error: None,
            bytes,
        }
    }

    fn failed(outcome: StreamCopyOutcome, error: io::Error, bytes: u64) -> Self {
        Self {
            outcome,
            error: Some(Arc::new(error)),
            bytes,
        }
    }

    pub(crate) fn canceled(bytes: u64) -> Self {
        Self::failed(
            StreamCopyOutcome::Canceled,
            io::Error::new(io::ErrorKind::Interrupted, "copy canceled"),
            bytes,
        )
    }

    pub fn is_success(&self) -> bool {
        self.outcome == StreamCopyOutcome::Success
    }
}

/// Pool of fixed-size copy buffers.
pub struct BufferPool {
    buffers: Mutex<Vec<Box<[u8]>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::new()),
            buffer_size,
        })
    }

    pub fn rent(self: &Arc<Self>) -> PooledBuffer {
        let buffer = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());
        PooledBuffer {
            buffer: Some(buffer),
            pool: self.clone(),
        }
    }

    /// Buffers currently available for rent.
    pub fn available(&self) -> usize {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A rented buffer; returned to its pool on drop.
pub struct PooledBuffer {
    buffer: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let mut buffers = self.pool.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            if buffers.len() < MAX_POOLED_BUFFERS {
                buffers.push(buffer);
            }
        }
    }
}

/// Copies streams for the forwarder. Cheap to clone.
#[derive(Clone)]
pub struct StreamCopier {
    buffers: Arc<BufferPool>,
    telemetry: Arc<dyn ForwarderTelemetry>,
}

impl StreamCopier {
    pub fn new(telemetry: Arc<dyn ForwarderTelemetry>) -> Self {
        Self::with_buffers(BufferPool::new(DEFAULT_BUFFER_SIZE), telemetry)
    }

    pub fn with_buffers(buffers: Arc<BufferPool>, telemetry: Arc<dyn ForwarderTelemetry>) -> Self {
        Self { buffers, telemetry }
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    pub fn telemetry(&self) -> &Arc<dyn ForwarderTelemetry> {
        &self.telemetry
    }

    /// Copy `source` into `destination` until end of stream, failure or cancellation.
    ///
    /// `promised_length` is the length the source declared, if any. `auto_flush`
    /// flushes the destination after every write. The activity timer is reset after
    /// every read and write that makes progress.
    pub async fn copy<R, W>(
        &self,
        is_request: bool,
        source: &mut R,
        destination: &mut W,
        promised_length: Option<u64>,
        activity: &ActivityToken,
        auto_flush: bool,
    ) -> StreamCopyResult
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let token = activity.token().clone();
        let mut telemetry = TransferTelemetry::start(is_request, self.telemetry.as_ref());
        let mut buffer = Some(self.buffers.rent());
        let mut total: u64 = 0;

        let result = loop {
            // Wait for data without holding a buffer.
            let mut empty = [0u8; 0];
            let probe = {
                let probe = source.read(&mut empty);
                tokio::pin!(probe);
                match probe.as_mut().now_or_never() {
                    Some(result) => result,
                    None => {
                        buffer = None;
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break StreamCopyResult::canceled(total),
                            result = probe => result,
                        }
                    }
                }
            };
            if let Err(error) = probe {
                break StreamCopyResult::failed(StreamCopyOutcome::InputError, error, total);
            }

            let buf = buffer.get_or_insert_with(|| self.buffers.rent());
            let read = tokio::select! {
                biased;
                _ = token.cancelled() => break StreamCopyResult::canceled(total),
                read = source.read(buf) => read,
            };
            let read = match read {
                Ok(read) => read,
                Err(error) => break StreamCopyResult::failed(StreamCopyOutcome::InputError, error, total),
            };

            if read == 0 {
                break match promised_length {
                    Some(promised) if promised != total => StreamCopyResult::failed(
                        StreamCopyOutcome::InputError,
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("sent {total} bytes, fewer than the promised {promised}"),
                        ),
                        total,
                    ),
                    _ => StreamCopyResult::success(total),
                };
            }

            total += read as u64;
            activity.reset_timeout();
            telemetry.after_read(total);

            if let Some(promised) = promised_length {
                if total > promised {
                    break StreamCopyResult::failed(
                        StreamCopyOutcome::InputError,
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("received more bytes than the promised {promised}"),
                        ),
                        total,
                    );
                }
            }

            let written = tokio::select! {
                biased;
                _ = token.cancelled() => break StreamCopyResult::canceled(total),
                written = write_chunk(destination, &buf[..read], auto_flush) => written,
            };
            if let Err(error) = written {
                break StreamCopyResult::failed(StreamCopyOutcome::OutputError, error, total);
            }

            activity.reset_timeout();
            telemetry.after_write();
        };

        telemetry.finish();
        result
    }
}

async fn write_chunk<W>(destination: &mut W, chunk: &[u8], flush: bool) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    destination.write_all(chunk).await?;
    if flush {
        destination.flush().await?;
    }
    Ok(())
}

/// Accumulates timings for one copy and reports them to the sink.
struct TransferTelemetry<'a> {
    sink: Option<&'a dyn ForwarderTelemetry>,
    sample: TransferSample,
    started: Instant,
    last: Instant,
    next_transferring: Instant,
}

impl<'a> TransferTelemetry<'a> {
    fn start(is_request: bool, sink: &'a dyn ForwarderTelemetry) -> Self {
        let now = Instant::now();
        Self {
            sink: sink.is_enabled().then_some(sink),
            sample: TransferSample {
                is_request,
                ..TransferSample::default()
            },
            started: now,
            last: now,
            next_transferring: now + TRANSFERRING_INTERVAL,
        }
    }

    fn after_read(&mut self, total: u64) {
        if self.sink.is_none() {
            return;
        }
        let now = Instant::now();
        self.sample.read_time += now - self.last;
        self.sample.first_read_time.get_or_insert(now - self.started);
        self.sample.bytes = total;
        self.sample.iops += 1;
        self.last = now;
    }

    fn after_write(&mut self) {
        let Some(sink) = self.sink else {
            return;
        };
        let now = Instant::now();
        self.sample.write_time += now - self.last;
        self.last = now;

        if now >= self.next_transferring {
            sink.content_transferring(&self.sample);
            self.next_transferring = now + TRANSFERRING_INTERVAL;
        }
    }

    fn finish(&mut self) {
        if let Some(sink) = self.sink {
            sink.content_transferred(&self.sample);
        }
    }
}
