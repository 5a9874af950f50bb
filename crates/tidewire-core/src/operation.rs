//! Stream operations
//!
//! A [`StreamOperation`] is the bookkeeping context for one logical send or
//! receive. It borrows a [`Pipe`] from the [`PipePool`] and exposes two
//! halves around it:
//!
//! | Mode      | Writer half (into the pipe)         | Reader half (out of the pipe)        |
//! |-----------|-------------------------------------|--------------------------------------|
//! | `Send`    | application, through the compressor | transport, raw bytes for the wire    |
//! | `Receive` | transport, raw bytes from the wire  | application, through the decompressor|
//!
//! Each half moves through `None -> Started -> Complete` exactly once.
//! [`StreamOperation::release`] waits until both halves are complete before
//! the pipe goes back to the pool, so a pipe is never reused while either
//! side still references it.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::watch;
use tracing::trace;

use crate::compression::{
    compress_writer, decompress_reader, BoxedReader, BoxedWriter, CompressionLevel,
    CompressionMode,
};
use crate::errors::StateError;
use crate::pipe::{Pipe, PipeControl, PipePool};
use crate::Result;

// ----------------------------------------------------------------------------
// Operation Types
// ----------------------------------------------------------------------------

/// Direction of a stream operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationMode {
    Send,
    Receive,
}

/// Progress of one operation half; transitions are monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SideState {
    None,
    Started,
    Complete,
}

/// Which counter a half reports its bytes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tally {
    /// Uncompressed application bytes
    Payload,
    /// Raw bytes on the transport side, one part per chunk
    Wire,
}

/// Final counters of a released operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSummary {
    pub id: u64,
    pub mode: OperationMode,
    /// Application payload bytes
    pub transferred: u64,
    /// Raw (possibly compressed) bytes, excluding the boundary marker
    pub wire_bytes: u64,
    /// Number of transport-side chunks
    pub parts: u64,
    /// First fault recorded by either half
    pub fault: Option<String>,
}

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct OperationShared {
    id: u64,
    mode: OperationMode,
    reader_state: watch::Sender<SideState>,
    writer_state: watch::Sender<SideState>,
    transferred: AtomicU64,
    wire_bytes: AtomicU64,
    parts: AtomicU64,
    fault: Mutex<Option<String>>,
}

fn advance(state: &watch::Sender<SideState>, to: SideState) -> bool {
    state.send_if_modified(|current| {
        if *current < to {
            *current = to;
            true
        } else {
            false
        }
    })
}

impl OperationShared {
    fn tally(&self, tally: Tally, bytes: usize) {
        match tally {
            Tally::Payload => {
                self.transferred.fetch_add(bytes as u64, Ordering::Relaxed);
            }
            Tally::Wire => {
                self.wire_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                self.parts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn record_fault(&self, fault: &str) {
        let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(fault.to_string());
        }
    }

    fn fault(&self) -> Option<String> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn start_read(&self) -> Result<()> {
        if advance_from_none(&self.reader_state) {
            Ok(())
        } else {
            Err(StateError::ReadAlreadyStarted {
                operation_id: self.id,
            }
            .into())
        }
    }

    fn summary(&self) -> OperationSummary {
        OperationSummary {
            id: self.id,
            mode: self.mode,
            transferred: self.transferred.load(Ordering::Relaxed),
            wire_bytes: self.wire_bytes.load(Ordering::Relaxed),
            parts: self.parts.load(Ordering::Relaxed),
            fault: self.fault(),
        }
    }
}

fn advance_from_none(state: &watch::Sender<SideState>) -> bool {
    state.send_if_modified(|current| {
        if *current == SideState::None {
            *current = SideState::Started;
            true
        } else {
            false
        }
    })
}

// ----------------------------------------------------------------------------
// Writer Half
// ----------------------------------------------------------------------------

/// The half of an operation that writes into its pipe
pub struct OperationWriter {
    shared: Arc<OperationShared>,
    stream: Option<BoxedWriter>,
    control: PipeControl,
    tally: Tally,
}

impl OperationWriter {
    pub fn operation_id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> SideState {
        *self.shared.writer_state.borrow()
    }

    /// Write a whole slice into the pipe
    pub async fn write_part(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data).await
    }

    /// Finish this half.
    ///
    /// Without an error the stream is shut down so any codec trailer reaches
    /// the pipe and the reader sees end-of-stream. With an error the pipe is
    /// closed with that fault and the reader fails once it drains. Calling it
    /// again is a no-op.
    pub async fn complete(&mut self, error: Option<&str>) {
        if self.state() == SideState::Complete {
            return;
        }

        match (self.stream.take(), error) {
            (Some(mut stream), None) => {
                if let Err(e) = stream.shutdown().await {
                    let fault = format!("failed to finish payload stream: {}", e);
                    self.shared.record_fault(&fault);
                    self.control.close_writer(Some(fault));
                }
            }
            (_, Some(reason)) => {
                self.shared.record_fault(reason);
                self.control.close_writer(Some(reason.to_string()));
            }
            (None, None) => self.control.close_writer(None),
        }

        advance(&self.shared.writer_state, SideState::Complete);
        trace!(operation = self.shared.id, "Writer half complete");
    }
}

impl AsyncWrite for OperationWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "operation writer already completed",
            )));
        };
        advance(&this.shared.writer_state, SideState::Started);
        match Pin::new(stream).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.shared.tally(this.tally, n);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for OperationWriter {
    fn drop(&mut self) {
        if self.state() != SideState::Complete {
            let fault = "operation writer dropped before completion";
            self.shared.record_fault(fault);
            self.control.close_writer(Some(fault.to_string()));
            advance(&self.shared.writer_state, SideState::Complete);
        }
    }
}

// ----------------------------------------------------------------------------
// Reader Half
// ----------------------------------------------------------------------------

/// The half of an operation that reads out of its pipe
pub struct OperationReader {
    shared: Arc<OperationShared>,
    stream: Option<BoxedReader>,
    control: PipeControl,
    tally: Tally,
}

impl OperationReader {
    pub fn operation_id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> SideState {
        *self.shared.reader_state.borrow()
    }

    /// Mark the read side started; fails if it already was
    pub fn start_read(&self) -> Result<()> {
        self.shared.start_read()
    }

    /// Read up to `buf.len()` bytes; 0 means the writer finished
    pub async fn read_from_pipe(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf).await
    }

    /// Read everything until the writer finishes
    pub async fn read_payload(&mut self) -> io::Result<Bytes> {
        let mut out = Vec::new();
        self.read_to_end(&mut out).await?;
        Ok(Bytes::from(out))
    }

    /// Finish this half; an error is propagated to a still-running writer.
    /// Calling it again is a no-op.
    pub fn complete(&mut self, error: Option<&str>) {
        if self.state() == SideState::Complete {
            return;
        }
        if let Some(reason) = error {
            self.shared.record_fault(reason);
        }
        self.control.close_reader(error.map(str::to_string));
        self.stream = None;
        advance(&self.shared.reader_state, SideState::Complete);
        trace!(operation = self.shared.id, "Reader half complete");
    }
}

impl AsyncRead for OperationReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "operation reader already completed",
            )));
        };
        advance_from_none(&this.shared.reader_state);
        let before = buf.filled().len();
        match Pin::new(stream).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.shared.tally(this.tally, n);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl Drop for OperationReader {
    fn drop(&mut self) {
        if self.state() != SideState::Complete {
            let fault = "operation reader dropped before completion";
            self.shared.record_fault(fault);
            self.control.close_reader(Some(fault.to_string()));
            advance(&self.shared.reader_state, SideState::Complete);
        }
    }
}

// ----------------------------------------------------------------------------
// Stream Operation
// ----------------------------------------------------------------------------

/// Context for one logical send or receive
pub struct StreamOperation {
    shared: Arc<OperationShared>,
    pool: Arc<PipePool>,
    pipe: Option<Pipe>,
    writer: Option<OperationWriter>,
    reader: Option<OperationReader>,
}

impl StreamOperation {
    /// Borrow a pipe from `pool` and wrap its application side with the
    /// configured compression
    pub fn new(
        id: u64,
        mode: OperationMode,
        pool: Arc<PipePool>,
        compression: CompressionMode,
        level: CompressionLevel,
    ) -> Self {
        let pipe = pool.acquire();
        let (pipe_reader, pipe_writer) = pipe.split();
        let control = pipe.control();

        let shared = Arc::new(OperationShared {
            id,
            mode,
            reader_state: watch::channel(SideState::None).0,
            writer_state: watch::channel(SideState::None).0,
            transferred: AtomicU64::new(0),
            wire_bytes: AtomicU64::new(0),
            parts: AtomicU64::new(0),
            fault: Mutex::new(None),
        });

        let (writer_stream, writer_tally, reader_stream, reader_tally): (
            BoxedWriter,
            Tally,
            BoxedReader,
            Tally,
        ) = match mode {
            OperationMode::Send => (
                compress_writer(compression, level, pipe_writer),
                Tally::Payload,
                Box::new(pipe_reader),
                Tally::Wire,
            ),
            OperationMode::Receive => (
                Box::new(pipe_writer),
                Tally::Wire,
                decompress_reader(compression, pipe_reader),
                Tally::Payload,
            ),
        };

        trace!(operation = id, pipe = pipe.id(), ?mode, "Stream operation created");

        Self {
            writer: Some(OperationWriter {
                shared: Arc::clone(&shared),
                stream: Some(writer_stream),
                control: control.clone(),
                tally: writer_tally,
            }),
            reader: Some(OperationReader {
                shared: Arc::clone(&shared),
                stream: Some(reader_stream),
                control,
                tally: reader_tally,
            }),
            shared,
            pool,
            pipe: Some(pipe),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn mode(&self) -> OperationMode {
        self.shared.mode
    }

    pub fn reader_state(&self) -> SideState {
        *self.shared.reader_state.borrow()
    }

    pub fn writer_state(&self) -> SideState {
        *self.shared.writer_state.borrow()
    }

    /// Application payload bytes so far
    pub fn transferred(&self) -> u64 {
        self.shared.transferred.load(Ordering::Relaxed)
    }

    /// Raw transport-side bytes so far
    pub fn wire_bytes(&self) -> u64 {
        self.shared.wire_bytes.load(Ordering::Relaxed)
    }

    /// Transport-side chunks so far
    pub fn parts_count(&self) -> u64 {
        self.shared.parts.load(Ordering::Relaxed)
    }

    pub fn fault(&self) -> Option<String> {
        self.shared.fault()
    }

    /// Identifier of the borrowed pipe
    pub fn pipe_id(&self) -> Option<u64> {
        self.pipe.as_ref().map(Pipe::id)
    }

    /// Mark the read side started; a second call fails
    pub fn start_read(&self) -> Result<()> {
        self.shared.start_read()
    }

    /// Move the writer half out, e.g. into a producer task
    pub fn take_writer(&mut self) -> Result<OperationWriter> {
        self.writer.take().ok_or_else(|| {
            StateError::HalfTaken {
                operation_id: self.shared.id,
                side: "writer",
            }
            .into()
        })
    }

    /// Move the reader half out, e.g. into a consumer task
    pub fn take_reader(&mut self) -> Result<OperationReader> {
        self.reader.take().ok_or_else(|| {
            StateError::HalfTaken {
                operation_id: self.shared.id,
                side: "reader",
            }
            .into()
        })
    }

    /// Borrow the writer half still held by this operation
    pub fn writer(&mut self) -> Result<&mut OperationWriter> {
        let id = self.shared.id;
        self.writer.as_mut().ok_or_else(|| {
            StateError::HalfTaken {
                operation_id: id,
                side: "writer",
            }
            .into()
        })
    }

    /// Borrow the reader half still held by this operation
    pub fn reader(&mut self) -> Result<&mut OperationReader> {
        let id = self.shared.id;
        self.reader.as_mut().ok_or_else(|| {
            StateError::HalfTaken {
                operation_id: id,
                side: "reader",
            }
            .into()
        })
    }

    /// Complete the held writer half; a taken half is completed by its owner
    pub async fn complete_write(&mut self, error: Option<&str>) {
        if let Some(writer) = self.writer.as_mut() {
            writer.complete(error).await;
        }
    }

    /// Complete the held reader half; a taken half is completed by its owner
    pub fn complete_read(&mut self, error: Option<&str>) {
        if let Some(reader) = self.reader.as_mut() {
            reader.complete(error);
        }
    }

    /// Counters so far
    pub fn summary(&self) -> OperationSummary {
        self.shared.summary()
    }

    /// Wait for both halves to complete, then return the pipe to the pool.
    ///
    /// Halves still held by the operation are abandoned first; halves that
    /// were taken are awaited until their owners complete or drop them.
    pub async fn release(mut self) -> OperationSummary {
        drop(self.writer.take());
        drop(self.reader.take());

        let mut writer_rx = self.shared.writer_state.subscribe();
        let mut reader_rx = self.shared.reader_state.subscribe();
        let _ = writer_rx.wait_for(|s| *s == SideState::Complete).await;
        let _ = reader_rx.wait_for(|s| *s == SideState::Complete).await;

        if let Some(pipe) = self.pipe.take() {
            let pipe_id = pipe.id();
            let pooled = self.pool.release(pipe);
            trace!(operation = self.shared.id, pipe = pipe_id, pooled, "Pipe released");
        }
        self.shared.summary()
    }
}

impl core::fmt::Debug for StreamOperation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamOperation")
            .field("id", &self.shared.id)
            .field("mode", &self.shared.mode)
            .field("reader_state", &self.reader_state())
            .field("writer_state", &self.writer_state())
            .field("transferred", &self.transferred())
            .field("pipe", &self.pipe_id())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression;
    use crate::TidewireError;
    use std::time::Duration;

    fn pool() -> Arc<PipePool> {
        Arc::new(PipePool::new(256, 4))
    }

    /// Drain the transport side of a send operation
    async fn drain(reader: &mut OperationReader) -> io::Result<Vec<u8>> {
        let mut raw = Vec::new();
        let mut buf = [0u8; 100];
        loop {
            let n = reader.read_from_pipe(&mut buf).await?;
            if n == 0 {
                return Ok(raw);
            }
            raw.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_send_operation_compresses_into_pipe() {
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut op = StreamOperation::new(
            1,
            OperationMode::Send,
            pool(),
            CompressionMode::GZip,
            CompressionLevel::Fastest,
        );

        let mut writer = op.take_writer().unwrap();
        let data = payload.clone();
        let producer = tokio::spawn(async move {
            writer.write_part(&data).await.unwrap();
            writer.complete(None).await;
        });

        op.start_read().unwrap();
        let raw = drain(op.reader().unwrap()).await.unwrap();
        op.complete_read(None);
        producer.await.unwrap();

        let summary = op.release().await;
        assert_eq!(summary.transferred, payload.len() as u64);
        assert_eq!(summary.wire_bytes, raw.len() as u64);
        assert!(summary.parts >= 1);
        assert!(summary.fault.is_none());
        assert_eq!(compression::decompress(CompressionMode::GZip, &raw).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_receive_operation_decompresses() {
        let payload = vec![0x41u8; 5001];
        let raw = compression::compress(CompressionMode::Brotli, CompressionLevel::Fastest, &payload)
            .await
            .unwrap();
        let mut op = StreamOperation::new(
            2,
            OperationMode::Receive,
            pool(),
            CompressionMode::Brotli,
            CompressionLevel::Fastest,
        );

        let mut reader = op.take_reader().unwrap();
        let consumer = tokio::spawn(async move {
            let bytes = reader.read_payload().await.unwrap();
            reader.complete(None);
            bytes
        });

        for chunk in raw.chunks(7) {
            op.writer().unwrap().write_part(chunk).await.unwrap();
        }
        op.complete_write(None).await;

        assert_eq!(consumer.await.unwrap(), Bytes::from(payload));
        let summary = op.release().await;
        assert_eq!(summary.transferred, 5001);
        assert_eq!(summary.parts, raw.chunks(7).count() as u64);
    }

    #[tokio::test]
    async fn test_start_read_twice_fails() {
        let op = StreamOperation::new(
            3,
            OperationMode::Send,
            pool(),
            CompressionMode::None,
            CompressionLevel::Fastest,
        );
        op.start_read().unwrap();
        let err = op.start_read().unwrap_err();
        assert!(matches!(
            err,
            TidewireError::State(StateError::ReadAlreadyStarted { operation_id: 3 })
        ));
    }

    #[tokio::test]
    async fn test_producer_fault_reaches_transport() {
        let mut op = StreamOperation::new(
            4,
            OperationMode::Send,
            pool(),
            CompressionMode::None,
            CompressionLevel::Fastest,
        );
        let mut writer = op.take_writer().unwrap();
        writer.write_part(b"half a payload").await.unwrap();
        writer.complete(Some("encoder failed")).await;

        let err = drain(op.reader().unwrap()).await.unwrap_err();
        assert_eq!(err.to_string(), "encoder failed");
        op.complete_read(Some("encoder failed"));

        let summary = op.release().await;
        assert_eq!(summary.fault.as_deref(), Some("encoder failed"));
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let mut op = StreamOperation::new(
            5,
            OperationMode::Send,
            pool(),
            CompressionMode::None,
            CompressionLevel::Fastest,
        );
        op.complete_write(None).await;
        op.complete_write(Some("late error")).await;
        op.complete_read(None);
        op.complete_read(Some("late error"));

        assert_eq!(op.writer_state(), SideState::Complete);
        assert_eq!(op.reader_state(), SideState::Complete);
        assert!(op.fault().is_none());
    }

    #[tokio::test]
    async fn test_release_waits_for_taken_half() {
        let pool = pool();
        let mut op = StreamOperation::new(
            6,
            OperationMode::Receive,
            Arc::clone(&pool),
            CompressionMode::None,
            CompressionLevel::Fastest,
        );
        let mut reader = op.take_reader().unwrap();
        op.complete_write(None).await;

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(reader.state(), SideState::None);
            reader.complete(None);
        });

        let summary = op.release().await;
        assert!(consumer.is_finished());
        assert!(summary.fault.is_none());
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test]
    async fn test_dropped_half_counts_as_complete() {
        let pool = pool();
        let mut op = StreamOperation::new(
            7,
            OperationMode::Send,
            Arc::clone(&pool),
            CompressionMode::None,
            CompressionLevel::Fastest,
        );
        drop(op.take_writer().unwrap());
        let summary = op.release().await;
        assert_eq!(
            summary.fault.as_deref(),
            Some("operation writer dropped before completion")
        );
        assert_eq!(pool.stats().available, 1);
    }
}
