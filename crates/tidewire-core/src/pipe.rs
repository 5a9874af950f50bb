//! Bounded in-process byte pipes and their pool
//!
//! A [`Pipe`] connects the transport-facing and application-facing halves of
//! a stream operation. The writer half blocks once `capacity` bytes are
//! buffered; the reader half sees end-of-stream once the writer closes, or an
//! error if the writer closed with a fault. Closing either half wakes the
//! other.
//!
//! Pipes are recycled through [`PipePool`]. Every recycle bumps the pipe's
//! generation, and halves created for an older generation refuse to touch
//! the buffer, so a stale handle can never leak bytes into the next user.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

// ----------------------------------------------------------------------------
// Shared Pipe State
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct PipeState {
    buffer: BytesMut,
    capacity: usize,
    generation: u64,
    writer_closed: bool,
    reader_closed: bool,
    fault: Option<String>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl PipeState {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

#[derive(Debug)]
struct PipeShared {
    state: Mutex<PipeState>,
}

impl PipeShared {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn recycled() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe was recycled")
}

// ----------------------------------------------------------------------------
// Pipe
// ----------------------------------------------------------------------------

/// A bounded byte buffer with independent reader and writer completion
#[derive(Debug, Clone)]
pub struct Pipe {
    id: u64,
    shared: Arc<PipeShared>,
}

impl Pipe {
    /// Create a pipe that buffers at most `capacity` bytes
    pub fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            shared: Arc::new(PipeShared {
                state: Mutex::new(PipeState {
                    buffer: BytesMut::with_capacity(capacity.min(64 * 1024)),
                    capacity: capacity.max(1),
                    generation: 0,
                    writer_closed: false,
                    reader_closed: false,
                    fault: None,
                    read_waker: None,
                    write_waker: None,
                }),
            }),
        }
    }

    /// Pool-assigned identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Maximum number of buffered bytes
    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }

    /// Bytes written but not yet read
    pub fn buffered(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    /// Number of times this pipe has been recycled
    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// Whether the writer half has closed
    pub fn is_writer_closed(&self) -> bool {
        self.shared.lock().writer_closed
    }

    /// Whether the reader half has closed
    pub fn is_reader_closed(&self) -> bool {
        self.shared.lock().reader_closed
    }

    /// Whether both halves are closed and the pipe may be recycled
    pub fn is_idle(&self) -> bool {
        let state = self.shared.lock();
        state.writer_closed && state.reader_closed
    }

    /// Create reader and writer halves bound to the current generation
    pub fn split(&self) -> (PipeReader, PipeWriter) {
        let generation = self.generation();
        (
            PipeReader {
                shared: Arc::clone(&self.shared),
                generation,
            },
            PipeWriter {
                shared: Arc::clone(&self.shared),
                generation,
            },
        )
    }

    /// Out-of-band handle able to close either half with a fault
    pub fn control(&self) -> PipeControl {
        PipeControl {
            shared: Arc::clone(&self.shared),
            generation: self.generation(),
        }
    }

    /// Clear all buffered bytes and flags and start a new generation
    fn reset(&self) {
        let mut state = self.shared.lock();
        state.generation += 1;
        state.buffer.clear();
        state.writer_closed = false;
        state.reader_closed = false;
        state.fault = None;
        state.wake_reader();
        state.wake_writer();
    }
}

// ----------------------------------------------------------------------------
// Pipe Control
// ----------------------------------------------------------------------------

/// Closes pipe halves from outside the stream that owns them
#[derive(Debug, Clone)]
pub struct PipeControl {
    shared: Arc<PipeShared>,
    generation: u64,
}

impl PipeControl {
    /// Close the writer side; a fault is surfaced to the reader after the
    /// buffered bytes are drained
    pub fn close_writer(&self, fault: Option<String>) {
        close_writer(&self.shared, self.generation, fault);
    }

    /// Close the reader side; pending and future writes fail
    pub fn close_reader(&self, fault: Option<String>) {
        close_reader(&self.shared, self.generation, fault);
    }
}

fn close_writer(shared: &PipeShared, generation: u64, fault: Option<String>) {
    let mut state = shared.lock();
    if state.generation != generation || state.writer_closed {
        return;
    }
    state.writer_closed = true;
    if state.fault.is_none() {
        state.fault = fault;
    }
    state.wake_reader();
    state.wake_writer();
}

fn close_reader(shared: &PipeShared, generation: u64, fault: Option<String>) {
    let mut state = shared.lock();
    if state.generation != generation || state.reader_closed {
        return;
    }
    state.reader_closed = true;
    if state.fault.is_none() {
        state.fault = fault;
    }
    state.wake_writer();
    state.wake_reader();
}

// ----------------------------------------------------------------------------
// Reader Half
// ----------------------------------------------------------------------------

/// Reading end of a [`Pipe`]
#[derive(Debug)]
pub struct PipeReader {
    shared: Arc<PipeShared>,
    generation: u64,
}

impl PipeReader {
    /// Close the reader, optionally recording a fault for the writer
    pub fn close(&mut self, fault: Option<String>) {
        close_reader(&self.shared, self.generation, fault);
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.shared.lock();
        if state.generation != self.generation {
            return Poll::Ready(Err(recycled()));
        }

        if !state.buffer.is_empty() {
            let n = buf.remaining().min(state.buffer.len());
            buf.put_slice(&state.buffer[..n]);
            state.buffer.advance(n);
            state.wake_writer();
            return Poll::Ready(Ok(()));
        }

        if state.writer_closed {
            return match &state.fault {
                Some(fault) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, fault.clone()))),
                None => Poll::Ready(Ok(())),
            };
        }

        if state.reader_closed {
            return Poll::Ready(Ok(()));
        }

        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        close_reader(&self.shared, self.generation, None);
    }
}

// ----------------------------------------------------------------------------
// Writer Half
// ----------------------------------------------------------------------------

/// Writing end of a [`Pipe`]
#[derive(Debug)]
pub struct PipeWriter {
    shared: Arc<PipeShared>,
    generation: u64,
}

impl PipeWriter {
    /// Close the writer, optionally recording a fault for the reader
    pub fn close(&mut self, fault: Option<String>) {
        close_writer(&self.shared, self.generation, fault);
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.shared.lock();
        if state.generation != self.generation {
            return Poll::Ready(Err(recycled()));
        }
        if state.reader_closed {
            let reason = state
                .fault
                .clone()
                .unwrap_or_else(|| "pipe reader closed".to_string());
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, reason)));
        }
        if state.writer_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after pipe writer closed",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let space = state.capacity.saturating_sub(state.buffer.len());
        if space == 0 {
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = space.min(buf.len());
        state.buffer.extend_from_slice(&buf[..n]);
        state.wake_reader();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        close_writer(&self.shared, self.generation, None);
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        close_writer(
            &self.shared,
            self.generation,
            Some("pipe writer dropped before completion".to_string()),
        );
    }
}

// ----------------------------------------------------------------------------
// Pipe Pool
// ----------------------------------------------------------------------------

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Pipes allocated because the free list was empty
    pub created: u64,
    /// Acquisitions served from the free list
    pub reused: u64,
    /// Pipes currently waiting in the free list
    pub available: usize,
    /// Releases refused because a half was still open
    pub rejected: u64,
}

/// Concurrent free list of reusable pipes
#[derive(Debug)]
pub struct PipePool {
    free: Mutex<Vec<Pipe>>,
    pipe_capacity: usize,
    max_pooled: usize,
    next_id: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    rejected: AtomicU64,
}

impl PipePool {
    /// Create a pool handing out pipes of `pipe_capacity` bytes and keeping
    /// at most `max_pooled` idle pipes
    pub fn new(pipe_capacity: usize, max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            pipe_capacity,
            max_pooled,
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn free_list(&self) -> MutexGuard<'_, Vec<Pipe>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take an empty pipe, allocating one if the free list is empty
    pub fn acquire(&self) -> Pipe {
        if let Some(pipe) = self.free_list().pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            trace!(pipe = pipe.id(), "Reusing pooled pipe");
            return pipe;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        trace!(pipe = id, capacity = self.pipe_capacity, "Allocating pipe");
        Pipe::new(id, self.pipe_capacity)
    }

    /// Return a pipe whose halves have both closed.
    ///
    /// Returns `false` and drops the pipe if either half is still open.
    pub fn release(&self, pipe: Pipe) -> bool {
        if !pipe.is_idle() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(pipe = pipe.id(), "Refusing to pool pipe with an open half");
            return false;
        }

        pipe.reset();
        let mut free = self.free_list();
        if free.len() < self.max_pooled {
            free.push(pipe);
        }
        true
    }

    /// Capacity of pipes handed out by this pool
    pub fn pipe_capacity(&self) -> usize {
        self.pipe_capacity
    }

    /// Current pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            available: self.free_list().len(),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
