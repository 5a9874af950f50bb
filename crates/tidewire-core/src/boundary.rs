//! Boundary-marker framing
//!
//! Messages travel back to back on one byte stream with no length prefix.
//! Each message is terminated by [`BOUNDARY_MARKER`], written verbatim after
//! the (possibly compressed) payload. [`BoundaryScanner`] recovers message
//! bodies from arbitrarily split reads, including reads that cut the marker
//! in two.

use bytes::{Buf, Bytes, BytesMut};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Control bytes wrapping ASCII "fin"
pub const BOUNDARY_MARKER: [u8; 9] = [0x01, 0x3C, 0x02, 0x66, 0x69, 0x6E, 0x03, 0x3E, 0x04];

/// Length of [`BOUNDARY_MARKER`]
pub const MARKER_LEN: usize = BOUNDARY_MARKER.len();

// ----------------------------------------------------------------------------
// Scan Results
// ----------------------------------------------------------------------------

/// One step of boundary scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    /// Body bytes that are known not to belong to a marker
    pub body: Bytes,
    /// Whether `body` is the final slice of the current message
    pub boundary_found: bool,
}

impl Scan {
    /// Whether the receive loop should keep reading into the same message
    pub fn keep_reading(&self) -> bool {
        !self.boundary_found
    }
}

// ----------------------------------------------------------------------------
// Boundary Scanner
// ----------------------------------------------------------------------------

/// Incremental marker search over successive read chunks.
///
/// The scanner withholds the last `marker.len() - 1` bytes of everything it
/// has seen: those bytes may be the start of a marker whose remainder has not
/// arrived yet. They are released as body bytes as soon as the next chunk
/// proves they are not. Every complete message in a chunk is reported, in
/// order, before [`next_scan`](Self::next_scan) returns `None`.
#[derive(Debug, Clone)]
pub struct BoundaryScanner {
    marker: &'static [u8],
    window: BytesMut,
    boundaries: u64,
}

impl BoundaryScanner {
    /// Create a scanner for [`BOUNDARY_MARKER`]
    pub fn new() -> Self {
        Self {
            marker: &BOUNDARY_MARKER,
            window: BytesMut::with_capacity(MARKER_LEN * 2),
            boundaries: 0,
        }
    }

    /// Append the next raw chunk read from the transport
    pub fn feed(&mut self, chunk: &[u8]) {
        self.window.extend_from_slice(chunk);
    }

    /// Produce the next body slice, or `None` when more input is needed.
    ///
    /// A boundary inside the window always wins over releasing a partial
    /// body, so a chunk carrying several messages yields them in order.
    pub fn next_scan(&mut self) -> Option<Scan> {
        if let Some(offset) = find_marker(&self.window, self.marker) {
            let body = self.window.split_to(offset).freeze();
            self.window.advance(self.marker.len());
            self.boundaries += 1;
            return Some(Scan {
                body,
                boundary_found: true,
            });
        }

        let hold = self.carry_capacity();
        if self.window.len() > hold {
            let release = self.window.len() - hold;
            let body = self.window.split_to(release).freeze();
            return Some(Scan {
                body,
                boundary_found: false,
            });
        }

        None
    }

    /// Feed a chunk and drain every scan it produces
    pub fn scan(&mut self, chunk: &[u8]) -> Vec<Scan> {
        self.feed(chunk);
        let mut scans = Vec::new();
        while let Some(scan) = self.next_scan() {
            scans.push(scan);
        }
        scans
    }

    /// Bytes currently withheld because they may start a marker
    pub fn carry(&self) -> &[u8] {
        &self.window
    }

    /// Maximum number of bytes withheld between chunks
    pub fn carry_capacity(&self) -> usize {
        self.marker.len() - 1
    }

    /// Number of boundaries found since creation
    pub fn boundaries_found(&self) -> u64 {
        self.boundaries
    }

    /// Whether the scanner holds the start of an unfinished message
    pub fn has_pending(&self) -> bool {
        !self.window.is_empty()
    }
}

impl Default for BoundaryScanner {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Marker Sentinel
// ----------------------------------------------------------------------------

/// Detects [`BOUNDARY_MARKER`] in an outgoing byte stream.
///
/// The send path runs every chunk through a sentinel before it reaches the
/// wire. A marker inside the payload bytes would end the message early on
/// the receiving side, so it must be caught here, including a marker that
/// straddles two chunks.
#[derive(Debug, Clone, Default)]
pub struct MarkerSentinel {
    /// Last `MARKER_LEN - 1` bytes inspected
    tail: Vec<u8>,
    /// Total bytes inspected so far
    seen: u64,
}

impl MarkerSentinel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the next chunk; returns the stream offset of a marker
    /// occurrence, if any. Chunks after a hit are not meaningful.
    pub fn inspect(&mut self, chunk: &[u8]) -> Option<u64> {
        let hold = MARKER_LEN - 1;
        let tail_start = self.seen - self.tail.len() as u64;

        let mut seam = Vec::with_capacity(self.tail.len() + hold);
        seam.extend_from_slice(&self.tail);
        seam.extend_from_slice(&chunk[..chunk.len().min(hold)]);
        if let Some(offset) = find_marker(&seam, &BOUNDARY_MARKER) {
            return Some(tail_start + offset as u64);
        }
        if let Some(offset) = find_marker(chunk, &BOUNDARY_MARKER) {
            return Some(self.seen + offset as u64);
        }

        if chunk.len() >= hold {
            self.tail.clear();
            self.tail.extend_from_slice(&chunk[chunk.len() - hold..]);
        } else {
            self.tail.extend_from_slice(chunk);
            let excess = self.tail.len().saturating_sub(hold);
            self.tail.drain(..excess);
        }
        self.seen += chunk.len() as u64;
        None
    }

    /// Bytes inspected without a hit
    pub fn bytes_seen(&self) -> u64 {
        self.seen
    }
}

/// Position of the first occurrence of `marker` in `haystack`
pub fn find_marker(haystack: &[u8], marker: &[u8]) -> Option<usize> {
    if marker.is_empty() || haystack.len() < marker.len() {
        return None;
    }
    haystack
        .windows(marker.len())
        .position(|window| window == marker)
}

/// Whether `payload` contains the boundary marker anywhere
pub fn contains_marker(payload: &[u8]) -> bool {
    find_marker(payload, &BOUNDARY_MARKER).is_some()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
