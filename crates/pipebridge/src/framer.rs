//! Sentinel framing over an unstructured byte stream.
//!
//! The worker has no length prefixes or terminators. A response is complete
//! when its output contains the marker (the worker's prompt token). The
//! framer is fed the output chunk by chunk and keeps a short trailing window
//! so a marker split across two reads is still found.
//!
//! The marker is matched as an opaque byte pattern. Legitimate output that
//! happens to contain the marker text ends framing early; this is a known
//! limitation of the protocol. [`Anchor::LineStart`] narrows matches to the
//! start of a line for workers whose prompt always begins a line.

use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

#[derive(Debug, thiserror::Error)]
pub enum FramerError {
    #[error("sentinel marker must not be empty")]
    EmptyMarker,
}

/// Where in the stream a marker occurrence is allowed to start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Anchor {
    /// Any occurrence of the bytes, anywhere.
    #[default]
    Anywhere,
    /// Only at the very start of the stream or right after a `\n`.
    LineStart,
}

/// The worker's self-identifying token, validated once at configuration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    bytes: Bytes,
    anchor: Anchor,
}

impl Marker {
    pub fn new(marker: impl Into<Bytes>) -> Result<Self, FramerError> {
        let bytes = marker.into();
        if bytes.is_empty() {
            return Err(FramerError::EmptyMarker);
        }
        Ok(Self {
            bytes,
            anchor: Anchor::Anywhere,
        })
    }

    pub fn with_anchor(mut self, anchor: Anchor) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn anchor(&self) -> Anchor {
        self.anchor
    }

    /// A fresh framer for one round (startup wait or one response).
    pub fn framer(&self) -> SentinelFramer {
        SentinelFramer::new(self.clone())
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

/// Incremental marker scanner for one framing round.
#[derive(Debug)]
pub struct SentinelFramer {
    marker: Marker,
    /// Tail of everything fed so far, at most `keep()` bytes.
    window: Vec<u8>,
    /// Total bytes fed before the current chunk.
    consumed: u64,
    seen: bool,
}

impl SentinelFramer {
    pub fn new(marker: Marker) -> Self {
        Self {
            marker,
            window: Vec::new(),
            consumed: 0,
            seen: false,
        }
    }

    /// Feed the next chunk. Returns true once the marker has appeared anywhere
    /// in the cumulative stream, and keeps returning true afterwards.
    pub fn observe(&mut self, chunk: &[u8]) -> bool {
        if self.seen {
            return true;
        }
        self.find_end(chunk).is_some()
    }

    pub fn is_seen(&self) -> bool {
        self.seen
    }

    /// Feed the next chunk and return the offset within `chunk` just past the
    /// first marker occurrence, if the marker completes inside it.
    ///
    /// Once the marker has been seen this returns `None` without scanning.
    pub fn find_end(&mut self, chunk: &[u8]) -> Option<usize> {
        if self.seen || chunk.is_empty() {
            return None;
        }

        let needle = self.marker.as_bytes();
        let m = needle.len();
        let w = self.window.len();

        let mut hay = Vec::with_capacity(w + chunk.len());
        hay.extend_from_slice(&self.window);
        hay.extend_from_slice(chunk);

        // Matches that end inside the window were already rejected on an
        // earlier call, so only look at ones reaching into this chunk.
        let first = (w + 1).saturating_sub(m);
        let stream_offset_of_hay = self.consumed - w as u64;

        let found = hay
            .windows(m)
            .enumerate()
            .skip(first)
            .find(|(p, candidate)| {
                *candidate == needle && self.anchor_allows(&hay, *p, stream_offset_of_hay)
            })
            .map(|(p, _)| p + m - w);

        if found.is_some() {
            self.seen = true;
            self.window.clear();
        } else {
            let keep = self.keep();
            let start = hay.len().saturating_sub(keep);
            self.window = hay.split_off(start);
        }
        self.consumed += chunk.len() as u64;

        found
    }

    fn anchor_allows(&self, hay: &[u8], p: usize, hay_offset: u64) -> bool {
        match self.marker.anchor() {
            Anchor::Anywhere => true,
            Anchor::LineStart => {
                if p == 0 {
                    hay_offset == 0
                } else {
                    hay[p - 1] == b'\n'
                }
            }
        }
    }

    fn keep(&self) -> usize {
        let extra = match self.marker.anchor() {
            Anchor::Anywhere => 0,
            Anchor::LineStart => 1,
        };
        self.marker.as_bytes().len() - 1 + extra
    }
}

/// Splits a byte stream into responses, each ending with the marker.
///
/// Bytes after a marker stay buffered as the start of the next response.
#[derive(Debug)]
pub struct ResponseCodec {
    marker: Marker,
    framer: SentinelFramer,
    scanned: usize,
}

impl ResponseCodec {
    pub fn new(marker: Marker) -> Self {
        let framer = marker.framer();
        Self {
            marker,
            framer,
            scanned: 0,
        }
    }
}

impl Decoder for ResponseCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() <= self.scanned {
            return Ok(None);
        }

        match self.framer.find_end(&src[self.scanned..]) {
            Some(end) => {
                let total = self.scanned + end;
                self.scanned = 0;
                self.framer = self.marker.framer();
                Ok(Some(src.split_to(total).freeze()))
            }
            None => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "stream closed with {} bytes before marker {:?}",
                    src.len(),
                    self.marker.to_string()
                ),
            )),
        }
    }
}
