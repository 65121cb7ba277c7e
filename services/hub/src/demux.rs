//! Motion-JPEG frame demultiplexer.
//!
//! Splits the raw byte stream of a capture process into complete JPEG
//! images by scanning for SOI (`FF D8`) and EOI (`FF D9`) markers. The
//! stream carries no length prefixes, so a frame is only emitted once its
//! EOI has arrived.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// End-of-image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// An unterminated frame was buffered when the input ended.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Incomplete trailing frame dropped ({bytes} bytes)")]
pub struct DemuxTruncation {
    pub bytes: usize,
}

/// Incremental JPEG boundary scanner.
///
/// Bytes that precede an SOI are container noise and are discarded.
#[derive(Debug, Default)]
pub struct FrameDemuxer {
    buffer: BytesMut,
    /// Buffer starts with an SOI whose EOI has not been seen yet.
    in_frame: bool,
    /// Offset from which the next marker search resumes.
    scan_from: usize,
    frames_emitted: u64,
    bytes_discarded: u64,
}

impl FrameDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if !self.in_frame {
                match find_marker(&self.buffer, self.scan_from, SOI) {
                    Some(start) => {
                        self.discard(start);
                        self.in_frame = true;
                        self.scan_from = SOI.len();
                    }
                    None => {
                        // a trailing 0xFF may be the first half of a split SOI
                        let keep = usize::from(self.buffer.last() == Some(&0xFF));
                        self.discard(self.buffer.len() - keep);
                        self.scan_from = 0;
                        break;
                    }
                }
            }

            match find_marker(&self.buffer, self.scan_from, EOI) {
                Some(end) => {
                    frames.push(self.buffer.split_to(end + EOI.len()).freeze());
                    self.frames_emitted += 1;
                    self.in_frame = false;
                    self.scan_from = 0;
                }
                None => {
                    self.scan_from = self.buffer.len().saturating_sub(1).max(SOI.len());
                    break;
                }
            }
        }

        frames
    }

    /// Signal end of input, dropping any unterminated frame.
    pub fn finish(&mut self) -> Result<(), DemuxTruncation> {
        let pending = self.buffer.len();
        let truncated = self.in_frame;

        self.buffer.clear();
        self.in_frame = false;
        self.scan_from = 0;

        if truncated {
            self.bytes_discarded += pending as u64;
            return Err(DemuxTruncation { bytes: pending });
        }
        self.bytes_discarded += pending as u64;
        Ok(())
    }

    /// Number of frames emitted so far.
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Number of bytes dropped as noise or truncation.
    pub fn bytes_discarded(&self) -> u64 {
        self.bytes_discarded
    }

    /// Bytes currently held back waiting for more input.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn discard(&mut self, count: usize) {
        self.buffer.advance(count);
        self.bytes_discarded += count as u64;
    }
}

fn find_marker(haystack: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|pos| pos + from)
}
