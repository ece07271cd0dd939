//! Splits a connection's byte stream into wire units.
//!
//! Line-mode transports terminate every unit with [`LINE_TERMINATOR`]; multiplexed transports rely on the
//! [`BOUNDARY_MARKER`] the codec appends after each object. Either way the [`Framer`] accumulates bytes until it
//! sees a delimiter and carries any trailing partial unit over to the next read.

use bytes::{Buf, BytesMut};

use crate::codec::BOUNDARY_MARKER;

/// Terminator appended to every unit written in [`FramingMode::Line`].
pub const LINE_TERMINATOR: &str = "\r\n";

/// How units are delimited on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FramingMode {
    /// Units are terminated by [`LINE_TERMINATOR`].
    #[default]
    Line,
    /// Units are terminated by the codec's [`BOUNDARY_MARKER`].
    Boundary,
}

impl FramingMode {
    /// Returns the delimiter units are split on.
    pub fn delimiter(self) -> &'static str {
        match self {
            FramingMode::Line => LINE_TERMINATOR,
            FramingMode::Boundary => BOUNDARY_MARKER,
        }
    }

    /// Prepares a codec-encoded unit for writing.
    pub fn frame(self, mut wire: String) -> String {
        if self == FramingMode::Line {
            wire.push_str(LINE_TERMINATOR);
        }
        wire
    }
}

/// Accumulates bytes and emits complete units.
#[derive(Debug)]
pub struct Framer {
    delimiter: &'static [u8],
    carry: BytesMut,
    // Offset into `carry` before which no delimiter can start.
    searched: usize,
}

impl Framer {
    /// Creates a framer for the given mode.
    pub fn new(mode: FramingMode) -> Self {
        Framer {
            delimiter: mode.delimiter().as_bytes(),
            carry: BytesMut::new(),
            searched: 0,
        }
    }

    /// Feeds newly read bytes, returning every unit completed by them in arrival order.
    ///
    /// Empty units between back-to-back delimiters are skipped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let units = if self.carry.is_empty() {
            let (units, consumed) = split_units(chunk, self.delimiter, 0);
            if consumed < chunk.len() {
                self.carry.extend_from_slice(&chunk[consumed..]);
            }
            units
        } else {
            self.carry.extend_from_slice(chunk);
            let (units, consumed) = split_units(&self.carry, self.delimiter, self.searched);
            self.carry.advance(consumed);
            units
        };

        // The tail may hold the start of a delimiter completed by the next read.
        self.searched = self.carry.len().saturating_sub(self.delimiter.len() - 1);
        units
    }

    /// Returns the bytes carried over from a partial unit.
    pub fn pending(&self) -> &[u8] {
        &self.carry
    }
}

/// Splits off every complete unit, searching for the first delimiter from `resume`.
fn split_units(buf: &[u8], delimiter: &[u8], resume: usize) -> (Vec<String>, usize) {
    let mut units = Vec::new();
    let mut consumed = 0;
    let mut from = resume.min(buf.len());

    while let Some(at) = find(&buf[from..], delimiter) {
        let end = from + at;
        let unit = &buf[consumed..end];
        if !unit.is_empty() {
            units.push(String::from_utf8_lossy(unit).into_owned());
        }
        consumed = end + delimiter.len();
        from = consumed;
    }

    (units, consumed)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
