//! Inbound line framing
//!
//! Serial noise is normal around a board reset, so framing works on bytes:
//! a line that is not UTF-8 or runs past the length limit becomes an item of
//! its own instead of a stream error, and whatever follows it is still read.

use std::io;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// One newline-terminated chunk from the stand
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RawLine {
    /// A text line, with the `\n` (and any trailing `\r`) removed
    Text(String),
    /// A line that is not valid UTF-8, lossily decoded for the log
    Binary(String),
    /// A line longer than the limit; its bytes were dropped
    TooLong,
}

/// Newline framing with a length limit that never fails the stream
#[derive(Debug, Clone)]
pub(crate) struct StandLineCodec {
    max_length: usize,
    /// Bytes already searched for a newline
    next_index: usize,
    /// Dropping the rest of an overlong line
    discarding: bool,
}

impl StandLineCodec {
    pub(crate) fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    fn take_line(&mut self, buf: &mut BytesMut, end: usize) -> RawLine {
        self.next_index = 0;
        let chunk = buf.split_to(end);
        let mut bytes = &chunk[..];
        if let Some(b'\n') = bytes.last() {
            bytes = &bytes[..bytes.len() - 1];
        }
        if let Some(b'\r') = bytes.last() {
            bytes = &bytes[..bytes.len() - 1];
        }
        match std::str::from_utf8(bytes) {
            Ok(text) => RawLine::Text(text.to_string()),
            Err(_) => RawLine::Binary(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}

impl Decoder for StandLineCodec {
    type Item = RawLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawLine>, io::Error> {
        loop {
            let read_to = buf.len().min(self.max_length.saturating_add(1));
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(at)) => {
                    buf.advance(at + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(at)) => return Ok(Some(self.take_line(buf, at + 1))),
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                    return Ok(Some(RawLine::TooLong));
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<RawLine>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if self.discarding || buf.is_empty() {
            buf.clear();
            self.discarding = false;
            self.next_index = 0;
            return Ok(None);
        }
        // Unterminated last line
        let end = buf.len();
        Ok(Some(self.take_line(buf, end)))
    }
}
