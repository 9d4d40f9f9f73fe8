use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use super::{Message, MAX_LINE_LENGTH};

/// Codec for newline-delimited protocol lines.
///
/// Decodes raw lines (the reader interprets sub-block lines itself) and
/// encodes either typed [`Message`]s or raw sub-block lines. A terminating
/// `\n` is stripped on decode along with an optional preceding `\r`.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_line_length: usize,
    // Scan position into the buffer, so partial reads are not rescanned.
    next_index: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self {
            max_line_length: MAX_LINE_LENGTH,
            next_index: 0,
        }
    }
}

impl LineCodec {
    /// Create a new codec with a custom maximum line length.
    pub fn new(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            next_index: 0,
        }
    }

    fn take_line(&mut self, src: &mut BytesMut, newline_offset: usize) -> Result<String> {
        let mut line = src.split_to(newline_offset + 1);
        self.next_index = 0;
        line.truncate(line.len() - 1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        String::from_utf8(line.to_vec())
            .map_err(|e| Error::protocol(format!("line is not valid UTF-8: {}", e)))
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        if let Some(pos) = src[self.next_index..].iter().position(|&b| b == b'\n') {
            let newline_offset = self.next_index + pos;
            return self.take_line(src, newline_offset).map(Some);
        }

        if src.len() > self.max_line_length {
            // Discard the oversized prefix so the stream can resynchronize
            // at the next newline.
            src.clear();
            self.next_index = 0;
            return Err(Error::protocol(format!(
                "line length exceeds maximum {}",
                self.max_line_length
            )));
        }

        self.next_index = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                // Final unterminated line at EOF is still a line.
                let line = src.split_to(src.len());
                self.next_index = 0;
                String::from_utf8(line.to_vec())
                    .map(Some)
                    .map_err(|e| Error::protocol(format!("line is not valid UTF-8: {}", e)))
            }
        }
    }
}

impl Encoder<&Message> for LineCodec {
    type Error = Error;

    fn encode(&mut self, msg: &Message, dst: &mut BytesMut) -> Result<()> {
        Encoder::<String>::encode(self, msg.encode(), dst)
    }
}

impl Encoder<Message> for LineCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        Encoder::<&Message>::encode(self, &msg, dst)
    }
}

impl Encoder<String> for LineCodec {
    type Error = Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<()> {
        if line.len() > self.max_line_length {
            return Err(Error::protocol(format!(
                "line length {} exceeds maximum {}",
                line.len(),
                self.max_line_length
            )));
        }
        dst.reserve(line.len() + 1);
        // Raw sub-block lines go through the same sanitization as payloads.
        if line.contains(['\n', '\r']) {
            dst.put(super::sanitize_payload(&line).as_bytes());
        } else {
            dst.put(line.as_bytes());
        }
        dst.put_u8(b'\n');
        Ok(())
    }
}
