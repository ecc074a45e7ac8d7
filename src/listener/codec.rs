//! Line framing for PBX CDR streams.

use bytes::BytesMut;
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Padding some PBXs put in front of a record.
const LEFT_PAD: [u8; 5] = [b' ', 0x0c, b'\t', 0x0b, 0x00];

/// Framing errors. Any of them closes the connection.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// LF-terminated line decoder.
///
/// Strips a trailing CR and the left padding, keeps trailing spaces (they
/// are part of the fixed-width record).
#[derive(Debug, Clone)]
pub struct CdrLineCodec {
    max_length: usize,
    /// Bytes already searched for LF
    next_index: usize,
}

impl CdrLineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }
}

impl Decoder for CdrLineCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, CodecError> {
        let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');

        match newline {
            Some(offset) => {
                let end = self.next_index + offset;
                self.next_index = 0;
                let line = buf.split_to(end + 1);
                let line = &line[..end];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                if line.len() > self.max_length {
                    return Err(CodecError::LineTooLong {
                        limit: self.max_length,
                    });
                }
                Ok(Some(clean(line)))
            }
            None if buf.len() > self.max_length => Err(CodecError::LineTooLong {
                limit: self.max_length,
            }),
            None => {
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, CodecError> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }

        // Last line without a terminator
        self.next_index = 0;
        let line = buf.split_to(buf.len());
        let line = line.strip_suffix(b"\r").unwrap_or(&line[..]);
        Ok(Some(clean(line)))
    }
}

fn clean(line: &[u8]) -> String {
    let start = line
        .iter()
        .position(|b| !LEFT_PAD.contains(b))
        .unwrap_or(line.len());
    String::from_utf8_lossy(&line[start..]).into_owned()
}
