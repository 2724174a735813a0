//! Delimiter framing for byte streams: each JSON document is followed by one
//! end-of-transmission byte (0x04).
//!
//! Some client socket libraries coalesce or split writes, so a document may
//! arrive across several reads and one read may hold several documents.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The end-of-transmission byte that terminates every document.
pub const EOT_CHAR: u8 = 0x04;

/// Codec yielding one UTF-8 document per delimiter.
///
/// Empty documents (two delimiters in a row) are yielded as empty strings so
/// the client can reject them like any other malformed input. Invalid UTF-8 is
/// replaced with U+FFFD rather than failing the stream.
#[derive(Debug, Clone, Default)]
pub struct EotCodec {
    /// Bytes already scanned for a delimiter.
    next_index: usize,
}

impl EotCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self { next_index: 0 }
    }
}

impl Decoder for EotCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(offset) = src[self.next_index..].iter().position(|b| *b == EOT_CHAR) else {
            self.next_index = src.len();
            return Ok(None);
        };

        let end = self.next_index + offset;
        self.next_index = 0;
        let mut frame = src.split_to(end + 1);
        frame.truncate(end);
        Ok(Some(String::from_utf8_lossy(&frame).into_owned()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // A trailing partial document is dropped with the connection.
        self.decode(src)
    }
}

impl Encoder<String> for EotCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(EOT_CHAR);
        Ok(())
    }
}
