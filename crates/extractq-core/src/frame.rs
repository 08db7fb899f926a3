//! Netstring framing.
//!
//! Each frame on the wire is `<decimal length>:<payload>,`. The payload is
//! opaque bytes, so delimiter bytes inside it need no escaping. The decoder
//! never buffers more than one maximum-sized frame ahead before it rejects
//! the stream.

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest inbound payload accepted unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const DELIMITER: u8 = b':';
const TERMINATOR: u8 = b',';

/// A [`Decoder`]/[`Encoder`] pair for netstring frames.
///
/// Decoding yields the raw payload of each frame as [`Bytes`]. Encoding
/// accepts anything that can be viewed as a byte slice.
#[derive(Debug, Clone, Copy)]
pub struct NetstringCodec {
    max_frame_bytes: usize,
    max_prefix_digits: usize,
}

impl NetstringCodec {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Creates a codec that rejects any frame announcing more than
    /// `max_frame_bytes` of payload.
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            max_prefix_digits: decimal_digits(max_frame_bytes),
        }
    }
}

impl Default for NetstringCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NetstringCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let Some(colon) = src.iter().position(|&b| b == DELIMITER) else {
            // Still reading the length prefix. Fail fast on garbage or on a
            // prefix that can only describe an oversized frame.
            if let Some(&bad) = src.iter().find(|b| !b.is_ascii_digit()) {
                return Err(Error::InvalidLength {
                    prefix: String::from_utf8_lossy(&[bad]).into_owned(),
                });
            }
            if src.len() > self.max_prefix_digits {
                let len = parse_prefix(src)?;
                if len > self.max_frame_bytes {
                    return Err(Error::FrameTooLarge {
                        len,
                        max: self.max_frame_bytes,
                    });
                }
                return Err(Error::InvalidLength {
                    prefix: String::from_utf8_lossy(src).into_owned(),
                });
            }
            return Ok(None);
        };

        let len = parse_prefix(&src[..colon])?;
        if len > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }

        let terminator_at = colon + 1 + len;
        if src.len() <= terminator_at {
            src.reserve(terminator_at + 1 - src.len());
            return Ok(None);
        }

        let found = src[terminator_at];
        if found != TERMINATOR {
            return Err(Error::MissingTerminator { found });
        }

        src.advance(colon + 1);
        let payload = src.split_to(len).freeze();
        src.advance(1);
        Ok(Some(payload))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::UnexpectedEof {
                buffered: buf.len(),
            }),
        }
    }
}

impl<T> Encoder<T> for NetstringCodec
where
    T: AsRef<[u8]>,
{
    type Error = Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        encode_frame(item.as_ref(), dst);
        Ok(())
    }
}

/// Appends `payload` to `dst` as a single netstring frame.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) {
    let prefix = payload.len().to_string();
    dst.reserve(prefix.len() + payload.len() + 2);
    dst.put_slice(prefix.as_bytes());
    dst.put_u8(DELIMITER);
    dst.put_slice(payload);
    dst.put_u8(TERMINATOR);
}

/// Parses an all-digit length prefix, saturating on overflow so oversized
/// prefixes surface as [`Error::FrameTooLarge`] rather than wrapping.
fn parse_prefix(digits: &[u8]) -> Result<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::InvalidLength {
            prefix: String::from_utf8_lossy(digits).into_owned(),
        });
    }
    Ok(digits.iter().fold(0_usize, |acc, d| {
        acc.saturating_mul(10).saturating_add(usize::from(d - b'0'))
    }))
}

const fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}
