//! Byte-level framing over a live msgpack stream.
//!
//! msgpack values are self-delimiting, so there is no length prefix: frames
//! are written back to back and the reader decodes one value at a time,
//! pulling more bytes from the stream whenever the buffered prefix is an
//! incomplete value.

use std::io::{self, Cursor};

use bytes::BytesMut;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::rpc::Message;

/// Upper bound on bytes buffered for a single, still incomplete frame.
const MAX_FRAME: usize = 64 * 1024 * 1024;

/// Bytes requested from the stream per read.
const READ_CHUNK: usize = 8 * 1024;

/// Serializes `message` into a standalone msgpack frame.
pub fn encode(message: Message) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &message.into_value())
        .map_err(|e| Error::Codec(format!("failed to encode frame: {e}")))?;
    Ok(buf)
}

/// Encodes `message` and writes it to `writer`, flushing afterwards.
pub async fn write_message<W>(writer: &mut W, message: Message) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Deepest container nesting accepted in one frame.
const MAX_DEPTH: usize = 1024;

/// Incremental frame decoder over an unbounded [`AsyncRead`].
///
/// Frame boundaries are found by walking msgpack headers as bytes arrive,
/// resuming where the previous read stopped, so a large frame is scanned
/// once and decoded once.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    scan: FrameScan,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            scan: FrameScan::default(),
        }
    }

    /// Reads the next complete msgpack value.
    ///
    /// Returns `Ok(None)` on a clean end of stream (no partial frame
    /// buffered). Cancel-safe: bytes already read stay buffered.
    pub async fn next_value(&mut self) -> Result<Option<Value>, Error> {
        loop {
            if let Some(value) = self.try_decode()? {
                return Ok(Some(value));
            }
            if self.buf.len() > MAX_FRAME {
                return Err(Error::Codec(format!(
                    "frame exceeds {} MiB limit",
                    MAX_FRAME / (1024 * 1024)
                )));
            }

            self.buf.reserve(READ_CHUNK.max(self.buf.len()));
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended inside a frame ({} bytes buffered)", self.buf.len()),
                )));
            }
        }
    }

    /// Decodes one value from the buffered bytes, if a whole one is there.
    fn try_decode(&mut self) -> Result<Option<Value>, Error> {
        let Some(len) = self.scan.frame_len(&self.buf)? else {
            return Ok(None);
        };

        let frame = self.buf.split_to(len);
        let mut cursor = Cursor::new(&frame[..]);
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| Error::Codec(format!("failed to decode frame: {e}")))?;
        Ok(Some(value))
    }
}

/// Progress through the headers of the frame at the front of the buffer.
#[derive(Debug, Default)]
struct FrameScan {
    /// Bytes of the current frame already walked.
    offset: usize,
    /// Items still expected at each open nesting level.
    remaining: Vec<u64>,
}

impl FrameScan {
    /// Length of the first complete value in `buf`, or `None` if more bytes
    /// are needed. Resets itself once a frame is found.
    fn frame_len(&mut self, buf: &[u8]) -> Result<Option<usize>, Error> {
        if self.remaining.is_empty() {
            self.offset = 0;
            self.remaining.push(1);
        }

        loop {
            match self.remaining.last() {
                None => break,
                Some(0) => {
                    self.remaining.pop();
                    continue;
                }
                Some(_) => {}
            }

            let Some(item) = item_header(&buf[self.offset..])? else {
                return Ok(None);
            };
            if let Some(top) = self.remaining.last_mut() {
                *top -= 1;
            }
            self.offset += item.len;
            if item.children > 0 {
                if self.remaining.len() >= MAX_DEPTH {
                    return Err(Error::Codec(format!(
                        "frame nests deeper than {MAX_DEPTH} levels"
                    )));
                }
                self.remaining.push(item.children);
            }
        }

        Ok(Some(std::mem::take(&mut self.offset)))
    }
}

/// One msgpack item: its own bytes (header plus any str/bin/ext payload)
/// and how many nested items follow it.
struct Item {
    len: usize,
    children: u64,
}

/// Reads the item at the start of `bytes`. `None` means it is not fully
/// buffered yet.
fn item_header(bytes: &[u8]) -> Result<Option<Item>, Error> {
    let Some(&marker) = bytes.first() else {
        return Ok(None);
    };

    // Width of the big-endian length field following the marker.
    let sized = |width: usize| -> Option<usize> {
        let field = bytes.get(1..1 + width)?;
        Some(field.iter().fold(0usize, |n, b| (n << 8) | usize::from(*b)))
    };
    let scalar = |len: usize| Item { len, children: 0 };

    let item = match marker {
        0x00..=0x7f | 0xc0 | 0xc2 | 0xc3 | 0xe0..=0xff => scalar(1),
        0x80..=0x8f => Item {
            len: 1,
            children: 2 * u64::from(marker & 0x0f),
        },
        0x90..=0x9f => Item {
            len: 1,
            children: u64::from(marker & 0x0f),
        },
        0xa0..=0xbf => scalar(1 + usize::from(marker & 0x1f)),
        0xcc | 0xd0 => scalar(2),
        0xcd | 0xd1 => scalar(3),
        0xca | 0xce | 0xd2 => scalar(5),
        0xcb | 0xcf | 0xd3 => scalar(9),
        0xd4 => scalar(3),
        0xd5 => scalar(4),
        0xd6 => scalar(6),
        0xd7 => scalar(10),
        0xd8 => scalar(18),
        0xc4 | 0xd9 => match sized(1) {
            Some(n) => scalar(2 + n),
            None => return Ok(None),
        },
        0xc5 | 0xda => match sized(2) {
            Some(n) => scalar(3 + n),
            None => return Ok(None),
        },
        0xc6 | 0xdb => match sized(4) {
            Some(n) => scalar(5 + n),
            None => return Ok(None),
        },
        0xc7 => match sized(1) {
            Some(n) => scalar(3 + n),
            None => return Ok(None),
        },
        0xc8 => match sized(2) {
            Some(n) => scalar(4 + n),
            None => return Ok(None),
        },
        0xc9 => match sized(4) {
            Some(n) => scalar(6 + n),
            None => return Ok(None),
        },
        0xdc | 0xde => match sized(2) {
            Some(n) => Item {
                len: 3,
                children: n as u64 * if marker == 0xde { 2 } else { 1 },
            },
            None => return Ok(None),
        },
        0xdd | 0xdf => match sized(4) {
            Some(n) => Item {
                len: 5,
                children: n as u64 * if marker == 0xdf { 2 } else { 1 },
            },
            None => return Ok(None),
        },
        0xc1 => {
            return Err(Error::Codec(
                "failed to decode frame: reserved marker 0xc1".to_string(),
            ))
        }
    };

    Ok((item.len <= bytes.len()).then_some(item))
}
