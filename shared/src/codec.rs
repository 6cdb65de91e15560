//! Zero-byte framing for JSON packets.
//!
//! Every packet on the wire is a JSON object followed by a single `0` byte.
//! There is no length prefix, so the reader buffers until it sees the
//! delimiter. A peer that closes the stream without a final delimiter still
//! gets its trailing bytes delivered as one last frame.

use crate::{OutboundPacket, ProtocolError, MAX_PACKET_SIZE, PACKET_DELIMITER};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Splits a byte stream into zero-delimited frames.
pub struct PacketReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Reads the next frame without its delimiter.
    ///
    /// Returns `Ok(None)` once the stream is exhausted. Partially read bytes
    /// stay buffered, so the future can be dropped inside `select!` and the
    /// call repeated later.
    pub async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        // One extra byte leaves room for the delimiter of a maximum size frame.
        let limit = (MAX_PACKET_SIZE + 1).saturating_sub(self.buf.len()) as u64;
        (&mut self.inner)
            .take(limit)
            .read_until(PACKET_DELIMITER, &mut self.buf)
            .await?;

        if self.buf.last() == Some(&PACKET_DELIMITER) {
            self.buf.pop();
            return Ok(Some(std::mem::take(&mut self.buf)));
        }

        if self.buf.len() > MAX_PACKET_SIZE {
            self.buf.clear();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ProtocolError::TooLarge,
            ));
        }

        if self.buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(std::mem::take(&mut self.buf)))
        }
    }
}

pub fn encode_packet(packet: &OutboundPacket) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(packet).map_err(ProtocolError::Encode)?;
    bytes.push(PACKET_DELIMITER);
    Ok(bytes)
}

/// Writes a raw payload followed by the delimiter.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(payload).await?;
    writer.write_all(&[PACKET_DELIMITER]).await?;
    writer.flush().await
}
