//! Length-and-sequence framing over the byte stream halves
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;

/// Frame header size: 3 bytes little-endian length plus 1 byte sequence
const HEADER_SIZE: usize = 4;
/// Largest payload a single frame can carry; anything bigger continues in
/// the next frame
const MAX_PAYLOAD: usize = 0xFF_FFFF;

/// Reads frames from the stream and reassembles multi-frame payloads
pub(crate) struct FrameReader<R> {
    /// Half of the stream to read from
    read: R,
    /// Buffer holding partially received frames
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Construct a reader over the read half of a stream
    pub(crate) fn new(read: R) -> Self {
        Self {
            read,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Fill the buffer until it holds at least `wanted` bytes
    async fn fill(&mut self, wanted: usize) -> Result<()> {
        while self.buf.remaining() < wanted {
            if self.read.read_buf(&mut self.buf).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )
                .into());
            }
        }
        Ok(())
    }

    /// Read one frame, returning its payload and sequence number
    async fn read_frame(&mut self) -> Result<(Bytes, u8)> {
        self.fill(HEADER_SIZE).await?;
        let header = u32::from_le_bytes(self.buf[..HEADER_SIZE].try_into().unwrap());
        let len = (header & 0xFF_FFFF) as usize;
        let seq = (header >> 24) as u8;
        self.fill(HEADER_SIZE + len).await?;
        self.buf.advance(HEADER_SIZE);
        Ok((self.buf.split_to(len).freeze(), seq))
    }

    /// Read the next payload, concatenating continuation frames.
    ///
    /// A frame of the maximum length continues in the next one; the
    /// terminal frame is the first with a shorter length. Returns the
    /// assembled payload and the sequence number of the terminal frame.
    pub(crate) async fn read_payload(&mut self) -> Result<(Bytes, u8)> {
        let (first, mut seq) = self.read_frame().await?;
        if first.len() < MAX_PAYLOAD {
            return Ok((first, seq));
        }
        let mut assembled = BytesMut::from(&first[..]);
        loop {
            let (next, next_seq) = self.read_frame().await?;
            seq = next_seq;
            let done = next.len() < MAX_PAYLOAD;
            assembled.put_slice(&next);
            if done {
                return Ok((assembled.freeze(), seq));
            }
        }
    }
}

/// Stamps sequence numbers and writes frames to the stream
pub(crate) struct FrameWriter<W> {
    /// Half of the stream to write to
    write: W,
    /// Scratch buffer the framed bytes are composed into
    buf: BytesMut,
    /// Sequence number the next outbound frame will carry
    next_seq: u8,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Construct a writer over the write half of a stream
    pub(crate) fn new(write: W) -> Self {
        Self {
            write,
            buf: BytesMut::with_capacity(4096),
            next_seq: 0,
        }
    }

    /// Reset the counter so the next outbound frame carries sequence 0.
    ///
    /// Called at every command boundary.
    pub(crate) fn reset_sequence(&mut self) {
        self.next_seq = 0;
    }

    /// Adopt the counter from an inbound frame header
    pub(crate) fn set_sequence_after(&mut self, seq: u8) {
        self.next_seq = seq.wrapping_add(1);
    }

    /// Frame and send one payload, splitting it into continuation frames
    /// when it does not fit a single one
    pub(crate) async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        let mut rest = payload;
        loop {
            let take = rest.len().min(MAX_PAYLOAD);
            self.buf
                .put_u32_le(take as u32 | ((self.next_seq as u32) << 24));
            self.buf.put_slice(&rest[..take]);
            self.next_seq = self.next_seq.wrapping_add(1);
            rest = &rest[take..];
            if take < MAX_PAYLOAD {
                break;
            }
        }
        self.write.write_all(&self.buf).await?;
        self.write.flush().await?;
        Ok(())
    }

    /// Shut the write half down, flushing anything buffered in the stream
    pub(crate) async fn close(&mut self) -> Result<()> {
        self.write.shutdown().await?;
        Ok(())
    }
}
