//! Framing layer
//!
//! Reads and writes complete frames on a byte stream, using the header's
//! payload length to know how much to buffer before decoding.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CodecError, Packet, PacketType, WireBuffer, HEADER_SIZE, LEGACY_HEADER_SIZE};

/// Framing errors
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed packet: stream ended {0} bytes into a header")]
    ShortHeader(usize),

    #[error("Malformed packet: invalid payload length {0}")]
    InvalidLength(i32),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Truncated payload: expected {expected} bytes, received {received}")]
    TruncatedPayload { expected: usize, received: usize },

    #[error("Decode error: {0}")]
    Codec(#[from] CodecError),
}

impl FramingError {
    /// A frame that was fully read but failed to decode leaves the stream in
    /// sync; everything else does not.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FramingError::Codec(_))
    }
}

/// Fill `buf` from the reader, stopping early only at end of stream.
/// Returns the number of bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read one frame and decode it.
///
/// Returns `Ok(None)` on a clean end of stream (no bytes of a new header).
/// The legacy two-byte header is accepted only when the stream ends right
/// after it and the opcode names a packet type without fields.
pub async fn read_frame<R>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Packet>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let filled = read_full(reader, &mut header).await?;

    if filled == 0 {
        return Ok(None);
    }

    if filled < HEADER_SIZE {
        let legacy = filled == LEGACY_HEADER_SIZE
            && !PacketType::from_opcode(header[1]).carries_fields();
        if !legacy {
            return Err(FramingError::ShortHeader(filled));
        }
        tracing::trace!("Legacy short header for opcode {}", header[1]);
        let mut buf = WireBuffer::from_frame(&header[..LEGACY_HEADER_SIZE]);
        return Ok(Some(Packet::decode(&mut buf)?));
    }

    let length = (&header[2..]).get_i32();
    let payload = usize::try_from(length).map_err(|_| FramingError::InvalidLength(length))?;
    if payload > max_frame_size {
        return Err(FramingError::FrameTooLarge(payload, max_frame_size));
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload);
    frame.put_slice(&header);
    frame.resize(HEADER_SIZE + payload, 0);
    let received = read_full(reader, &mut frame[HEADER_SIZE..]).await?;
    if received < payload {
        return Err(FramingError::TruncatedPayload {
            expected: payload,
            received,
        });
    }

    tracing::trace!("Read frame: opcode {} with {} payload bytes", header[1], payload);
    let mut buf = WireBuffer::from(frame);
    Ok(Some(Packet::decode(&mut buf)?))
}

/// Writes one flushed frame per packet. Owns the encode buffer, so a single
/// writer per stream is enough to keep frames from interleaving.
pub struct FrameWriter<W> {
    writer: W,
    buffer: WireBuffer,
    max_frame_size: usize,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W, max_frame_size: usize) -> Self {
        Self {
            writer,
            buffer: WireBuffer::new(),
            max_frame_size,
        }
    }

    /// Encode, write and flush a single packet
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), FramingError> {
        self.buffer.clear();
        packet.encode_into(&mut self.buffer)?;
        let frame = self.buffer.flush()?;

        let payload = frame.len() - HEADER_SIZE;
        if payload > self.max_frame_size {
            return Err(FramingError::FrameTooLarge(payload, self.max_frame_size));
        }

        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        tracing::trace!("Wrote {} ({} bytes)", packet.packet_type(), frame.len());
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
