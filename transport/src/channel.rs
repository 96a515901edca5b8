//! C2: the framed duplex channel between host proxy and guest init.
//!
//! Wire format: every message begins with a 5-byte header — a 32-bit
//! big-endian length of the payload followed by a 1-byte type tag — then
//! the payload bytes follow directly. No delimiters, no magic number.
//!
//! Two independent lanes share one byte stream: *messages* flow host→guest
//! (header + payload), *acks* flow guest→host (a single byte whose value is
//! the exit code being reported, 0 for an ordinary protocol turn). A short
//! read, or a type tag the receiver doesn't recognise, is fatal.

use runq_core::msg::{Msg, Msgtype};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("unknown message type {0:#x}")]
    UnknownType(u8),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

const HEADER_LEN: usize = 5;

/// Writes one framed message: `[len: u32 BE][type: u8][payload]`.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Msg) -> Result<()> {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&(msg.data.len() as u32).to_be_bytes());
    header[4] = msg.typ.as_u8();
    writer.write_all(&header).await?;
    writer.write_all(&msg.data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed message. A header or payload shorter than declared is
/// `ChannelError::ShortRead`; an unrecognised type tag is
/// `ChannelError::UnknownType`. Both are fatal to the caller.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Msg> {
    let mut header = [0u8; HEADER_LEN];
    read_exact_or_short(reader, &mut header).await?;

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let typ = Msgtype::from_u8(header[4]).ok_or(ChannelError::UnknownType(header[4]))?;

    let mut payload = vec![0u8; len];
    read_exact_or_short(reader, &mut payload).await?;

    Ok(Msg { typ, data: payload })
}

async fn read_exact_or_short<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let expected = buf.len();
    if expected == 0 {
        return Ok(());
    }
    let mut got = 0;
    while got < expected {
        let n = reader.read(&mut buf[got..]).await?;
        if n == 0 {
            return Err(ChannelError::ShortRead { expected, got });
        }
        got += n;
    }
    Ok(())
}

/// Writes one ack byte. `Signal` messages are fire-and-forget and never
/// acked; every other message is followed by exactly one ack byte before
/// the next message is sent.
pub async fn write_ack<W: AsyncWrite + Unpin>(writer: &mut W, code: u8) -> Result<()> {
    writer.write_all(&[code]).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one ack byte.
pub async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact_or_short(reader, &mut buf).await?;
    Ok(buf[0])
}
