//! Length-delimited framing of protobuf messages over byte streams
//!
//! Each frame is a 4-byte big-endian length followed by the encoded message.

use crate::proto::Envelope;
use crate::{Error, Result, MAX_FRAME_SIZE};
use bytes::{BufMut, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write one framed message and flush
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let len = message.encoded_len();
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u32(len as u32);
    message.encode(&mut buf)?;

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message
///
/// Returns `Ok(None)` when the stream ends cleanly before a new frame.
pub async fn read_message<R, M>(reader: &mut R) -> Result<Option<M>>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(M::decode(buf.as_slice())?))
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, envelope).await
}

/// Read one envelope, checking version compatibility
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    match read_message::<_, Envelope>(reader).await? {
        Some(envelope) => {
            envelope.check_version()?;
            Ok(Some(envelope))
        }
        None => Ok(None),
    }
}
