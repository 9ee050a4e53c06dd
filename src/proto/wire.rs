//! Length-prefixed message framing over async byte streams.
//!
//! Every codec message starts with a little-endian `u32` holding the total
//! message size, the size field itself included. That makes "read exactly one
//! message" possible without understanding the message body, which is all the
//! multiplexer needs: it moves whole messages between the wire and the
//! per-port channels without ever decoding them.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::MAX_MSG;

/// Read one complete message into `buf`, returning its total size.
///
/// `buf` must be at least [`MAX_MSG`] bytes. End-of-stream before a full
/// message, or a declared size outside `5..=buf.len()`, is an error; the
/// caller treats either as a dead transport.
pub async fn read_msg<R>(r: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    r.read_exact(&mut buf[..4]).await?;
    let size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if size < 5 || size > buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad message size {size}"),
        ));
    }
    r.read_exact(&mut buf[4..size]).await?;
    Ok(size)
}

/// Write one already-encoded message, optionally preceded by a port tag byte.
pub async fn write_msg<W>(w: &mut W, tag: Option<u8>, msg: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(tag) = tag {
        w.write_all(&[tag]).await?;
    }
    w.write_all(msg).await?;
    w.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::MAX_MSG;

    #[tokio::test]
    async fn round_trips_one_message() {
        let mut msg = vec![0u8; 12];
        msg[..4].copy_from_slice(&12u32.to_le_bytes());
        msg[4..].copy_from_slice(b"hello me");

        let (mut a, mut b) = tokio::io::duplex(64);
        write_msg(&mut a, Some(3), &msg).await.unwrap();

        let mut tag = [0u8; 1];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut tag)
            .await
            .unwrap();
        assert_eq!(tag[0], 3);

        let mut buf = vec![0u8; MAX_MSG];
        let n = read_msg(&mut b, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], &msg[..]);
    }

    #[tokio::test]
    async fn rejects_oversized_declaration() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bogus = (MAX_MSG as u32 + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bogus)
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_MSG];
        let err = read_msg(&mut b, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn eof_mid_message_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, &20u32.to_le_bytes())
            .await
            .unwrap();
        drop(a);

        let mut buf = vec![0u8; MAX_MSG];
        assert!(read_msg(&mut b, &mut buf).await.is_err());
    }
}
