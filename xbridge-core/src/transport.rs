//! Async framing over a byte stream: read one envelope, write one envelope, and the writer task.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::protocol::Envelope;
use crate::wire::{self, FrameDecodeError, LEN_SIZE};

/// Read the next frame. `Ok(None)` when the stream ends between frames.
pub async fn read_envelope<R>(
    reader: &mut R,
    max_frame_len: u32,
) -> Result<Option<Envelope>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > max_frame_len {
        return Err(FrameDecodeError::TooLarge.into());
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(wire::decode_envelope(&body)?))
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let frame = wire::encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Drain `rx` onto `writer` in order, then shut the write side down.
/// Stops at the first write error; later sends on the queue then fail.
pub async fn run_writer<W>(mut writer: W, mut rx: mpsc::Receiver<Envelope>) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = write_envelope(&mut writer, &envelope).await {
            tracing::debug!(kind = ?envelope.kind, error = %e, "write failed");
            return Err(e);
        }
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EnvelopeKind;

    #[tokio::test]
    async fn frames_survive_the_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = vec![
            Envelope::complete("bye").unwrap(),
            Envelope::file(vec![9u8; 3000]),
        ];
        let writer_sent = sent.clone();
        let writer = tokio::spawn(async move {
            for env in &writer_sent {
                write_envelope(&mut a, env).await.unwrap();
            }
        });
        for expected in &sent {
            let got = read_envelope(&mut b, wire::MAX_FRAME_LEN).await.unwrap();
            assert_eq!(got.as_ref(), Some(expected));
        }
        writer.await.unwrap();
        assert_eq!(read_envelope(&mut b, wire::MAX_FRAME_LEN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&(1024u32 * 1024).to_le_bytes()).await.unwrap();
        assert!(matches!(
            read_envelope(&mut b, 4096).await,
            Err(ChannelError::Frame(FrameDecodeError::TooLarge))
        ));
    }

    #[tokio::test]
    async fn garbage_body_is_malformed() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&4u32.to_le_bytes()).await.unwrap();
        a.write_all(&[0xff; 4]).await.unwrap();
        assert!(matches!(
            read_envelope(&mut b, 4096).await,
            Err(ChannelError::Frame(FrameDecodeError::Malformed(_)))
        ));
    }

    #[tokio::test]
    async fn writer_task_drains_then_closes() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(run_writer(a, rx));
        for i in 0..10u8 {
            tx.send(Envelope::file(vec![i; 10])).await.unwrap();
        }
        drop(tx);
        task.await.unwrap().unwrap();
        for i in 0..10u8 {
            let env = read_envelope(&mut b, 1024).await.unwrap().unwrap();
            assert_eq!(env.kind, EnvelopeKind::File);
            assert_eq!(env.payload, vec![i; 10]);
        }
        assert!(read_envelope(&mut b, 1024).await.unwrap().is_none());
    }
}
