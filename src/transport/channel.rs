//! The authenticated peer data channel.
//!
//! Frames are newline-delimited JSON over any async byte stream (TCP in
//! production, an in-memory duplex in tests). The writer half is shared
//! and serializes sends per channel; a full outbound pipe suspends the
//! sender until the backpressure deadline, never spinning.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{
    split, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;

use crate::error::{Error, TransportError};
use crate::protocol::{encode_frame, ChannelMessage};

/// Largest accepted frame. A sealed 64 KiB chunk in base64 stays well
/// under this; anything bigger is hostile or corrupt.
pub const MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;

/// Object-safe byte stream the channel runs over.
pub trait DataStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DataStream for T {}

/// Inbound half; owned by the dispatcher loop.
pub struct ChannelReader {
    inner: BufReader<ReadHalf<Box<dyn DataStream>>>,
}

/// Outbound half; cloneable, sends are totally ordered per channel.
#[derive(Clone)]
pub struct ChannelWriter {
    inner: Arc<Mutex<WriteHalf<Box<dyn DataStream>>>>,
    send_timeout: Duration,
}

/// Split a stream into the channel halves.
pub fn open_channel(
    stream: Box<dyn DataStream>,
    send_timeout: Duration,
) -> (ChannelReader, ChannelWriter) {
    let (read, write) = split(stream);
    (
        ChannelReader {
            inner: BufReader::new(read),
        },
        ChannelWriter {
            inner: Arc::new(Mutex::new(write)),
            send_timeout,
        },
    )
}

impl ChannelReader {
    /// Read the next frame. `Ok(None)` means the peer closed the channel.
    pub async fn next_frame(&mut self) -> Result<Option<String>, TransportError> {
        let mut line = Vec::new();
        let mut limited = (&mut self.inner).take(MAX_FRAME_BYTES as u64);
        let read = limited.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        if !line.ends_with(b"\n") && line.len() >= MAX_FRAME_BYTES {
            return Err(TransportError::ChannelClosed);
        }
        let text = String::from_utf8_lossy(&line).trim_end().to_string();
        Ok(Some(text))
    }
}

impl ChannelWriter {
    /// Send one message. Sends are serialized; a pipe that stays full past
    /// the deadline surfaces as a backpressure timeout.
    pub async fn send(&self, message: &ChannelMessage) -> Result<(), Error> {
        let frame = encode_frame(message)?;
        let mut writer = self.inner.lock().await;
        let write = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        match tokio::time::timeout(self.send_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(TransportError::Io(err).into()),
            Err(_) => Err(TransportError::BackpressureTimeout.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_frame;

    fn pair() -> (ChannelReader, ChannelWriter, ChannelReader, ChannelWriter) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = open_channel(Box::new(a), Duration::from_secs(5));
        let (br, bw) = open_channel(Box::new(b), Duration::from_secs(5));
        (ar, aw, br, bw)
    }

    #[tokio::test]
    async fn test_send_and_receive_frames_in_order() {
        let (_ar, aw, mut br, _bw) = pair();

        for i in 0..5u64 {
            aw.send(&ChannelMessage::Ping {
                timestamp_ms: i,
                signature: String::new(),
            })
            .await
            .unwrap();
        }

        for i in 0..5u64 {
            let line = br.next_frame().await.unwrap().unwrap();
            match decode_frame(&line).unwrap() {
                ChannelMessage::Ping { timestamp_ms, .. } => assert_eq!(timestamp_ms, i),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_closed_channel_yields_none() {
        let (_ar, aw, mut br, _bw) = pair();
        drop(aw);
        drop(_ar);
        assert!(br.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_senders_never_interleave() {
        let (_ar, aw, mut br, _bw) = pair();

        let mut handles = Vec::new();
        for task in 0..4u64 {
            let writer = aw.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25u64 {
                    writer
                        .send(&ChannelMessage::Ping {
                            timestamp_ms: task * 1000 + i,
                            signature: "s".repeat(64),
                        })
                        .await
                        .unwrap();
                }
            }));
        }

        let mut received = 0;
        while received < 100 {
            let line = br.next_frame().await.unwrap().unwrap();
            decode_frame(&line).unwrap();
            received += 1;
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_backpressure_timeout_when_pipe_full() {
        let (a, _b_unread) = tokio::io::duplex(128);
        let (_ar, aw) = open_channel(Box::new(a), Duration::from_millis(50));

        // Nobody drains the other end; the tiny pipe fills at once.
        let message = ChannelMessage::Ping {
            timestamp_ms: 0,
            signature: "s".repeat(512),
        };
        let err = aw.send(&message).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::BackpressureTimeout)
        ));
    }
}
