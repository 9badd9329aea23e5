//! Binds the frame codec to a worker's byte streams.
//!
//! The transport owns the streams exclusively; the scheduler is its only
//! caller, which keeps frames from interleaving. `send` completes only once
//! the encoded bytes have been written *and* flushed, so a backpressured
//! pipe suspends the sender instead of silently losing bytes. `receive`
//! yields exactly one decoded payload per call; extra frames decoded from a
//! single read are buffered for subsequent calls.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{ChildStdin, ChildStdout};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{CodecError, FrameStyle, JsonCodec};
use crate::bridge::protocol::CheckRequest;

pub struct Transport<R, W> {
    reader: FramedRead<R, JsonCodec<serde_json::Value>>,
    writer: FramedWrite<W, JsonCodec<CheckRequest>>,
}

/// Transport over a spawned worker's stdio.
pub type WorkerTransport = Transport<ChildStdout, ChildStdin>;

impl<R, W> Transport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, style: FrameStyle) -> Self {
        Self {
            reader: FramedRead::new(reader, JsonCodec::new(style)),
            writer: FramedWrite::new(writer, JsonCodec::new(style)),
        }
    }

    /// Encode and write one request, waiting out any backpressure.
    pub async fn send(&mut self, request: CheckRequest) -> Result<(), CodecError> {
        self.writer.send(request).await
    }

    /// Wait for the next decoded payload. `None` means the worker closed
    /// its output stream. A frame with an undecodable body comes back as
    /// `Some(Err(..))` and the stream stays usable.
    pub async fn receive(&mut self) -> Option<Result<serde_json::Value, CodecError>> {
        match self.reader.next().await {
            Some(Ok(item)) => Some(item),
            Some(Err(e)) => Some(Err(e)),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::pin;
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex, split};
    use tokio_util::bytes::BytesMut;
    use tokio_util::codec::Encoder;

    #[tokio::test]
    async fn roundtrip_over_duplex() {
        let (near, far) = duplex(4096);
        let (near_r, near_w) = split(near);
        let (mut far_r, mut far_w) = split(far);

        let mut transport = Transport::new(near_r, near_w, FrameStyle::NdJson);
        let request = CheckRequest::new("print 'hi'");
        transport.send(request.clone()).await.unwrap();

        // The far end sees the encoded request and answers with a reply.
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            far_r.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        let seen: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(seen, serde_json::to_value(&request).unwrap());

        far_w
            .write_all(b"{\"success\":true}\n")
            .await
            .unwrap();
        let reply = transport.receive().await.unwrap().unwrap();
        assert_eq!(reply, json!({"success": true}));
    }

    #[tokio::test]
    async fn frames_from_one_read_queue_for_later_calls() {
        let (near, far) = duplex(4096);
        let (near_r, near_w) = split(near);
        let (_far_r, mut far_w) = split(far);

        let mut transport = Transport::new(near_r, near_w, FrameStyle::NdJson);
        far_w
            .write_all(b"{\"success\":true}\n{\"success\":false}\n")
            .await
            .unwrap();

        let first = transport.receive().await.unwrap().unwrap();
        let second = transport.receive().await.unwrap().unwrap();
        assert_eq!(first, json!({"success": true}));
        assert_eq!(second, json!({"success": false}));
    }

    #[tokio::test]
    async fn receive_reports_stream_close() {
        let (near, far) = duplex(64);
        let (near_r, near_w) = split(near);
        drop(far);

        let mut transport = Transport::new(near_r, near_w, FrameStyle::NdJson);
        assert!(transport.receive().await.is_none());
    }

    #[tokio::test]
    async fn send_suspends_until_pipe_drains_without_losing_bytes() {
        let (near, far) = duplex(64);
        let (near_r, near_w) = split(near);
        let (mut far_r, _far_w) = split(far);

        let request = CheckRequest::new("x".repeat(10_000));
        let mut expected = BytesMut::new();
        JsonCodec::new(FrameStyle::ContentLength)
            .encode(request.clone(), &mut expected)
            .unwrap();

        let mut transport = Transport::new(near_r, near_w, FrameStyle::ContentLength);
        let mut send_fut = pin!(transport.send(request));

        // Pipe capacity is far below the frame size: the send must stay
        // suspended until the far end drains.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut send_fut)
                .await
                .is_err(),
            "send completed while the pipe was full"
        );

        let expected_len = expected.len();
        let drain = tokio::spawn(async move {
            let mut buf = vec![0u8; expected_len];
            far_r.read_exact(&mut buf).await.unwrap();
            buf
        });

        send_fut.await.unwrap();
        let drained = drain.await.unwrap();
        assert_eq!(drained, expected.to_vec());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn roundtrip_through_real_subprocess() {
        use std::process::Stdio;

        // cat echoes our frames back verbatim, exercising real child pipes.
        let mut child = tokio::process::Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut transport = Transport::new(stdout, stdin, FrameStyle::NdJson);

        let request = CheckRequest::new("x = 1").on_save();
        transport.send(request.clone()).await.unwrap();

        let echoed = transport.receive().await.unwrap().unwrap();
        assert_eq!(echoed, serde_json::to_value(&request).unwrap());

        drop(transport);
        let _ = child.wait().await;
    }
}
