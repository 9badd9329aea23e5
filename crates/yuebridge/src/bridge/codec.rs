//! Framed codec for worker communication.
//!
//! Two framing strategies behind one codec, chosen at session start and
//! never mixed mid-stream:
//!
//! - **NdJson**: one JSON object per line, `\n`-terminated.
//! - **ContentLength**: `Content-Length: N\r\n\r\n` header block followed by
//!   exactly N body bytes, no trailing separator.
//!
//! [`FrameCodec`] splits bytes into frame bodies; [`JsonCodec`] wraps it and
//! adds serde_json. Works over any AsyncRead/AsyncWrite (pipes, duplex).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (4 MiB) to prevent unbounded buffer growth.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Framing strategy for a worker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStyle {
    /// One JSON object per newline-terminated line.
    #[default]
    NdJson,
    /// `Content-Length` header block, blank-line terminator, counted body.
    ContentLength,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {0} bytes exceeds maximum of {MAX_FRAME_BYTES}")]
    Oversized(usize),

    /// Body bytes are not a valid payload. Raised only after the frame is
    /// consumed, so the next frame decodes from a clean boundary.
    #[error("malformed frame body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Byte-level framing: decodes inbound chunks into complete frame bodies and
/// encodes outbound bodies with the selected strategy.
///
/// Partial frames are retained in the inbound buffer; the buffer only
/// shrinks by whole consumed frames.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    style: FrameStyle,
}

impl FrameCodec {
    pub fn new(style: FrameStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> FrameStyle {
        self.style
    }

    fn decode_line(&self, src: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_FRAME_BYTES {
                    return Err(CodecError::Oversized(src.len()));
                }
                return Ok(None);
            };
            if pos > MAX_FRAME_BYTES {
                return Err(CodecError::Oversized(pos));
            }
            let mut line = src.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if !line.is_empty() {
                return Ok(Some(line));
            }
            // Blank line between frames; keep scanning.
        }
    }

    fn decode_counted(&self, src: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
        let header_end = match find(src, HEADER_TERMINATOR) {
            Some(pos) => pos,
            None => {
                if src.len() > MAX_FRAME_BYTES {
                    return Err(CodecError::Oversized(src.len()));
                }
                return Ok(None);
            }
        };

        // Missing or unparsable length is treated as length 0: the header
        // block is still consumed, and the empty body fails payload parsing
        // downstream instead of desynchronizing the stream.
        let declared = parse_content_length(&src[..header_end]);
        if declared > MAX_FRAME_BYTES {
            return Err(CodecError::Oversized(declared));
        }

        let body_start = header_end + HEADER_TERMINATOR.len();
        let total = body_start + declared;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        let body = frame.split_off(body_start);
        Ok(Some(body))
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.style {
            FrameStyle::NdJson => self.decode_line(src),
            FrameStyle::ContentLength => self.decode_counted(src),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if body.len() > MAX_FRAME_BYTES {
            return Err(CodecError::Oversized(body.len()));
        }
        match self.style {
            FrameStyle::NdJson => {
                dst.reserve(body.len() + 1);
                dst.put_slice(&body);
                dst.put_u8(b'\n');
            }
            FrameStyle::ContentLength => {
                let header = format!("Content-Length: {}\r\n\r\n", body.len());
                dst.reserve(header.len() + body.len());
                dst.put_slice(header.as_bytes());
                dst.put_slice(&body);
            }
        }
        Ok(())
    }
}

/// Codec that frames messages with the selected strategy and serializes
/// payloads with JSON.
///
/// Decoded items are themselves `Result`s: a frame whose body fails JSON
/// parsing yields `Ok(Some(Err(..)))` rather than a decoder error, because
/// `FramedRead` treats decoder errors as terminal and would end the stream.
/// The frame's bytes are consumed either way, so the next frame decodes
/// from a clean boundary. Only I/O failures and oversized frames surface as
/// decoder errors.
pub struct JsonCodec<T> {
    inner: FrameCodec,
    _phantom: PhantomData<T>,
}

impl<T> JsonCodec<T> {
    pub fn new(style: FrameStyle) -> Self {
        Self {
            inner: FrameCodec::new(style),
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new(FrameStyle::default())
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = Result<T, CodecError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(body) => match serde_json::from_slice(&body) {
                Ok(item) => Ok(Some(Ok(item))),
                Err(e) => Ok(Some(Err(CodecError::Body(e)))),
            },
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        tracing::trace!(json_size_bytes = json.len(), "encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Case-sensitive `Content-Length` key match; missing or unparsable values
/// fall back to 0.
fn parse_content_length(header: &[u8]) -> usize {
    let header = String::from_utf8_lossy(header);
    header
        .split("\r\n")
        .find_map(|line| line.strip_prefix("Content-Length:"))
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn drain_frames(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(Some(frame)) = codec.decode(buf) {
            out.push(frame.to_vec());
        }
        out
    }

    #[test]
    fn counted_two_frames_one_chunk() {
        let mut codec = FrameCodec::new(FrameStyle::ContentLength);
        let mut buf = BytesMut::from(&b"Content-Length: 5\r\n\r\nhelloContent-Length: 2\r\n\r\nok"[..]);

        let frames = drain_frames(&mut codec, &mut buf);
        assert_eq!(frames, vec![b"hello".to_vec(), b"ok".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn counted_chunking_invariance() {
        let wire = b"Content-Length: 5\r\n\r\nhelloContent-Length: 2\r\n\r\nok";

        let mut whole = BytesMut::from(&wire[..]);
        let expected = drain_frames(&mut FrameCodec::new(FrameStyle::ContentLength), &mut whole);

        for split in 0..=wire.len() {
            let mut codec = FrameCodec::new(FrameStyle::ContentLength);
            let mut buf = BytesMut::from(&wire[..split]);
            let mut frames = drain_frames(&mut codec, &mut buf);
            buf.extend_from_slice(&wire[split..]);
            frames.extend(drain_frames(&mut codec, &mut buf));
            assert_eq!(frames, expected, "split at byte {split}");
        }
    }

    #[test]
    fn line_chunking_invariance() {
        let wire = b"{\"a\":1}\n{\"b\":\"two\"}\n";

        let mut whole = BytesMut::from(&wire[..]);
        let expected = drain_frames(&mut FrameCodec::new(FrameStyle::NdJson), &mut whole);
        assert_eq!(expected.len(), 2);

        for split in 0..=wire.len() {
            let mut codec = FrameCodec::new(FrameStyle::NdJson);
            let mut buf = BytesMut::from(&wire[..split]);
            let mut frames = drain_frames(&mut codec, &mut buf);
            buf.extend_from_slice(&wire[split..]);
            frames.extend(drain_frames(&mut codec, &mut buf));
            assert_eq!(frames, expected, "split at byte {split}");
        }
    }

    #[test]
    fn counted_partial_header_waits() {
        let mut codec = FrameCodec::new(FrameStyle::ContentLength);
        let mut buf = BytesMut::from(&b"Content-Len"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn counted_partial_body_waits() {
        let mut codec = FrameCodec::new(FrameStyle::ContentLength);
        let mut buf = BytesMut::from(&b"Content-Length: 10\r\n\r\nhello"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"world");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"helloworld");
        assert!(buf.is_empty());
    }

    #[test]
    fn counted_missing_length_is_zero() {
        let mut codec = FrameCodec::new(FrameStyle::ContentLength);
        let mut buf = BytesMut::from(&b"Content-Type: application/json\r\n\r\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn counted_unparsable_length_is_zero() {
        let mut codec = FrameCodec::new(FrameStyle::ContentLength);
        let mut buf = BytesMut::from(&b"Content-Length: zero\r\n\r\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn counted_key_match_is_case_sensitive() {
        let mut codec = FrameCodec::new(FrameStyle::ContentLength);
        let mut buf = BytesMut::from(&b"content-length: 5\r\n\r\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn counted_ignores_extra_headers() {
        let mut codec = FrameCodec::new(FrameStyle::ContentLength);
        let mut buf =
            BytesMut::from(&b"Content-Type: application/json\r\nContent-Length: 2\r\n\r\nok"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"ok");
    }

    #[test]
    fn counted_oversized_declared_length_rejected() {
        let mut codec = FrameCodec::new(FrameStyle::ContentLength);
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut buf = BytesMut::from(header.as_bytes());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Oversized(_))
        ));
    }

    #[test]
    fn line_unterminated_input_is_bounded() {
        let mut codec = FrameCodec::new(FrameStyle::NdJson);
        let mut buf = BytesMut::new();
        buf.resize(MAX_FRAME_BYTES + 1, b'x');

        // No newline in sight: the buffer must not grow past the cap.
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Oversized(_))
        ));

        // Even with a terminator, a line over the cap is rejected.
        buf.extend_from_slice(b"\n");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Oversized(_))
        ));
    }

    #[test]
    fn line_skips_blank_lines() {
        let mut codec = FrameCodec::new(FrameStyle::NdJson);
        let mut buf = BytesMut::from(&b"\r\n\n{\"a\":1}\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"{\"a\":1}");
    }

    #[test]
    fn line_tolerates_crlf() {
        let mut codec = FrameCodec::new(FrameStyle::NdJson);
        let mut buf = BytesMut::from(&b"{\"a\":1}\r\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"{\"a\":1}");
    }

    #[test]
    fn line_rebuffers_partial_tail() {
        let mut codec = FrameCodec::new(FrameStyle::NdJson);
        let mut buf = BytesMut::from(&b"{\"a\":1}\n{\"b\""[..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"{\"b\"");
    }

    #[test]
    fn json_roundtrip_both_styles() {
        for style in [FrameStyle::NdJson, FrameStyle::ContentLength] {
            let mut codec = JsonCodec::<Value>::new(style);
            let mut buf = BytesMut::new();

            let payload = json!({"sourceCode": "print 'hi'", "isSaveEvent": true});
            codec.encode(payload.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();

            assert_eq!(decoded, payload);
            assert!(buf.is_empty(), "{style:?} left residue");
        }
    }

    #[test]
    fn json_content_length_counts_bytes_not_chars() {
        let mut codec = JsonCodec::<Value>::new(FrameStyle::ContentLength);
        let mut buf = BytesMut::new();

        let payload = json!({"k": "é"});
        codec.encode(payload.clone(), &mut buf).unwrap();

        let body = serde_json::to_vec(&payload).unwrap();
        let expected_header = format!("Content-Length: {}\r\n\r\n", body.len());
        assert!(buf.starts_with(expected_header.as_bytes()));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().unwrap(), payload);
    }

    #[test]
    fn json_bad_body_resynchronizes() {
        let mut codec = JsonCodec::<Value>::new(FrameStyle::ContentLength);
        let mut buf = BytesMut::from(
            &b"Content-Length: 9\r\n\r\nnot json!Content-Length: 8\r\n\r\n{\"ok\":1}"[..],
        );

        // The bad body surfaces as an item-level error, not a stream error,
        // and its frame is consumed; the next one decodes cleanly.
        let bad = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(bad, Err(CodecError::Body(_))));
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded, json!({"ok": 1}));
    }

    #[test]
    fn json_no_separator_after_counted_body() {
        let mut codec = JsonCodec::<Value>::new(FrameStyle::ContentLength);
        let mut buf = BytesMut::new();
        codec.encode(json!(1), &mut buf).unwrap();
        codec.encode(json!(2), &mut buf).unwrap();

        // Second header starts immediately after the first body.
        let wire = buf.clone();
        assert!(find(&wire, b"1Content-Length").is_some());

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().unwrap(), json!(1));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().unwrap(), json!(2));
    }
}
