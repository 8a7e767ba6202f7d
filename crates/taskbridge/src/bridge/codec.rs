//! Line codec for worker stdin/stdout.
//!
//! Uses AnyDelimiterCodec for `\n` framing + the `|` record format from
//! `protocol`. Lines are decoded as lossy UTF-8, so stray bytes from the
//! worker end up in a diagnostic instead of breaking the stream.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, etc).

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use super::protocol::{Request, WorkerMessage, parse_line, validate_payload};

/// Longest line accepted from the worker: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Codec that frames records with `\n` and parses them into [`WorkerMessage`]s.
#[derive(Debug)]
pub struct LineCodec {
    inner: AnyDelimiterCodec,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                b"\n".to_vec(),
                max_length,
            ),
        }
    }

    fn next_message(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> Result<Option<WorkerMessage>, io::Error> {
        loop {
            let chunk = if eof {
                self.inner.decode_eof(src)
            } else {
                self.inner.decode(src)
            };
            match chunk {
                Ok(Some(line)) => {
                    let text = String::from_utf8_lossy(&line);
                    match parse_line(&text) {
                        Some(message) => return Ok(Some(message)),
                        // Blank line, look at the next one.
                        None => continue,
                    }
                }
                Ok(None) => return Ok(None),
                // The inner codec keeps discarding up to the next newline, so
                // the stream stays usable.
                Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                    return Ok(Some(WorkerMessage::Oversized));
                }
                Err(AnyDelimiterCodecError::Io(e)) => return Err(e),
            }
        }
    }
}

impl Decoder for LineCodec {
    type Item = WorkerMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_message(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_message(src, true)
    }
}

impl Encoder<Request> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        validate_payload(&item.payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let line = item.to_line();
        tracing::trace!(line_bytes = line.len(), id = %item.id, "Encoding request");
        dst.extend_from_slice(line.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::CorrelationId;

    #[test]
    fn encode_request_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();

        let id = CorrelationId::new();
        codec
            .encode(Request::new(id, r#"["some data","more data"]"#), &mut buf)
            .unwrap();

        assert_eq!(
            std::str::from_utf8(&buf).unwrap(),
            format!("{id}|[\"some data\",\"more data\"]\n")
        );
    }

    #[test]
    fn encode_rejects_multiline_payload() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();

        let err = codec
            .encode(Request::new(CorrelationId::new(), "a\nb"), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_complete_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("0|REA");

        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"DY|\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(WorkerMessage::Ready));
    }

    #[test]
    fn decode_multiple_records_in_one_chunk() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("0|READY|\n\nhello\nid9|RESULT|42\n");

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(WorkerMessage::Ready));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(WorkerMessage::Diagnostic("hello".to_string()))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(WorkerMessage::Result {
                id: "id9".to_string(),
                payload: "42".to_string(),
            })
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_eof_flushes_unterminated_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("id1|RESULT|done");

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap(),
            Some(WorkerMessage::Result {
                id: "id1".to_string(),
                payload: "done".to_string(),
            })
        );
    }

    #[test]
    fn oversized_line_is_skipped() {
        let mut codec = LineCodec::with_max_length(16);
        let mut buf = BytesMut::from("this line is far too long for the codec\n0|READY|\n");

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(WorkerMessage::Oversized));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(WorkerMessage::Ready));
    }

    #[test]
    fn invalid_utf8_line_becomes_diagnostic() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"caf\xe9 log line\r\n0|READY|\n"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(WorkerMessage::Diagnostic("caf\u{FFFD} log line".to_string()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(WorkerMessage::Ready));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn invalid_utf8_in_result_payload_still_correlates() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"id1|RESULT|\xff\n"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(WorkerMessage::Result {
                id: "id1".to_string(),
                payload: "\u{FFFD}".to_string(),
            })
        );
    }
}
