//! AWS event-stream framing (`application/vnd.amazon.eventstream`).
//!
//! Each message is `total_len | headers_len | prelude_crc | headers | payload |
//! message_crc`, all lengths big-endian u32. Only string headers are read;
//! other header types are skipped by size. CRCs are not checked.

use crate::error::LlmError;
use crate::normalize::RawChunk;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;
const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Default, PartialEq, Eq)]
struct Headers {
    message_type: Option<String>,
    event_type: Option<String>,
    exception_type: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
}

/// Takes one complete message off the front of `buffer`.
///
/// `Ok(None)` means more bytes are needed.
fn take_message(buffer: &mut BytesMut) -> Result<Option<RawChunk>, LlmError> {
    if buffer.len() < PRELUDE_LEN {
        return Ok(None);
    }
    let total = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    let headers_len = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
    if total < PRELUDE_LEN + TRAILER_LEN
        || total > MAX_MESSAGE_LEN
        || headers_len > total - PRELUDE_LEN - TRAILER_LEN
    {
        return Err(LlmError::StreamParse(format!(
            "invalid event-stream prelude (total={total}, headers={headers_len})"
        )));
    }
    if buffer.len() < total {
        return Ok(None);
    }

    let mut message = buffer.split_to(total).freeze();
    message.advance(PRELUDE_LEN);
    let headers = parse_headers(message.split_to(headers_len))?;
    let payload = message.split_to(message.len() - TRAILER_LEN);
    let payload = String::from_utf8_lossy(&payload).into_owned();

    Ok(Some(to_chunk(headers, payload)))
}

fn to_chunk(headers: Headers, payload: String) -> RawChunk {
    match headers.message_type.as_deref() {
        Some("exception") => {
            RawChunk::named(headers.exception_type.unwrap_or_default(), payload)
        }
        Some("error") => {
            let body = serde_json::json!({ "message": headers.error_message });
            RawChunk::named(headers.error_code.unwrap_or_default(), body.to_string())
        }
        _ => RawChunk {
            event: headers.event_type,
            data: payload,
        },
    }
}

fn parse_headers(mut raw: Bytes) -> Result<Headers, LlmError> {
    let truncated = || LlmError::StreamParse("truncated event-stream header".to_string());
    let mut headers = Headers::default();
    while raw.has_remaining() {
        let name_len = raw.get_u8() as usize;
        if raw.remaining() < name_len + 1 {
            return Err(truncated());
        }
        let name = raw.split_to(name_len);
        let value_len = match raw.get_u8() {
            0 | 1 => 0,
            2 => 1,
            3 => 2,
            4 => 4,
            5 | 8 => 8,
            9 => 16,
            6 | 7 => {
                if raw.remaining() < 2 {
                    return Err(truncated());
                }
                raw.get_u16() as usize
            }
            other => {
                return Err(LlmError::StreamParse(format!(
                    "unknown event-stream header type {other}"
                )));
            }
        };
        if raw.remaining() < value_len {
            return Err(truncated());
        }
        let value = raw.split_to(value_len);
        let text = || String::from_utf8_lossy(&value).into_owned();
        match &name[..] {
            b":message-type" => headers.message_type = Some(text()),
            b":event-type" => headers.event_type = Some(text()),
            b":exception-type" => headers.exception_type = Some(text()),
            b":error-code" => headers.error_code = Some(text()),
            b":error-message" => headers.error_message = Some(text()),
            _ => {}
        }
    }
    Ok(headers)
}

/// Splits an AWS event-stream body into one chunk per message.
///
/// Events are named by `:event-type`; exceptions by `:exception-type`.
pub fn decode_event_stream<S, E>(
    bytes_stream: S,
) -> impl Stream<Item = Result<RawChunk, LlmError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, BytesMut::new(), false),
        |(mut stream, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                match take_message(&mut buffer) {
                    Ok(Some(chunk)) => return Some((Ok(chunk), (stream, buffer, false))),
                    Ok(None) => {}
                    Err(e) => return Some((Err(e), (stream, buffer, true))),
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        let err = LlmError::Http(e.to_string());
                        return Some((Err(err), (stream, buffer, true)));
                    }
                    None => {
                        if !buffer.is_empty() {
                            tracing::debug!(
                                leftover = buffer.len(),
                                "event-stream body ended mid-message"
                            );
                        }
                        return None;
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use futures_util::stream;

    /// Encodes one message with string headers. CRC fields are zero.
    fn encode(headers: &[(&str, &str)], payload: &str) -> Vec<u8> {
        let mut head = BytesMut::new();
        for (name, value) in headers {
            head.put_u8(name.len() as u8);
            head.put_slice(name.as_bytes());
            head.put_u8(7);
            head.put_u16(value.len() as u16);
            head.put_slice(value.as_bytes());
        }
        let total = PRELUDE_LEN + head.len() + payload.len() + TRAILER_LEN;
        let mut out = BytesMut::new();
        out.put_u32(total as u32);
        out.put_u32(head.len() as u32);
        out.put_u32(0);
        out.put_slice(&head);
        out.put_slice(payload.as_bytes());
        out.put_u32(0);
        out.to_vec()
    }

    fn event(name: &str, payload: &str) -> Vec<u8> {
        encode(
            &[
                (":message-type", "event"),
                (":event-type", name),
                (":content-type", "application/json"),
            ],
            payload,
        )
    }

    async fn chunks(parts: Vec<Vec<u8>>) -> Vec<Result<RawChunk, LlmError>> {
        let bytes = stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<_, std::io::Error>(Bytes::from(p))),
        );
        decode_event_stream(bytes).collect().await
    }

    #[tokio::test]
    async fn messages_split_at_arbitrary_bytes() {
        let mut body = event("contentBlockDelta", r#"{"delta":{"text":"héllo"}}"#);
        body.extend(event("messageStop", r#"{"stopReason":"end_turn"}"#));
        let parts: Vec<Vec<u8>> = body.chunks(5).map(<[u8]>::to_vec).collect();

        let out: Vec<RawChunk> = chunks(parts)
            .await
            .into_iter()
            .map(|r| r.expect("message decodes"))
            .collect();
        assert_eq!(
            out,
            vec![
                RawChunk::named("contentBlockDelta", r#"{"delta":{"text":"héllo"}}"#),
                RawChunk::named("messageStop", r#"{"stopReason":"end_turn"}"#),
            ]
        );
    }

    #[tokio::test]
    async fn exceptions_are_named_by_exception_type() {
        let body = encode(
            &[
                (":message-type", "exception"),
                (":exception-type", "throttlingException"),
            ],
            r#"{"message":"slow down"}"#,
        );
        let out = chunks(vec![body]).await;
        assert_eq!(out.len(), 1);
        let chunk = out.into_iter().next().and_then(|r| r.ok()).expect("chunk");
        assert_eq!(chunk.event.as_deref(), Some("throttlingException"));
        assert_eq!(chunk.data, r#"{"message":"slow down"}"#);
    }

    #[tokio::test]
    async fn corrupt_prelude_ends_the_stream_with_an_error() {
        let mut body = vec![0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0, 0];
        body.extend(event("messageStop", "{}"));
        let out = chunks(vec![body]).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(LlmError::StreamParse(_))));
    }

    #[test]
    fn non_string_headers_are_skipped_by_size() {
        let mut head = BytesMut::new();
        head.put_u8(4);
        head.put_slice(b"flag");
        head.put_u8(0);
        head.put_u8(3);
        head.put_slice(b"num");
        head.put_u8(4);
        head.put_u32(7);
        head.put_u8(11);
        head.put_slice(b":event-type");
        head.put_u8(7);
        head.put_u16(8);
        head.put_slice(b"metadata");

        let headers = parse_headers(head.freeze()).expect("headers parse");
        assert_eq!(headers.event_type.as_deref(), Some("metadata"));
    }
}
