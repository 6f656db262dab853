use crate::error::LlmError;
use crate::normalize::RawChunk;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

struct SseState<S> {
    stream: S,
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
    eof: bool,
}

impl<S> SseState<S> {
    fn push_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }

    /// Ends the current frame. Frames without data are dropped.
    fn dispatch(&mut self) -> Option<RawChunk> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(RawChunk { event, data })
    }
}

/// Takes one complete line off the front of `buffer`.
///
/// Lines end with LF, CRLF or a lone CR. A CR at the very end of the buffer
/// is held back until the next read shows whether an LF follows. Bytes are
/// only decoded once the whole line is present, so a multibyte character
/// split across reads survives intact.
pub(crate) fn take_line(buffer: &mut BytesMut, eof: bool) -> Option<String> {
    let idx = buffer.iter().position(|b| *b == b'\n' || *b == b'\r')?;
    let terminator = if buffer[idx] == b'\r' {
        match buffer.get(idx + 1) {
            Some(b'\n') => 2,
            Some(_) => 1,
            None if eof => 1,
            None => return None,
        }
    } else {
        1
    };
    let line = buffer.split_to(idx);
    buffer.advance(terminator);
    Some(String::from_utf8_lossy(&line).into_owned())
}

/// Splits an SSE byte stream into frames.
///
/// Frames without `data:` lines are skipped, as are `:` comments. A trailing
/// frame with no blank line after it is still emitted when the body ends.
pub fn decode_sse<S, E>(
    bytes_stream: S,
) -> impl Stream<Item = Result<RawChunk, LlmError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = SseState {
        stream: bytes_stream,
        buffer: BytesMut::new(),
        event: None,
        data: Vec::new(),
        eof: false,
    };
    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            while let Some(line) = take_line(&mut st.buffer, st.eof) {
                if line.is_empty() {
                    if let Some(chunk) = st.dispatch() {
                        return Some((Ok(chunk), st));
                    }
                    continue;
                }
                st.push_line(&line);
            }

            if st.eof {
                if !st.buffer.is_empty() {
                    let rest = st.buffer.split();
                    st.push_line(&String::from_utf8_lossy(&rest));
                }
                return st.dispatch().map(|chunk| (Ok(chunk), st));
            }

            match st.stream.next().await {
                Some(Ok(bytes)) => st.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    st.eof = true;
                    return Some((Err(LlmError::Http(e.to_string())), st));
                }
                None => st.eof = true,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    async fn frames(parts: Vec<Vec<u8>>) -> Vec<RawChunk> {
        let bytes = stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<_, std::io::Error>(Bytes::from(p))),
        );
        decode_sse(bytes)
            .map(|r| r.expect("frame decodes"))
            .collect()
            .await
    }

    fn parts(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[tokio::test]
    async fn frames_split_across_byte_chunks() {
        let out = frames(parts(&[
            "data: {\"a\":",
            "1}\n\nevent: message_stop\r\ndata: {}\r\n\r\n",
            ": keep-alive\n\n",
            "data: [DONE]",
        ]))
        .await;

        assert_eq!(
            out,
            vec![
                RawChunk::data("{\"a\":1}"),
                RawChunk::named("message_stop", "{}"),
                RawChunk::data("[DONE]"),
            ]
        );
    }

    #[tokio::test]
    async fn multibyte_characters_split_across_reads_survive() {
        let body = "data: {\"t\":\"héllo 😀\"}\n\n".as_bytes();
        let cut = body
            .iter()
            .position(|b| *b == 0xC3)
            .expect("body has a two-byte character")
            + 1;
        // Also split the four-byte emoji in its middle.
        let emoji = body
            .iter()
            .position(|b| *b == 0xF0)
            .expect("body has a four-byte character")
            + 2;

        let out = frames(vec![
            body[..cut].to_vec(),
            body[cut..emoji].to_vec(),
            body[emoji..].to_vec(),
        ])
        .await;
        assert_eq!(out, vec![RawChunk::data("{\"t\":\"héllo 😀\"}")]);
    }

    #[tokio::test]
    async fn crlf_blank_line_split_between_cr_and_lf() {
        let out = frames(parts(&["data: a\r\n\r", "\ndata: b\r\n\r\n"])).await;
        assert_eq!(out, vec![RawChunk::data("a"), RawChunk::data("b")]);
    }

    #[tokio::test]
    async fn multi_line_data_is_joined() {
        let out = frames(parts(&["data: line one\ndata: line two\n\n"])).await;
        assert_eq!(out, vec![RawChunk::data("line one\nline two")]);
    }

    #[test]
    fn lone_cr_at_buffer_end_waits_for_more_input() {
        let mut buffer = BytesMut::from(&b"data: x\r"[..]);
        assert_eq!(take_line(&mut buffer, false), None);
        assert_eq!(take_line(&mut buffer, true).as_deref(), Some("data: x"));
        assert!(buffer.is_empty());
    }
}
