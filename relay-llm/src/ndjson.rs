use crate::error::LlmError;
use crate::normalize::RawChunk;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

/// Splits a newline-delimited JSON body into one chunk per non-blank line.
///
/// Bytes are buffered until a full line is present, then decoded.
pub fn decode_ndjson<S, E>(
    bytes_stream: S,
) -> impl Stream<Item = Result<RawChunk, LlmError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, BytesMut::new(), false),
        |(mut stream, mut buffer, mut eof)| async move {
            loop {
                if let Some(idx) = buffer.iter().position(|b| *b == b'\n') {
                    let raw = buffer.split_to(idx + 1);
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    return Some((Ok(RawChunk::data(line)), (stream, buffer, eof)));
                }

                if eof {
                    let raw = buffer.split();
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if line.is_empty() {
                        return None;
                    }
                    return Some((Ok(RawChunk::data(line)), (stream, buffer, eof)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Http(e.to_string())), (stream, buffer, true)));
                    }
                    None => eof = true,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    async fn lines(parts: Vec<Vec<u8>>) -> Vec<String> {
        let bytes = stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<_, std::io::Error>(Bytes::from(p))),
        );
        decode_ndjson(bytes)
            .map(|r| r.expect("line decodes").data)
            .collect()
            .await
    }

    #[tokio::test]
    async fn lines_are_split_across_chunks() {
        let out = lines(
            ["{\"a\":1}\n{\"b\"", ":2}\r\n\n", "{\"c\":3}"]
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect(),
        )
        .await;
        assert_eq!(out, vec!["{\"a\":1}", "{\"b\":2}", "{\"c\":3}"]);
    }

    #[tokio::test]
    async fn multibyte_characters_split_across_reads_survive() {
        let body = "{\"content\":\"naïve ☕\"}\n".as_bytes();
        let cut = body
            .iter()
            .position(|b| *b == 0xC3)
            .expect("body has a two-byte character")
            + 1;
        let out = lines(vec![body[..cut].to_vec(), body[cut..].to_vec()]).await;
        assert_eq!(out, vec!["{\"content\":\"naïve ☕\"}"]);
    }
}
