//! Identity-path stream sanitizer.
//!
//! Some upstreams end their SSE with a malformed `data: null` frame instead
//! of the `data: [DONE]` sentinel. On the identity fast path nothing parses
//! the frames, so the rewrite happens at the byte level.

use futures::StreamExt;

use crate::dialect::ByteStream;

const MALFORMED_DONE: &str = "data: null";
const DONE: &str = "data: [DONE]";

/// Rewrite malformed end-of-stream frames, leaving everything else intact.
///
/// The rewrite is per chunk; upstreams emit the terminal frame as its own
/// chunk in practice, and a frame split across chunk boundaries passes
/// through unmodified rather than corrupted.
pub fn sanitize_stream(stream: ByteStream) -> ByteStream {
    let sanitized = stream.map(|chunk| {
        chunk.map(|bytes| {
            if bytes.len() <= 64
                && let Ok(text) = std::str::from_utf8(&bytes)
                && text.contains(MALFORMED_DONE)
            {
                return bytes::Bytes::from(text.replace(MALFORMED_DONE, DONE));
            }

            bytes
        })
    });

    Box::pin(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;

    async fn collect(stream: ByteStream) -> String {
        let chunks: Vec<_> = StreamExt::collect::<Vec<_>>(stream).await;
        chunks
            .into_iter()
            .map(|chunk| String::from_utf8(chunk.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn rewrites_null_sentinel() {
        let input: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"x\":1}\n\n")),
            Ok(Bytes::from_static(b"data: null\n\n")),
        ]));

        let output = collect(sanitize_stream(input)).await;
        assert_eq!(output, "data: {\"x\":1}\n\ndata: [DONE]\n\n");
    }

    #[tokio::test]
    async fn leaves_ordinary_frames_alone() {
        let input: ByteStream = Box::pin(stream::iter(vec![Ok(Bytes::from_static(
            b"data: {\"content\":\"null hypothesis\"}\n\n",
        ))]));

        let output = collect(sanitize_stream(input)).await;
        assert_eq!(output, "data: {\"content\":\"null hypothesis\"}\n\n");
    }
}
