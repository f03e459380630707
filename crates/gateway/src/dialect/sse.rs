//! Minimal SSE text parsing for captured stream traces.
//!
//! Live byte streams are decoded with `eventsource-stream`; this module
//! covers the other direction of the same wire format, where a finalized
//! trace exists as one text blob and needs its `data:` payloads back.

/// Extract the `data:` payloads from raw SSE text, in order.
///
/// `event:` lines and `:` comments are skipped, consecutive `data:` lines of
/// one frame are joined with a newline per the SSE spec, and frames are
/// separated by blank lines.
pub(crate) fn data_frames(raw: &str) -> Vec<String> {
    let mut frames = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            if !current.is_empty() {
                frames.push(current.join("\n"));
                current.clear();
            }
            continue;
        }

        if line.starts_with(':') {
            continue;
        }

        if let Some(data) = line.strip_prefix("data:") {
            current.push(data.strip_prefix(' ').unwrap_or(data));
        }
        // Field lines other than data (event, id, retry) carry no payload we
        // aggregate; the JSON bodies of all three dialects are self-describing.
    }

    if !current.is_empty() {
        frames.push(current.join("\n"));
    }

    frames
}

/// Frame a JSON payload as a `data:` SSE frame.
pub(crate) fn data_frame(json: &str) -> bytes::Bytes {
    bytes::Bytes::from(format!("data: {json}\n\n"))
}

/// Frame a JSON payload as an `event:` + `data:` SSE frame.
pub(crate) fn event_frame(event: &str, json: &str) -> bytes::Bytes {
    bytes::Bytes::from(format!("event: {event}\ndata: {json}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_frames_on_blank_lines() {
        let raw = "data: {\"a\":1}\n\ndata: {\"b\":2}\n\n";
        assert_eq!(data_frames(raw), vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn skips_comments_and_event_lines() {
        let raw = ": keepalive\nevent: message_start\ndata: {\"a\":1}\n\n: ping\n\ndata: [DONE]\n\n";
        assert_eq!(data_frames(raw), vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn joins_multi_line_data() {
        let raw = "data: line one\ndata: line two\n\n";
        assert_eq!(data_frames(raw), vec!["line one\nline two"]);
    }

    #[test]
    fn tolerates_missing_trailing_separator() {
        let raw = "data: {\"a\":1}";
        assert_eq!(data_frames(raw), vec!["{\"a\":1}"]);
    }

    #[test]
    fn tolerates_crlf_line_endings() {
        let raw = "data: {\"a\":1}\r\n\r\ndata: {\"b\":2}\r\n\r\n";
        assert_eq!(data_frames(raw), vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn frames_payloads() {
        assert_eq!(&data_frame("{}")[..], b"data: {}\n\n");
        assert_eq!(&event_frame("ping", "{}")[..], b"event: ping\ndata: {}\n\n");
    }
}
