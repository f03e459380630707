//! Dialect transformers and the registry dispatching between them.
//!
//! One transformer per dialect, dispatched densely by tag. Each transformer
//! converts between its wire format and the unified pivot types for
//! requests, responses, usage blocks and streams.

pub(crate) mod chat;
pub(crate) mod gemini;
pub(crate) mod messages;
pub(crate) mod sse;

use std::collections::BTreeMap;
use std::pin::Pin;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{
    error::{GatewayError, GatewayResult},
    unified::{UnifiedRequest, UnifiedResponse, UnifiedStreamEvent, UnifiedToolCall, UnifiedUsage},
};

/// A stream of unified events, the decoded form of an SSE body.
pub type EventStream = Pin<Box<dyn Stream<Item = GatewayResult<UnifiedStreamEvent>> + Send>>;

/// A byte stream, the raw form of an SSE body.
pub type ByteStream = Pin<Box<dyn Stream<Item = GatewayResult<Bytes>> + Send>>;

/// The three supported API dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectTag {
    /// OpenAI-style chat completions.
    Chat,
    /// Anthropic-style messages.
    Messages,
    /// Google-style generateContent.
    Gemini,
}

impl DialectTag {
    /// Stable lowercase name for logs and records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Messages => "messages",
            Self::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for DialectTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<config::ApiDialect> for DialectTag {
    fn from(dialect: config::ApiDialect) -> Self {
        match dialect {
            config::ApiDialect::Chat => Self::Chat,
            config::ApiDialect::Messages => Self::Messages,
            config::ApiDialect::Gemini => Self::Gemini,
        }
    }
}

impl From<DialectTag> for config::ApiDialect {
    fn from(tag: DialectTag) -> Self {
        match tag {
            DialectTag::Chat => Self::Chat,
            DialectTag::Messages => Self::Messages,
            DialectTag::Gemini => Self::Gemini,
        }
    }
}

impl DialectTag {
    /// Parse a request body into the unified representation.
    ///
    /// Unknown fields are ignored; structural problems fail with an
    /// invalid-request error.
    pub fn parse_request(self, raw: &[u8]) -> GatewayResult<UnifiedRequest> {
        match self {
            Self::Chat => chat::parse_request(raw),
            Self::Messages => messages::parse_request(raw),
            Self::Gemini => gemini::parse_request(raw),
        }
    }

    /// Format a unified request as this dialect's native body.
    ///
    /// The output is guaranteed parseable by this dialect's own
    /// `parse_request`.
    pub fn format_request(self, request: &UnifiedRequest) -> GatewayResult<Vec<u8>> {
        match self {
            Self::Chat => chat::format_request(request),
            Self::Messages => messages::format_request(request),
            Self::Gemini => gemini::format_request(request),
        }
    }

    /// Parse a non-streaming response body.
    pub fn parse_response(self, raw: &[u8]) -> GatewayResult<UnifiedResponse> {
        match self {
            Self::Chat => chat::parse_response(raw),
            Self::Messages => messages::parse_response(raw),
            Self::Gemini => gemini::parse_response(raw),
        }
    }

    /// Format a unified response as this dialect's native body.
    pub fn format_response(self, response: &UnifiedResponse) -> GatewayResult<Vec<u8>> {
        match self {
            Self::Chat => chat::format_response(response),
            Self::Messages => messages::format_response(response),
            Self::Gemini => gemini::format_response(response),
        }
    }

    /// Parse a dialect usage block.
    pub fn parse_usage(self, raw: &[u8]) -> GatewayResult<UnifiedUsage> {
        match self {
            Self::Chat => chat::parse_usage(raw),
            Self::Messages => messages::parse_usage(raw),
            Self::Gemini => gemini::parse_usage(raw),
        }
    }

    /// Format unified usage as this dialect's usage block.
    pub fn format_usage(self, usage: &UnifiedUsage) -> Vec<u8> {
        match self {
            Self::Chat => chat::format_usage(usage),
            Self::Messages => messages::format_usage(usage),
            Self::Gemini => gemini::format_usage(usage),
        }
    }

    /// Decode an SSE byte stream into unified events.
    ///
    /// One event per `data:` frame, deltas never coalesced. Comments and
    /// keepalive pings are skipped; the stream ends on the dialect's end
    /// sentinel or EOF.
    pub fn transform_stream<S>(self, byte_stream: S) -> EventStream
    where
        S: Stream<Item = GatewayResult<Bytes>> + Send + 'static,
    {
        let events = byte_stream.eventsource();
        let parser = StreamParser::new(self);

        let stream = futures::stream::unfold(
            (Box::pin(events), parser),
            |(mut events, mut parser)| async move {
                loop {
                    let event = events.next().await?;

                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            log::warn!("SSE decode error in upstream stream: {e}");
                            continue;
                        }
                    };

                    if event.data == "[DONE]" {
                        return None;
                    }

                    if let Some(unified) = parser.parse_frame(&event.data) {
                        return Some((Ok(unified), (events, parser)));
                    }
                }
            },
        );

        Box::pin(stream)
    }

    /// Encode unified events as this dialect's SSE framing, terminated with
    /// the dialect's end sentinel.
    pub fn format_stream(self, events: EventStream) -> ByteStream {
        struct State {
            events: EventStream,
            encoder: StreamEncoder,
            queue: std::collections::VecDeque<Bytes>,
            finished: bool,
        }

        let state = State {
            events,
            encoder: StreamEncoder::new(self),
            queue: std::collections::VecDeque::new(),
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(frame) = state.queue.pop_front() {
                    return Some((Ok(frame), state));
                }

                if state.finished {
                    return None;
                }

                match state.events.next().await {
                    Some(Ok(event)) => {
                        state.queue.extend(state.encoder.encode(&event));
                    }
                    Some(Err(e)) => {
                        // A transformation failure is fatal for the stream;
                        // flush the sentinel so well-behaved clients stop
                        // waiting, then surface the error.
                        state.finished = true;
                        state.queue.extend(state.encoder.finish());
                        return Some((Err(e), state));
                    }
                    None => {
                        state.finished = true;
                        state.queue.extend(state.encoder.finish());
                    }
                }
            }
        });

        Box::pin(stream)
    }

    /// Aggregate captured SSE text into a single unified response.
    ///
    /// Text and reasoning deltas concatenate in order, tool-call fragments
    /// join by ascending index, the last finish reason and last usage block
    /// win. Returns `None` when no valid frame was observed.
    pub fn reconstruct_from_stream(self, raw_sse: &str) -> Option<UnifiedResponse> {
        let mut parser = StreamParser::new(self);
        let mut accumulator = StreamAccumulator::default();

        for data in sse::data_frames(raw_sse) {
            if data == "[DONE]" {
                break;
            }

            if let Some(event) = parser.parse_frame(&data) {
                accumulator.push(event);
            }
        }

        accumulator.finish()
    }
}

/// Per-dialect frame decoder state.
enum StreamParser {
    Chat,
    Messages(messages::StreamDecoder),
    Gemini(gemini::StreamDecoder),
}

impl StreamParser {
    fn new(tag: DialectTag) -> Self {
        match tag {
            DialectTag::Chat => Self::Chat,
            DialectTag::Messages => Self::Messages(messages::StreamDecoder::default()),
            DialectTag::Gemini => Self::Gemini(gemini::StreamDecoder::default()),
        }
    }

    /// Decode one `data:` frame. `None` means the frame carried nothing to
    /// forward (a ping, a bookkeeping event, or an unparseable frame).
    fn parse_frame(&mut self, data: &str) -> Option<UnifiedStreamEvent> {
        match self {
            Self::Chat => chat::parse_stream_frame(data),
            Self::Messages(decoder) => decoder.parse_frame(data),
            Self::Gemini(decoder) => decoder.parse_frame(data),
        }
    }
}

/// Per-dialect frame encoder state.
enum StreamEncoder {
    Chat,
    Messages(messages::StreamEncoder),
    Gemini(gemini::StreamEncoder),
}

impl StreamEncoder {
    fn new(tag: DialectTag) -> Self {
        match tag {
            DialectTag::Chat => Self::Chat,
            DialectTag::Messages => Self::Messages(messages::StreamEncoder::default()),
            DialectTag::Gemini => Self::Gemini(gemini::StreamEncoder::default()),
        }
    }

    fn encode(&mut self, event: &UnifiedStreamEvent) -> Vec<Bytes> {
        match self {
            Self::Chat => chat::encode_stream_event(event),
            Self::Messages(encoder) => encoder.encode(event),
            Self::Gemini(encoder) => encoder.encode(event),
        }
    }

    fn finish(&mut self) -> Vec<Bytes> {
        match self {
            Self::Chat => vec![Bytes::from_static(b"data: [DONE]\n\n")],
            Self::Messages(encoder) => encoder.finish(),
            Self::Gemini(encoder) => encoder.finish(),
        }
    }
}

/// Folds a unified event sequence back into a complete response.
#[derive(Default)]
struct StreamAccumulator {
    id: String,
    model: String,
    created: u64,
    content: String,
    reasoning: String,
    tool_calls: BTreeMap<u32, ToolCallParts>,
    finish_reason: Option<crate::unified::UnifiedFinishReason>,
    usage: Option<UnifiedUsage>,
    saw_frame: bool,
}

#[derive(Default)]
struct ToolCallParts {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAccumulator {
    fn push(&mut self, event: UnifiedStreamEvent) {
        self.saw_frame = true;

        if self.id.is_empty() && !event.id.is_empty() {
            self.id = event.id;
        }

        if self.model.is_empty() && !event.model.is_empty() {
            self.model = event.model;
        }

        if self.created == 0 {
            self.created = event.created;
        }

        if let Some(content) = event.delta.content {
            self.content.push_str(&content);
        }

        if let Some(reasoning) = event.delta.reasoning_content {
            self.reasoning.push_str(&reasoning);
        }

        for fragment in event.delta.tool_calls.into_iter().flatten() {
            let parts = self.tool_calls.entry(fragment.index).or_default();

            if let Some(id) = fragment.id {
                parts.id = id;
            }

            if let Some(name) = fragment.name {
                parts.name = name;
            }

            if let Some(arguments) = fragment.arguments {
                parts.arguments.push_str(&arguments);
            }
        }

        if event.finish_reason.is_some() {
            self.finish_reason = event.finish_reason;
        }

        if event.usage.is_some() {
            self.usage = event.usage;
        }
    }

    fn finish(self) -> Option<UnifiedResponse> {
        if !self.saw_frame {
            return None;
        }

        let tool_calls = self
            .tool_calls
            .into_values()
            .map(|parts| UnifiedToolCall {
                id: parts.id,
                name: parts.name,
                arguments: parts.arguments,
            })
            .collect();

        Some(UnifiedResponse {
            id: self.id,
            model: self.model,
            created: self.created,
            content: if self.content.is_empty() { None } else { Some(self.content) },
            reasoning_content: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning)
            },
            tool_calls,
            images: Vec::new(),
            finish_reason: self.finish_reason,
            usage: self.usage.unwrap_or_default(),
        })
    }
}

pub(crate) fn invalid_request(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::InvalidRequest(format!("Failed to parse request body: {e}"))
}

pub(crate) fn transform_error(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Transform(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unified::{UnifiedDelta, UnifiedFinishReason, UnifiedToolCallDelta};

    fn event(content: Option<&str>) -> UnifiedStreamEvent {
        UnifiedStreamEvent {
            id: "resp_1".into(),
            model: "gpt-4o".into(),
            created: 1_700_000_000,
            delta: UnifiedDelta {
                content: content.map(str::to_string),
                ..Default::default()
            },
            finish_reason: None,
            usage: None,
        }
    }

    #[test]
    fn accumulator_concatenates_in_order() {
        let mut accumulator = StreamAccumulator::default();
        accumulator.push(event(Some("Hello")));
        accumulator.push(event(Some(", ")));
        accumulator.push(event(Some("world")));

        let response = accumulator.finish().unwrap();
        assert_eq!(response.content.as_deref(), Some("Hello, world"));
        assert_eq!(response.id, "resp_1");
    }

    #[test]
    fn accumulator_joins_tool_call_fragments_by_index() {
        let mut accumulator = StreamAccumulator::default();

        let mut first = event(None);
        first.delta.tool_calls = Some(vec![UnifiedToolCallDelta {
            index: 1,
            id: Some("call_b".into()),
            name: Some("second".into()),
            arguments: Some("{}".into()),
        }]);
        accumulator.push(first);

        let mut second = event(None);
        second.delta.tool_calls = Some(vec![UnifiedToolCallDelta {
            index: 0,
            id: Some("call_a".into()),
            name: Some("first".into()),
            arguments: Some("{\"a".into()),
        }]);
        accumulator.push(second);

        let mut third = event(None);
        third.delta.tool_calls = Some(vec![UnifiedToolCallDelta {
            index: 0,
            id: None,
            name: None,
            arguments: Some("\":1}".into()),
        }]);
        third.finish_reason = Some(UnifiedFinishReason::ToolCalls);
        accumulator.push(third);

        let response = accumulator.finish().unwrap();

        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_calls[0].id, "call_a");
        assert_eq!(response.tool_calls[0].arguments, "{\"a\":1}");
        assert_eq!(response.tool_calls[1].id, "call_b");
        assert_eq!(response.finish_reason, Some(UnifiedFinishReason::ToolCalls));
    }

    #[test]
    fn accumulator_without_frames_yields_none() {
        assert!(StreamAccumulator::default().finish().is_none());
    }

    #[test]
    fn last_usage_block_wins() {
        let mut accumulator = StreamAccumulator::default();

        let mut first = event(Some("x"));
        first.usage = Some(UnifiedUsage {
            input_tokens: 1,
            output_tokens: 1,
            total_tokens: 2,
            ..Default::default()
        });
        accumulator.push(first);

        let mut last = event(None);
        last.usage = Some(UnifiedUsage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
            ..Default::default()
        });
        accumulator.push(last);

        let response = accumulator.finish().unwrap();
        assert_eq!(response.usage.total_tokens, 15);
    }
}
