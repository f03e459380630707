//! Dialect-neutral message types for the dispatch pipeline.
//!
//! Every client dialect parses into these types and every provider dialect
//! formats out of them, making the pair the pivot of all transformation:
//!
//! ```text
//! client body → UnifiedRequest → provider body → provider → provider SSE
//!             → UnifiedStreamEvent sequence → client SSE
//! ```
//!
//! Round-trips through the pivot are lossless for every field both dialects
//! represent, best-effort otherwise. Fields a dialect cannot express are
//! dropped at format time, never at parse time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unified inference request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedRequest {
    /// Model identifier. On the inbound side this is the alias the client
    /// sent; the dispatcher overwrites it with the selected target's model.
    pub model: String,

    /// Conversation messages in order.
    pub messages: Vec<UnifiedMessage>,

    /// System instruction, held separately from the messages because two of
    /// the three dialects carry it out-of-band.
    pub system: Option<String>,

    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff.
    pub top_p: Option<f32>,

    /// Frequency penalty (chat dialect only).
    pub frequency_penalty: Option<f32>,

    /// Presence penalty (chat dialect only).
    pub presence_penalty: Option<f32>,

    /// Sequences that halt generation.
    pub stop_sequences: Option<Vec<String>>,

    /// Whether the response streams as SSE.
    pub stream: Option<bool>,

    /// Tools the model may call.
    pub tools: Option<Vec<UnifiedTool>>,

    /// How the model is allowed to use tools.
    pub tool_choice: Option<UnifiedToolChoice>,

    /// Reasoning directive: thinking mode, effort hint and token budget.
    pub reasoning: Option<UnifiedReasoning>,

    /// Structured output directive, carried opaquely between dialects that
    /// support one.
    pub response_format: Option<Value>,

    /// Requested output modalities, e.g. `["text", "image"]`.
    pub modalities: Option<Vec<String>>,

    /// Image generation settings, carried opaquely.
    pub image_config: Option<Value>,

    /// Token bias map (chat dialect only).
    pub logit_bias: Option<Value>,

    /// End-user identifier for provider-side abuse tracking.
    pub user: Option<String>,
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    /// Who sent the message.
    pub role: UnifiedRole,
    /// Message content, simple text or a sequence of typed parts.
    pub content: UnifiedContent,
    /// Tool calls attached to an assistant message (chat dialect keeps them
    /// outside the content; block dialects keep them inside).
    pub tool_calls: Option<Vec<UnifiedToolCall>>,
    /// For tool-role messages, the id of the call being answered.
    pub tool_call_id: Option<String>,
}

impl UnifiedMessage {
    /// A plain-text message with no tool data.
    pub fn text(role: UnifiedRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: UnifiedContent::Text(text.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Flatten the textual parts of the content into one string.
    pub fn text_content(&self) -> Option<String> {
        match &self.content {
            UnifiedContent::Text(text) => Some(text.clone()),
            UnifiedContent::Parts(parts) => {
                let text: Vec<&str> = parts
                    .iter()
                    .filter_map(|part| match part {
                        UnifiedPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();

                if text.is_empty() { None } else { Some(text.join("\n")) }
            }
        }
    }
}

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnifiedRole {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool execution result (chat dialect's dedicated role).
    Tool,
}

/// Message content: a bare string or typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnifiedContent {
    /// Simple text, the common case.
    Text(String),
    /// Typed content parts for tool interactions, images and reasoning.
    Parts(Vec<UnifiedPart>),
}

/// A typed content part.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnifiedPart {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// An image input.
    Image {
        /// Mime type, e.g. `image/png`.
        media_type: String,
        /// Base64 payload or URL.
        data: String,
    },
    /// Model-internal reasoning surfaced by the provider.
    Thinking {
        /// The reasoning text.
        text: String,
        /// Provider signature over the reasoning, when present.
        signature: Option<String>,
    },
    /// A tool invocation requested by the model.
    ToolUse {
        /// Call id, correlates with the matching result.
        id: String,
        /// Tool name.
        name: String,
        /// Arguments as parsed JSON.
        input: Value,
    },
    /// The result of executing a tool.
    ToolResult {
        /// Id of the call being answered.
        tool_use_id: String,
        /// Result payload as text.
        content: String,
        /// Whether execution failed.
        is_error: Option<bool>,
    },
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedTool {
    /// Unique tool name.
    pub name: String,
    /// What the tool does.
    pub description: Option<String>,
    /// JSON Schema of the accepted arguments.
    pub parameters: Value,
}

/// How the model may use tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedToolChoice {
    /// Model decides.
    Auto,
    /// Tools disabled for this request.
    None,
    /// Model must call at least one tool.
    Required,
    /// Model must call the named tool.
    Specific {
        /// The required tool name.
        name: String,
    },
}

/// Reasoning directive carried between dialects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedReasoning {
    /// Thinking mode as the dialect names it, e.g. `enabled`, `adaptive`,
    /// `disabled`.
    pub mode: Option<String>,
    /// Effort hint, e.g. `low`, `medium`, `high`.
    pub effort: Option<String>,
    /// Token budget for reasoning.
    pub budget_tokens: Option<u32>,
}

/// A completed tool call on a request message or a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedToolCall {
    /// Call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments as a single JSON string. Streaming fragments are
    /// concatenated in arrival order to preserve wire fidelity.
    pub arguments: String,
}

/// An image produced by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedImage {
    /// Mime type.
    pub media_type: String,
    /// Base64 payload.
    pub data: String,
}

/// Unified completion response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedResponse {
    /// Completion id as the provider issued it.
    pub id: String,
    /// Model that generated the response.
    pub model: String,
    /// Unix timestamp of creation.
    pub created: u64,
    /// Text content, absent when the model only called tools.
    pub content: Option<String>,
    /// Reasoning content, when the provider exposes it.
    pub reasoning_content: Option<String>,
    /// Tool calls in wire order.
    pub tool_calls: Vec<UnifiedToolCall>,
    /// Generated images.
    pub images: Vec<UnifiedImage>,
    /// Why generation stopped.
    pub finish_reason: Option<UnifiedFinishReason>,
    /// Token accounting.
    pub usage: UnifiedUsage,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedFinishReason {
    /// Natural end of turn.
    Stop,
    /// Hit the max_tokens limit.
    Length,
    /// Output was filtered.
    ContentFilter,
    /// The model called tools.
    ToolCalls,
}

impl std::fmt::Display for UnifiedFinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::ToolCalls => "tool_calls",
        };
        f.write_str(name)
    }
}

/// Token usage in dialect-neutral terms.
///
/// `output_tokens` excludes reasoning tokens; dialects that fold reasoning
/// into their completion count split it apart at parse time and put it back
/// at format time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedUsage {
    /// Prompt-side tokens.
    pub input_tokens: u64,
    /// Generated tokens, reasoning excluded.
    pub output_tokens: u64,
    /// Total billed tokens.
    pub total_tokens: u64,
    /// Reasoning tokens, when the dialect reports them.
    pub reasoning_tokens: Option<u64>,
    /// Tokens served from prompt cache.
    pub cache_read_tokens: Option<u64>,
    /// Tokens written to prompt cache.
    pub cache_creation_tokens: Option<u64>,
}

/// One streaming delta event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedStreamEvent {
    /// Completion id, stable across the stream.
    pub id: String,
    /// Model generating the stream.
    pub model: String,
    /// Unix timestamp.
    pub created: u64,
    /// The incremental content.
    pub delta: UnifiedDelta,
    /// Present only on the final event of a choice.
    pub finish_reason: Option<UnifiedFinishReason>,
    /// Terminal usage block, present on the closing event when the dialect
    /// reports streamed usage.
    pub usage: Option<UnifiedUsage>,
}

/// Incremental content within a stream event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedDelta {
    /// Role, emitted once on the first event.
    pub role: Option<UnifiedRole>,
    /// Text fragment to append.
    pub content: Option<String>,
    /// Reasoning fragment to append.
    pub reasoning_content: Option<String>,
    /// Tool call fragments.
    pub tool_calls: Option<Vec<UnifiedToolCallDelta>>,
}

/// A tool call fragment within a stream event.
///
/// The first fragment for an index carries the id and name; later fragments
/// append to `arguments`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedToolCallDelta {
    /// Position in the response's tool call list.
    pub index: u32,
    /// Call id, on the opening fragment.
    pub id: Option<String>,
    /// Tool name, on the opening fragment.
    pub name: Option<String>,
    /// Argument fragment to append.
    pub arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_flattens_parts() {
        let message = UnifiedMessage {
            role: UnifiedRole::Assistant,
            content: UnifiedContent::Parts(vec![
                UnifiedPart::Text { text: "a".into() },
                UnifiedPart::ToolUse {
                    id: "call_1".into(),
                    name: "lookup".into(),
                    input: serde_json::json!({}),
                },
                UnifiedPart::Text { text: "b".into() },
            ]),
            tool_calls: None,
            tool_call_id: None,
        };

        assert_eq!(message.text_content().as_deref(), Some("a\nb"));
    }

    #[test]
    fn usage_defaults_to_zero() {
        let usage = UnifiedUsage::default();

        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.total_tokens, 0);
        assert!(usage.reasoning_tokens.is_none());
    }
}
