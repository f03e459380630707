//! Messages (Anthropic-style) dialect transformer.
//!
//! Content is block-structured (`text`, `tool_use`, `tool_result`,
//! `thinking`) and streams are framed as typed events between
//! `message_start` and `message_stop`. Both directions of stream handling
//! are stateful: decoding tracks which content block each delta belongs to,
//! encoding opens and closes blocks as the unified deltas switch kind.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    dialect::{invalid_request, sse, transform_error},
    error::GatewayResult,
    unified::{
        UnifiedContent, UnifiedDelta, UnifiedFinishReason, UnifiedMessage, UnifiedPart, UnifiedReasoning,
        UnifiedRequest, UnifiedResponse, UnifiedRole, UnifiedStreamEvent, UnifiedTool, UnifiedToolCall,
        UnifiedToolCallDelta, UnifiedToolChoice, UnifiedUsage,
    },
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<SystemField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<WireToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum SystemField {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SystemBlock {
    r#type: String,
    text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThinkingConfig {
    r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    budget_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: ToolResultContent,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageSource {
    r#type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ToolResultContent {
    Text(String),
    Blocks(Vec<ToolResultBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolResultBlock {
    r#type: String,
    text: String,
}

impl ToolResultContent {
    fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Blocks(blocks) => blocks
                .into_iter()
                .map(|block| block.text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireToolChoice {
    Auto,
    Any,
    None,
    Tool { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessagesResponse {
    id: String,
    r#type: String,
    role: String,
    content: Vec<ContentBlock>,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequence: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_creation_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_read_input_tokens: Option<u64>,
}

pub(crate) fn parse_request(raw: &[u8]) -> GatewayResult<UnifiedRequest> {
    let request: MessagesRequest = sonic_rs::from_slice(raw).map_err(invalid_request)?;
    Ok(request.into())
}

pub(crate) fn format_request(request: &UnifiedRequest) -> GatewayResult<Vec<u8>> {
    let wire = MessagesRequest::from(request);
    sonic_rs::to_vec(&wire).map_err(transform_error)
}

pub(crate) fn parse_response(raw: &[u8]) -> GatewayResult<UnifiedResponse> {
    let response: MessagesResponse = sonic_rs::from_slice(raw)
        .map_err(|e| crate::error::GatewayError::Transform(format!("Failed to parse messages response: {e}")))?;
    Ok(response.into())
}

pub(crate) fn format_response(response: &UnifiedResponse) -> GatewayResult<Vec<u8>> {
    let wire = MessagesResponse::from(response);
    sonic_rs::to_vec(&wire).map_err(transform_error)
}

pub(crate) fn parse_usage(raw: &[u8]) -> GatewayResult<UnifiedUsage> {
    let usage: WireUsage = sonic_rs::from_slice(raw)
        .map_err(|e| crate::error::GatewayError::Transform(format!("Failed to parse messages usage: {e}")))?;
    Ok(usage.into())
}

pub(crate) fn format_usage(usage: &UnifiedUsage) -> Vec<u8> {
    let wire = WireUsage::from(usage);
    sonic_rs::to_vec(&wire).unwrap_or_default()
}

fn parse_stop_reason(reason: &str) -> UnifiedFinishReason {
    match reason {
        "max_tokens" => UnifiedFinishReason::Length,
        "tool_use" => UnifiedFinishReason::ToolCalls,
        "refusal" => UnifiedFinishReason::ContentFilter,
        _ => UnifiedFinishReason::Stop,
    }
}

fn format_stop_reason(reason: UnifiedFinishReason) -> &'static str {
    match reason {
        UnifiedFinishReason::Stop => "end_turn",
        UnifiedFinishReason::Length => "max_tokens",
        UnifiedFinishReason::ContentFilter => "refusal",
        UnifiedFinishReason::ToolCalls => "tool_use",
    }
}

/// Anthropic requires max_tokens; used when the unified request has none.
const DEFAULT_MAX_TOKENS: u32 = 4096;

impl From<MessagesRequest> for UnifiedRequest {
    fn from(request: MessagesRequest) -> Self {
        let system = request.system.map(|system| match system {
            SystemField::Text(text) => text,
            SystemField::Blocks(blocks) => blocks
                .into_iter()
                .map(|block| block.text)
                .collect::<Vec<_>>()
                .join("\n"),
        });

        let reasoning = request.thinking.map(|thinking| UnifiedReasoning {
            mode: Some(thinking.r#type),
            effort: None,
            budget_tokens: thinking.budget_tokens,
        });

        Self {
            model: request.model,
            messages: request.messages.into_iter().map(UnifiedMessage::from).collect(),
            system,
            max_tokens: Some(request.max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            frequency_penalty: None,
            presence_penalty: None,
            stop_sequences: request.stop_sequences,
            stream: request.stream,
            tools: request.tools.map(|tools| {
                tools
                    .into_iter()
                    .map(|tool| UnifiedTool {
                        name: tool.name,
                        description: tool.description,
                        parameters: tool.input_schema,
                    })
                    .collect()
            }),
            tool_choice: request.tool_choice.map(|choice| match choice {
                WireToolChoice::Auto => UnifiedToolChoice::Auto,
                WireToolChoice::Any => UnifiedToolChoice::Required,
                WireToolChoice::None => UnifiedToolChoice::None,
                WireToolChoice::Tool { name } => UnifiedToolChoice::Specific { name },
            }),
            reasoning,
            response_format: None,
            modalities: None,
            image_config: None,
            logit_bias: None,
            user: request.metadata.and_then(|metadata| metadata.user_id),
        }
    }
}

impl From<WireMessage> for UnifiedMessage {
    fn from(message: WireMessage) -> Self {
        let role = match message.role.as_str() {
            "user" => UnifiedRole::User,
            _ => UnifiedRole::Assistant,
        };

        let content = match message.content {
            WireContent::Text(text) => UnifiedContent::Text(text),
            WireContent::Blocks(blocks) => {
                UnifiedContent::Parts(blocks.into_iter().map(UnifiedPart::from).collect())
            }
        };

        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

impl From<ContentBlock> for UnifiedPart {
    fn from(block: ContentBlock) -> Self {
        match block {
            ContentBlock::Text { text } => UnifiedPart::Text { text },
            ContentBlock::Image { source } => UnifiedPart::Image {
                media_type: source.media_type,
                data: source.data,
            },
            ContentBlock::Thinking { thinking, signature } => UnifiedPart::Thinking {
                text: thinking,
                signature,
            },
            ContentBlock::ToolUse { id, name, input } => UnifiedPart::ToolUse { id, name, input },
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => UnifiedPart::ToolResult {
                tool_use_id,
                content: content.into_text(),
                is_error,
            },
        }
    }
}

impl From<&UnifiedRequest> for MessagesRequest {
    fn from(request: &UnifiedRequest) -> Self {
        let messages = request.messages.iter().map(format_message).collect();

        let thinking = request.reasoning.as_ref().map(|reasoning| ThinkingConfig {
            r#type: reasoning.mode.clone().unwrap_or_else(|| "enabled".to_string()),
            budget_tokens: reasoning.budget_tokens,
        });

        Self {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: request.system.clone().map(SystemField::Text),
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop_sequences.clone(),
            stream: request.stream,
            metadata: request.user.clone().map(|user_id| Metadata { user_id: Some(user_id) }),
            tools: request.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|tool| WireTool {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        input_schema: tool.parameters.clone(),
                    })
                    .collect()
            }),
            tool_choice: request.tool_choice.as_ref().map(|choice| match choice {
                UnifiedToolChoice::Auto => WireToolChoice::Auto,
                UnifiedToolChoice::Required => WireToolChoice::Any,
                UnifiedToolChoice::None => WireToolChoice::None,
                UnifiedToolChoice::Specific { name } => WireToolChoice::Tool { name: name.clone() },
            }),
            thinking,
        }
    }
}

fn format_message(message: &UnifiedMessage) -> WireMessage {
    // Tool-role messages carry a chat-style tool result; they become user
    // messages holding a tool_result block.
    if message.role == UnifiedRole::Tool {
        let content = message.text_content().unwrap_or_default();

        return WireMessage {
            role: "user".to_string(),
            content: WireContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: ToolResultContent::Text(content),
                is_error: None,
            }]),
        };
    }

    let role = match message.role {
        UnifiedRole::Assistant => "assistant",
        _ => "user",
    };

    let mut blocks: Vec<ContentBlock> = Vec::new();

    match &message.content {
        UnifiedContent::Text(text) => {
            if message.tool_calls.is_none() {
                return WireMessage {
                    role: role.to_string(),
                    content: WireContent::Text(text.clone()),
                };
            }

            if !text.is_empty() {
                blocks.push(ContentBlock::Text { text: text.clone() });
            }
        }
        UnifiedContent::Parts(parts) => {
            for part in parts {
                blocks.push(match part {
                    UnifiedPart::Text { text } => ContentBlock::Text { text: text.clone() },
                    UnifiedPart::Image { media_type, data } => ContentBlock::Image {
                        source: ImageSource {
                            r#type: "base64".to_string(),
                            media_type: media_type.clone(),
                            data: data.clone(),
                        },
                    },
                    UnifiedPart::Thinking { text, signature } => ContentBlock::Thinking {
                        thinking: text.clone(),
                        signature: signature.clone(),
                    },
                    UnifiedPart::ToolUse { id, name, input } => ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    },
                    UnifiedPart::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => ContentBlock::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: ToolResultContent::Text(content.clone()),
                        is_error: *is_error,
                    },
                });
            }
        }
    }

    // Chat-style tool calls on the message surface as tool_use blocks.
    for call in message.tool_calls.iter().flatten() {
        let already_present = blocks
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolUse { id, .. } if id == &call.id));

        if !already_present {
            blocks.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: parse_arguments(&call.arguments),
            });
        }
    }

    WireMessage {
        role: role.to_string(),
        content: WireContent::Blocks(blocks),
    }
}

fn parse_arguments(arguments: &str) -> Value {
    if arguments.is_empty() {
        return Value::Object(serde_json::Map::new());
    }

    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

impl From<MessagesResponse> for UnifiedResponse {
    fn from(response: MessagesResponse) -> Self {
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();

        for block in response.content {
            match block {
                ContentBlock::Text { text } => content.push_str(&text),
                ContentBlock::Thinking { thinking, .. } => reasoning.push_str(&thinking),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(UnifiedToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                }),
                ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {}
            }
        }

        Self {
            id: response.id,
            model: response.model,
            created: 0,
            content: if content.is_empty() { None } else { Some(content) },
            reasoning_content: if reasoning.is_empty() { None } else { Some(reasoning) },
            tool_calls,
            images: Vec::new(),
            finish_reason: response.stop_reason.as_deref().map(parse_stop_reason),
            usage: response.usage.into(),
        }
    }
}

impl From<&UnifiedResponse> for MessagesResponse {
    fn from(response: &UnifiedResponse) -> Self {
        let mut content = Vec::new();

        if let Some(reasoning) = &response.reasoning_content {
            content.push(ContentBlock::Thinking {
                thinking: reasoning.clone(),
                signature: None,
            });
        }

        if let Some(text) = &response.content {
            content.push(ContentBlock::Text { text: text.clone() });
        }

        for call in &response.tool_calls {
            content.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: parse_arguments(&call.arguments),
            });
        }

        Self {
            id: response.id.clone(),
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: response.model.clone(),
            stop_reason: Some(
                format_stop_reason(response.finish_reason.unwrap_or(UnifiedFinishReason::Stop)).to_string(),
            ),
            stop_sequence: None,
            usage: WireUsage::from(&response.usage),
        }
    }
}

impl From<WireUsage> for UnifiedUsage {
    fn from(usage: WireUsage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.input_tokens + usage.output_tokens,
            reasoning_tokens: None,
            cache_read_tokens: usage.cache_read_input_tokens,
            cache_creation_tokens: usage.cache_creation_input_tokens,
        }
    }
}

impl From<&UnifiedUsage> for WireUsage {
    fn from(usage: &UnifiedUsage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_creation_input_tokens: usage.cache_creation_tokens,
            cache_read_input_tokens: usage.cache_read_tokens,
        }
    }
}

/// Streamed event payloads, discriminated by the `type` field the wire
/// carries inside the data frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: StreamMessageStart },
    ContentBlockStart { index: u32, content_block: StreamBlockStart },
    ContentBlockDelta { index: u32, delta: StreamBlockDelta },
    ContentBlockStop {},
    MessageDelta { delta: StreamMessageDelta, usage: Option<WireUsage> },
    MessageStop {},
    Ping {},
    Error { error: StreamError },
}

#[derive(Debug, Deserialize)]
struct StreamMessageStart {
    id: String,
    model: String,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamBlockStart {
    Text {},
    Thinking {},
    ToolUse { id: String, name: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamBlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta {},
}

#[derive(Debug, Deserialize)]
struct StreamMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    r#type: String,
    message: String,
}

/// Decodes messages-dialect frames into unified events.
#[derive(Default)]
pub(crate) struct StreamDecoder {
    id: String,
    model: String,
    input_tokens: u64,
    cache_read_tokens: Option<u64>,
    cache_creation_tokens: Option<u64>,
    /// Wire block index → unified tool call index.
    tool_indices: HashMap<u32, u32>,
    tool_count: u32,
}

impl StreamDecoder {
    pub(crate) fn parse_frame(&mut self, data: &str) -> Option<UnifiedStreamEvent> {
        let event: StreamEvent = match sonic_rs::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Failed to parse messages streaming event: {e}");
                return None;
            }
        };

        match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;

                if let Some(usage) = message.usage {
                    self.input_tokens = usage.input_tokens;
                    self.cache_read_tokens = usage.cache_read_input_tokens;
                    self.cache_creation_tokens = usage.cache_creation_input_tokens;
                }

                Some(self.event(UnifiedDelta {
                    role: Some(UnifiedRole::Assistant),
                    ..Default::default()
                }))
            }
            StreamEvent::ContentBlockStart { index, content_block } => match content_block {
                StreamBlockStart::ToolUse { id, name } => {
                    let tool_index = self.tool_count;
                    self.tool_count += 1;
                    self.tool_indices.insert(index, tool_index);

                    Some(self.event(UnifiedDelta {
                        tool_calls: Some(vec![UnifiedToolCallDelta {
                            index: tool_index,
                            id: Some(id),
                            name: Some(name),
                            arguments: Some(String::new()),
                        }]),
                        ..Default::default()
                    }))
                }
                StreamBlockStart::Text {} | StreamBlockStart::Thinking {} => None,
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                StreamBlockDelta::TextDelta { text } => Some(self.event(UnifiedDelta {
                    content: Some(text),
                    ..Default::default()
                })),
                StreamBlockDelta::ThinkingDelta { thinking } => Some(self.event(UnifiedDelta {
                    reasoning_content: Some(thinking),
                    ..Default::default()
                })),
                StreamBlockDelta::InputJsonDelta { partial_json } => {
                    let tool_index = self.tool_indices.get(&index).copied()?;

                    Some(self.event(UnifiedDelta {
                        tool_calls: Some(vec![UnifiedToolCallDelta {
                            index: tool_index,
                            id: None,
                            name: None,
                            arguments: Some(partial_json),
                        }]),
                        ..Default::default()
                    }))
                }
                StreamBlockDelta::SignatureDelta {} => None,
            },
            StreamEvent::MessageDelta { delta, usage } => {
                let usage = usage.map(|wire| UnifiedUsage {
                    input_tokens: if wire.input_tokens > 0 {
                        wire.input_tokens
                    } else {
                        self.input_tokens
                    },
                    output_tokens: wire.output_tokens,
                    total_tokens: self.input_tokens.max(wire.input_tokens) + wire.output_tokens,
                    reasoning_tokens: None,
                    cache_read_tokens: wire.cache_read_input_tokens.or(self.cache_read_tokens),
                    cache_creation_tokens: wire.cache_creation_input_tokens.or(self.cache_creation_tokens),
                });

                let mut event = self.event(UnifiedDelta::default());
                event.finish_reason = delta.stop_reason.as_deref().map(parse_stop_reason);
                event.usage = usage;
                Some(event)
            }
            StreamEvent::ContentBlockStop {} | StreamEvent::MessageStop {} | StreamEvent::Ping {} => None,
            StreamEvent::Error { error } => {
                log::error!(
                    "Messages stream error event: {} - {}",
                    error.r#type,
                    error.message
                );
                None
            }
        }
    }

    fn event(&self, delta: UnifiedDelta) -> UnifiedStreamEvent {
        UnifiedStreamEvent {
            id: self.id.clone(),
            model: self.model.clone(),
            created: 0,
            delta,
            finish_reason: None,
            usage: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Thinking,
    Tool(u32),
}

/// Encodes unified events as messages-dialect SSE framing.
#[derive(Default)]
pub(crate) struct StreamEncoder {
    started: bool,
    closed: bool,
    id: String,
    model: String,
    next_block_index: u32,
    open_block: Option<OpenBlock>,
    /// Unified tool call index → wire block index.
    tool_blocks: HashMap<u32, u32>,
    finish_reason: Option<UnifiedFinishReason>,
    usage: Option<UnifiedUsage>,
}

impl StreamEncoder {
    pub(crate) fn encode(&mut self, event: &UnifiedStreamEvent) -> Vec<Bytes> {
        let mut frames = Vec::new();

        if !self.started {
            self.started = true;
            self.id = if event.id.is_empty() {
                format!("msg_{}", uuid::Uuid::new_v4().simple())
            } else {
                event.id.clone()
            };
            self.model = event.model.clone();

            let start = serde_json::json!({
                "type": "message_start",
                "message": {
                    "id": self.id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            });
            frames.push(sse::event_frame("message_start", &start.to_string()));
        }

        if let Some(content) = &event.delta.content {
            self.ensure_block(OpenBlock::Text, &mut frames, None);

            let delta = serde_json::json!({
                "type": "content_block_delta",
                "index": self.current_index(),
                "delta": {"type": "text_delta", "text": content}
            });
            frames.push(sse::event_frame("content_block_delta", &delta.to_string()));
        }

        if let Some(reasoning) = &event.delta.reasoning_content {
            self.ensure_block(OpenBlock::Thinking, &mut frames, None);

            let delta = serde_json::json!({
                "type": "content_block_delta",
                "index": self.current_index(),
                "delta": {"type": "thinking_delta", "thinking": reasoning}
            });
            frames.push(sse::event_frame("content_block_delta", &delta.to_string()));
        }

        for call in event.delta.tool_calls.iter().flatten() {
            if let Some(id) = &call.id {
                let name = call.name.clone().unwrap_or_default();
                self.ensure_block(OpenBlock::Tool(call.index), &mut frames, Some((id.clone(), name)));
            } else {
                self.ensure_block(OpenBlock::Tool(call.index), &mut frames, None);
            }

            if let Some(arguments) = &call.arguments
                && !arguments.is_empty()
            {
                let Some(block_index) = self.tool_blocks.get(&call.index).copied() else {
                    continue;
                };

                let delta = serde_json::json!({
                    "type": "content_block_delta",
                    "index": block_index,
                    "delta": {"type": "input_json_delta", "partial_json": arguments}
                });
                frames.push(sse::event_frame("content_block_delta", &delta.to_string()));
            }
        }

        if event.finish_reason.is_some() {
            self.finish_reason = event.finish_reason;
        }

        if event.usage.is_some() {
            self.usage = event.usage;
        }

        frames
    }

    pub(crate) fn finish(&mut self) -> Vec<Bytes> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;

        let mut frames = Vec::new();

        if !self.started {
            // Nothing streamed at all; emit a minimal valid envelope.
            self.started = true;
            let start = serde_json::json!({
                "type": "message_start",
                "message": {
                    "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            });
            frames.push(sse::event_frame("message_start", &start.to_string()));
        }

        self.close_open_block(&mut frames);

        let usage = self.usage.unwrap_or_default();
        let delta = serde_json::json!({
            "type": "message_delta",
            "delta": {
                "stop_reason": format_stop_reason(self.finish_reason.unwrap_or(UnifiedFinishReason::Stop)),
                "stop_sequence": null
            },
            "usage": WireUsage::from(&usage)
        });
        frames.push(sse::event_frame("message_delta", &delta.to_string()));

        frames.push(sse::event_frame("message_stop", r#"{"type":"message_stop"}"#));

        frames
    }

    fn current_index(&self) -> u32 {
        self.next_block_index.saturating_sub(1)
    }

    /// Open a block of the wanted kind unless it is already the open one.
    /// A tool fragment carrying an id always opens a fresh block.
    fn ensure_block(&mut self, wanted: OpenBlock, frames: &mut Vec<Bytes>, tool: Option<(String, String)>) {
        if self.open_block == Some(wanted) && tool.is_none() {
            return;
        }

        self.close_open_block(frames);

        let index = self.next_block_index;
        self.next_block_index += 1;

        let content_block = match (&wanted, tool) {
            (OpenBlock::Text, _) => serde_json::json!({"type": "text", "text": ""}),
            (OpenBlock::Thinking, _) => serde_json::json!({"type": "thinking", "thinking": ""}),
            (OpenBlock::Tool(tool_index), tool) => {
                self.tool_blocks.insert(*tool_index, index);
                let (id, name) =
                    tool.unwrap_or_else(|| (format!("toolu_{}", uuid::Uuid::new_v4().simple()), String::new()));
                serde_json::json!({"type": "tool_use", "id": id, "name": name, "input": {}})
            }
        };

        let start = serde_json::json!({
            "type": "content_block_start",
            "index": index,
            "content_block": content_block
        });
        frames.push(sse::event_frame("content_block_start", &start.to_string()));

        self.open_block = Some(wanted);
    }

    fn close_open_block(&mut self, frames: &mut Vec<Bytes>) {
        if self.open_block.take().is_some() {
            let stop = serde_json::json!({
                "type": "content_block_stop",
                "index": self.current_index()
            });
            frames.push(sse::event_frame("content_block_stop", &stop.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DialectTag;

    #[test]
    fn request_round_trip_is_idempotent() {
        let body = indoc::indoc! {r#"
            {
              "model": "claude-sonnet-4",
              "max_tokens": 1024,
              "system": "Be terse.",
              "messages": [
                {"role": "user", "content": "Hello"},
                {"role": "assistant", "content": [{"type": "text", "text": "Hi"}]}
              ],
              "stream": true,
              "thinking": {"type": "enabled", "budget_tokens": 2048}
            }
        "#};

        let first = DialectTag::Messages.parse_request(body.as_bytes()).unwrap();
        let formatted = DialectTag::Messages.format_request(&first).unwrap();
        let second = DialectTag::Messages.parse_request(&formatted).unwrap();

        assert_eq!(second.model, "claude-sonnet-4");
        assert_eq!(second.system.as_deref(), Some("Be terse."));
        assert_eq!(second.max_tokens, Some(1024));
        assert_eq!(second.messages.len(), 2);

        let reasoning = second.reasoning.unwrap();
        assert_eq!(reasoning.mode.as_deref(), Some("enabled"));
        assert_eq!(reasoning.budget_tokens, Some(2048));
    }

    #[test]
    fn usage_round_trip_preserves_cache_counts() {
        let usage = UnifiedUsage {
            input_tokens: 50,
            output_tokens: 20,
            total_tokens: 70,
            reasoning_tokens: None,
            cache_read_tokens: Some(12),
            cache_creation_tokens: Some(3),
        };

        let raw = format_usage(&usage);
        let back = parse_usage(&raw).unwrap();

        assert_eq!(back, usage);
    }

    #[test]
    fn tool_role_message_becomes_tool_result_block() {
        let request = UnifiedRequest {
            model: "m".into(),
            messages: vec![UnifiedMessage {
                role: UnifiedRole::Tool,
                content: UnifiedContent::Text("42".into()),
                tool_calls: None,
                tool_call_id: Some("call_1".into()),
            }],
            ..Default::default()
        };

        let raw = format_request(&request).unwrap();
        let wire: MessagesRequest = sonic_rs::from_slice(&raw).unwrap();

        assert_eq!(wire.messages[0].role, "user");
        assert!(matches!(
            &wire.messages[0].content,
            WireContent::Blocks(blocks) if matches!(
                blocks.first(),
                Some(ContentBlock::ToolResult { tool_use_id, .. }) if tool_use_id == "call_1"
            )
        ));
    }

    #[test]
    fn response_maps_blocks_to_unified_fields() {
        let body = indoc::indoc! {r#"
            {
              "id": "msg_1",
              "type": "message",
              "role": "assistant",
              "model": "claude-sonnet-4",
              "content": [
                {"type": "thinking", "thinking": "pondering"},
                {"type": "text", "text": "Answer"},
                {"type": "tool_use", "id": "toolu_1", "name": "add", "input": {"a": 1}}
              ],
              "stop_reason": "tool_use",
              "usage": {"input_tokens": 10, "output_tokens": 4, "cache_read_input_tokens": 2}
            }
        "#};

        let unified = parse_response(body.as_bytes()).unwrap();

        assert_eq!(unified.content.as_deref(), Some("Answer"));
        assert_eq!(unified.reasoning_content.as_deref(), Some("pondering"));
        assert_eq!(unified.tool_calls[0].name, "add");
        assert_eq!(unified.finish_reason, Some(UnifiedFinishReason::ToolCalls));
        assert_eq!(unified.usage.cache_read_tokens, Some(2));
        assert_eq!(unified.usage.total_tokens, 14);
    }

    #[test]
    fn decoder_translates_event_sequence() {
        let mut decoder = StreamDecoder::default();

        let start = decoder
            .parse_frame(
                r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","model":"claude","content":[],"usage":{"input_tokens":9,"output_tokens":0}}}"#,
            )
            .unwrap();
        assert_eq!(start.delta.role, Some(UnifiedRole::Assistant));
        assert_eq!(start.id, "msg_1");

        assert!(decoder
            .parse_frame(r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#)
            .is_none());

        let text = decoder
            .parse_frame(
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
            )
            .unwrap();
        assert_eq!(text.delta.content.as_deref(), Some("Hello"));

        assert!(decoder.parse_frame(r#"{"type":"ping"}"#).is_none());

        let done = decoder
            .parse_frame(
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"input_tokens":0,"output_tokens":3}}"#,
            )
            .unwrap();
        assert_eq!(done.finish_reason, Some(UnifiedFinishReason::Stop));

        let usage = done.usage.unwrap();
        assert_eq!(usage.input_tokens, 9);
        assert_eq!(usage.output_tokens, 3);
        assert_eq!(usage.total_tokens, 12);

        assert!(decoder.parse_frame(r#"{"type":"message_stop"}"#).is_none());
    }

    #[test]
    fn decoder_tracks_tool_block_indices() {
        let mut decoder = StreamDecoder::default();

        decoder
            .parse_frame(
                r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","model":"claude","content":[],"usage":{"input_tokens":1,"output_tokens":0}}}"#,
            )
            .unwrap();

        // The tool block arrives at wire index 1, after a text block.
        let start = decoder
            .parse_frame(
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"add"}}"#,
            )
            .unwrap();

        let calls = start.delta.tool_calls.unwrap();
        assert_eq!(calls[0].index, 0);
        assert_eq!(calls[0].id.as_deref(), Some("toolu_1"));

        let fragment = decoder
            .parse_frame(
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\":1}"}}"#,
            )
            .unwrap();

        let calls = fragment.delta.tool_calls.unwrap();
        assert_eq!(calls[0].index, 0);
        assert_eq!(calls[0].arguments.as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn encoder_frames_text_stream() {
        let mut encoder = StreamEncoder::default();

        let first = UnifiedStreamEvent {
            id: "resp_1".into(),
            model: "gpt-4o".into(),
            delta: UnifiedDelta {
                role: Some(UnifiedRole::Assistant),
                content: Some("Hel".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        let frames = encoder.encode(&first);
        let text: String = frames.iter().map(|f| String::from_utf8_lossy(f).into_owned()).collect();

        assert!(text.contains("event: message_start"));
        assert!(text.contains("content_block_start"));
        assert!(text.contains("text_delta"));

        let last = UnifiedStreamEvent {
            finish_reason: Some(UnifiedFinishReason::Stop),
            usage: Some(UnifiedUsage {
                input_tokens: 2,
                output_tokens: 1,
                total_tokens: 3,
                ..Default::default()
            }),
            ..Default::default()
        };
        encoder.encode(&last);

        let finish: String = encoder
            .finish()
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect();

        assert!(finish.contains("content_block_stop"));
        assert!(finish.contains(r#""stop_reason":"end_turn""#));
        assert!(finish.contains("message_stop"));
    }

    #[test]
    fn encoder_output_reconstructs() {
        let mut encoder = StreamEncoder::default();
        let mut captured = String::new();

        for fragment in ["{\"a", "\":1}"] {
            let event = UnifiedStreamEvent {
                id: "resp_1".into(),
                model: "m".into(),
                delta: UnifiedDelta {
                    tool_calls: Some(vec![UnifiedToolCallDelta {
                        index: 0,
                        id: (fragment.starts_with('{')).then(|| "call_1".to_string()),
                        name: (fragment.starts_with('{')).then(|| "add".to_string()),
                        arguments: Some(fragment.to_string()),
                    }]),
                    ..Default::default()
                },
                ..Default::default()
            };

            for frame in encoder.encode(&event) {
                captured.push_str(&String::from_utf8_lossy(&frame));
            }
        }

        for frame in encoder.finish() {
            captured.push_str(&String::from_utf8_lossy(&frame));
        }

        let response = DialectTag::Messages.reconstruct_from_stream(&captured).unwrap();

        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "call_1");
        assert_eq!(response.tool_calls[0].arguments, "{\"a\":1}");
    }
}
