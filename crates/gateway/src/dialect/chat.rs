//! Chat (OpenAI-style) dialect transformer.
//!
//! The wire quirk worth knowing: this dialect folds reasoning tokens into
//! `completion_tokens` and reports them separately under
//! `completion_tokens_details.reasoning_tokens`. Unified output tokens
//! exclude reasoning, so parsing subtracts and formatting adds back.

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
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<ChatStop>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<ChatStreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ChatToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logit_bias: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ChatStop {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<ChatContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ChatContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ChatContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ChatImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatImageUrl {
    url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatTool {
    r#type: String,
    function: ChatFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ChatToolChoice {
    Mode(String),
    Specific { r#type: String, function: ChatFunctionChoice },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatFunctionChoice {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatToolCall {
    id: String,
    r#type: String,
    function: ChatFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatResponse {
    id: String,
    object: String,
    created: u64,
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatChoice {
    index: u32,
    message: ChatResponseMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatResponseMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    completion_tokens_details: Option<CompletionTokensDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CompletionTokensDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PromptTokensDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    cached_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatStreamChunk {
    id: String,
    object: String,
    created: u64,
    model: String,
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatStreamChoice {
    index: u32,
    delta: ChatStreamDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChatStreamDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatToolCallDelta {
    index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function: Option<ChatFunctionDelta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChatFunctionDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<String>,
}

pub(crate) fn parse_request(raw: &[u8]) -> GatewayResult<UnifiedRequest> {
    let request: ChatRequest = sonic_rs::from_slice(raw).map_err(invalid_request)?;
    Ok(request.into())
}

pub(crate) fn format_request(request: &UnifiedRequest) -> GatewayResult<Vec<u8>> {
    let wire = ChatRequest::from(request);
    sonic_rs::to_vec(&wire).map_err(transform_error)
}

pub(crate) fn parse_response(raw: &[u8]) -> GatewayResult<UnifiedResponse> {
    let response: ChatResponse = sonic_rs::from_slice(raw)
        .map_err(|e| crate::error::GatewayError::Transform(format!("Failed to parse chat response: {e}")))?;
    Ok(response.into())
}

pub(crate) fn format_response(response: &UnifiedResponse) -> GatewayResult<Vec<u8>> {
    let wire = ChatResponse::from(response);
    sonic_rs::to_vec(&wire).map_err(transform_error)
}

pub(crate) fn parse_usage(raw: &[u8]) -> GatewayResult<UnifiedUsage> {
    let usage: ChatUsage = sonic_rs::from_slice(raw)
        .map_err(|e| crate::error::GatewayError::Transform(format!("Failed to parse chat usage: {e}")))?;
    Ok(usage.into())
}

pub(crate) fn format_usage(usage: &UnifiedUsage) -> Vec<u8> {
    let wire = ChatUsage::from(usage);
    sonic_rs::to_vec(&wire).unwrap_or_default()
}

pub(crate) fn parse_stream_frame(data: &str) -> Option<UnifiedStreamEvent> {
    let chunk: ChatStreamChunk = match sonic_rs::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            log::warn!("Failed to parse chat streaming chunk: {e}");
            return None;
        }
    };

    Some(chunk.into())
}

pub(crate) fn encode_stream_event(event: &UnifiedStreamEvent) -> Vec<Bytes> {
    let chunk = ChatStreamChunk::from(event);

    match sonic_rs::to_string(&chunk) {
        Ok(json) => vec![sse::data_frame(&json)],
        Err(e) => {
            log::error!("Failed to serialize chat streaming chunk: {e}");
            Vec::new()
        }
    }
}

fn parse_role(role: &str) -> UnifiedRole {
    match role {
        "system" | "developer" => UnifiedRole::System,
        "user" => UnifiedRole::User,
        "tool" => UnifiedRole::Tool,
        _ => UnifiedRole::Assistant,
    }
}

fn format_role(role: UnifiedRole) -> &'static str {
    match role {
        UnifiedRole::System => "system",
        UnifiedRole::User => "user",
        UnifiedRole::Assistant => "assistant",
        UnifiedRole::Tool => "tool",
    }
}

fn parse_finish_reason(reason: &str) -> UnifiedFinishReason {
    match reason {
        "length" | "max_tokens" => UnifiedFinishReason::Length,
        "content_filter" => UnifiedFinishReason::ContentFilter,
        "tool_calls" | "function_call" => UnifiedFinishReason::ToolCalls,
        _ => UnifiedFinishReason::Stop,
    }
}

impl From<ChatRequest> for UnifiedRequest {
    fn from(request: ChatRequest) -> Self {
        let mut system_parts = Vec::new();
        let mut messages = Vec::with_capacity(request.messages.len());

        for message in request.messages {
            if parse_role(&message.role) == UnifiedRole::System {
                if let Some(ChatContent::Text(text)) = message.content {
                    system_parts.push(text);
                }
                continue;
            }

            messages.push(UnifiedMessage::from(message));
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        };

        let reasoning = request.reasoning_effort.map(|effort| UnifiedReasoning {
            mode: None,
            effort: Some(effort),
            budget_tokens: None,
        });

        Self {
            model: request.model,
            messages,
            system,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
            stop_sequences: request.stop.map(|stop| match stop {
                ChatStop::One(s) => vec![s],
                ChatStop::Many(s) => s,
            }),
            stream: request.stream,
            tools: request
                .tools
                .map(|tools| tools.into_iter().map(UnifiedTool::from).collect()),
            tool_choice: request.tool_choice.map(UnifiedToolChoice::from),
            reasoning,
            response_format: request.response_format,
            modalities: request.modalities,
            image_config: request.image_config,
            logit_bias: request.logit_bias,
            user: request.user,
        }
    }
}

impl From<ChatMessage> for UnifiedMessage {
    fn from(message: ChatMessage) -> Self {
        let role = parse_role(&message.role);

        let mut content = match message.content {
            Some(ChatContent::Text(text)) => UnifiedContent::Text(text),
            Some(ChatContent::Parts(parts)) => {
                UnifiedContent::Parts(parts.into_iter().map(UnifiedPart::from).collect())
            }
            None => UnifiedContent::Parts(Vec::new()),
        };

        // Providers exposing reasoning on the message put it next to the
        // content; carry it as a thinking part.
        if let Some(reasoning) = message.reasoning_content {
            let thinking = UnifiedPart::Thinking {
                text: reasoning,
                signature: None,
            };

            content = match content {
                UnifiedContent::Text(text) => {
                    UnifiedContent::Parts(vec![thinking, UnifiedPart::Text { text }])
                }
                UnifiedContent::Parts(mut parts) => {
                    parts.insert(0, thinking);
                    UnifiedContent::Parts(parts)
                }
            };
        }

        let tool_calls = message.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|call| UnifiedToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect()
        });

        Self {
            role,
            content,
            tool_calls,
            tool_call_id: message.tool_call_id,
        }
    }
}

impl From<ChatContentPart> for UnifiedPart {
    fn from(part: ChatContentPart) -> Self {
        match part {
            ChatContentPart::Text { text } => UnifiedPart::Text { text },
            ChatContentPart::ImageUrl { image_url } => {
                // Data URLs carry the payload inline; anything else stays a
                // reference the provider fetches itself.
                if let Some((media_type, data)) = split_data_url(&image_url.url) {
                    UnifiedPart::Image {
                        media_type: media_type.to_string(),
                        data: data.to_string(),
                    }
                } else {
                    UnifiedPart::Image {
                        media_type: "text/uri-list".to_string(),
                        data: image_url.url,
                    }
                }
            }
        }
    }
}

fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some((media_type, data))
}

impl From<ChatTool> for UnifiedTool {
    fn from(tool: ChatTool) -> Self {
        Self {
            name: tool.function.name,
            description: tool.function.description,
            parameters: tool.function.parameters,
        }
    }
}

impl From<ChatToolChoice> for UnifiedToolChoice {
    fn from(choice: ChatToolChoice) -> Self {
        match choice {
            ChatToolChoice::Mode(mode) => match mode.as_str() {
                "none" => UnifiedToolChoice::None,
                "required" | "any" => UnifiedToolChoice::Required,
                _ => UnifiedToolChoice::Auto,
            },
            ChatToolChoice::Specific { function, .. } => UnifiedToolChoice::Specific { name: function.name },
        }
    }
}

impl From<&UnifiedRequest> for ChatRequest {
    fn from(request: &UnifiedRequest) -> Self {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Some(ChatContent::Text(system.clone())),
                reasoning_content: None,
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for message in &request.messages {
            messages.extend(format_message(message));
        }

        let stream_options = request
            .stream
            .unwrap_or(false)
            .then_some(ChatStreamOptions { include_usage: true });

        Self {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
            stop: request.stop_sequences.clone().map(ChatStop::Many),
            stream: request.stream,
            stream_options,
            tools: request.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|tool| ChatTool {
                        r#type: "function".to_string(),
                        function: ChatFunction {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: tool.parameters.clone(),
                        },
                    })
                    .collect()
            }),
            tool_choice: request.tool_choice.as_ref().map(|choice| match choice {
                UnifiedToolChoice::Auto => ChatToolChoice::Mode("auto".to_string()),
                UnifiedToolChoice::None => ChatToolChoice::Mode("none".to_string()),
                UnifiedToolChoice::Required => ChatToolChoice::Mode("required".to_string()),
                UnifiedToolChoice::Specific { name } => ChatToolChoice::Specific {
                    r#type: "function".to_string(),
                    function: ChatFunctionChoice { name: name.clone() },
                },
            }),
            reasoning_effort: request.reasoning.as_ref().and_then(|r| r.effort.clone()),
            response_format: request.response_format.clone(),
            modalities: request.modalities.clone(),
            image_config: request.image_config.clone(),
            logit_bias: request.logit_bias.clone(),
            user: request.user.clone(),
        }
    }
}

/// One unified message can expand to several chat messages: tool results
/// carried as content parts become dedicated tool-role messages.
fn format_message(message: &UnifiedMessage) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(1);

    let (content, reasoning, tool_results) = match &message.content {
        UnifiedContent::Text(text) => (Some(ChatContent::Text(text.clone())), None, Vec::new()),
        UnifiedContent::Parts(parts) => {
            let mut wire_parts = Vec::new();
            let mut reasoning = None;
            let mut tool_results = Vec::new();

            for part in parts {
                match part {
                    UnifiedPart::Text { text } => wire_parts.push(ChatContentPart::Text { text: text.clone() }),
                    UnifiedPart::Image { media_type, data } => {
                        let url = if media_type == "text/uri-list" {
                            data.clone()
                        } else {
                            format!("data:{media_type};base64,{data}")
                        };
                        wire_parts.push(ChatContentPart::ImageUrl {
                            image_url: ChatImageUrl { url },
                        });
                    }
                    UnifiedPart::Thinking { text, .. } => reasoning = Some(text.clone()),
                    UnifiedPart::ToolUse { .. } => {
                        // Emitted through the tool_calls field below.
                    }
                    UnifiedPart::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => tool_results.push((tool_use_id.clone(), content.clone())),
                }
            }

            let content = if wire_parts.is_empty() {
                None
            } else if wire_parts.len() == 1
                && let ChatContentPart::Text { text } = &wire_parts[0]
            {
                Some(ChatContent::Text(text.clone()))
            } else {
                Some(ChatContent::Parts(wire_parts))
            };

            (content, reasoning, tool_results)
        }
    };

    let mut tool_calls: Vec<ChatToolCall> = message
        .tool_calls
        .iter()
        .flatten()
        .map(|call| ChatToolCall {
            id: call.id.clone(),
            r#type: "function".to_string(),
            function: ChatFunctionCall {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        })
        .collect();

    // Tool use blocks embedded in the content also surface as tool_calls.
    if let UnifiedContent::Parts(parts) = &message.content {
        for part in parts {
            if let UnifiedPart::ToolUse { id, name, input } = part
                && !tool_calls.iter().any(|call| &call.id == id)
            {
                tool_calls.push(ChatToolCall {
                    id: id.clone(),
                    r#type: "function".to_string(),
                    function: ChatFunctionCall {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                });
            }
        }
    }

    if content.is_some() || !tool_calls.is_empty() || tool_results.is_empty() {
        out.push(ChatMessage {
            role: format_role(message.role).to_string(),
            content,
            reasoning_content: reasoning,
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            tool_call_id: message.tool_call_id.clone(),
        });
    }

    for (tool_use_id, result) in tool_results {
        out.push(ChatMessage {
            role: "tool".to_string(),
            content: Some(ChatContent::Text(result)),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: Some(tool_use_id),
        });
    }

    out
}

impl From<ChatResponse> for UnifiedResponse {
    fn from(response: ChatResponse) -> Self {
        let usage = response.usage.map(UnifiedUsage::from).unwrap_or_default();

        let Some(choice) = response.choices.into_iter().next() else {
            return Self {
                id: response.id,
                model: response.model,
                created: response.created,
                usage,
                ..Default::default()
            };
        };

        Self {
            id: response.id,
            model: response.model,
            created: response.created,
            content: choice.message.content,
            reasoning_content: choice.message.reasoning_content,
            tool_calls: choice
                .message
                .tool_calls
                .into_iter()
                .flatten()
                .map(|call| UnifiedToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect(),
            images: Vec::new(),
            finish_reason: choice.finish_reason.as_deref().map(parse_finish_reason),
            usage,
        }
    }
}

impl From<&UnifiedResponse> for ChatResponse {
    fn from(response: &UnifiedResponse) -> Self {
        let tool_calls: Vec<ChatToolCall> = response
            .tool_calls
            .iter()
            .map(|call| ChatToolCall {
                id: call.id.clone(),
                r#type: "function".to_string(),
                function: ChatFunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            })
            .collect();

        Self {
            id: response.id.clone(),
            object: "chat.completion".to_string(),
            created: response.created,
            model: response.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatResponseMessage {
                    role: "assistant".to_string(),
                    content: response.content.clone(),
                    reasoning_content: response.reasoning_content.clone(),
                    tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                },
                finish_reason: Some(
                    response
                        .finish_reason
                        .unwrap_or(UnifiedFinishReason::Stop)
                        .to_string(),
                ),
            }],
            usage: Some(ChatUsage::from(&response.usage)),
        }
    }
}

impl From<ChatUsage> for UnifiedUsage {
    fn from(usage: ChatUsage) -> Self {
        let reasoning_tokens = usage
            .completion_tokens_details
            .as_ref()
            .and_then(|details| details.reasoning_tokens);

        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage
                .completion_tokens
                .saturating_sub(reasoning_tokens.unwrap_or(0)),
            total_tokens: usage.total_tokens,
            reasoning_tokens,
            cache_read_tokens: usage
                .prompt_tokens_details
                .as_ref()
                .and_then(|details| details.cached_tokens),
            cache_creation_tokens: None,
        }
    }
}

impl From<&UnifiedUsage> for ChatUsage {
    fn from(usage: &UnifiedUsage) -> Self {
        Self {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens + usage.reasoning_tokens.unwrap_or(0),
            total_tokens: usage.total_tokens,
            completion_tokens_details: usage.reasoning_tokens.map(|reasoning_tokens| CompletionTokensDetails {
                reasoning_tokens: Some(reasoning_tokens),
            }),
            prompt_tokens_details: usage.cache_read_tokens.map(|cached_tokens| PromptTokensDetails {
                cached_tokens: Some(cached_tokens),
            }),
        }
    }
}

impl From<ChatStreamChunk> for UnifiedStreamEvent {
    fn from(chunk: ChatStreamChunk) -> Self {
        let usage = chunk.usage.map(UnifiedUsage::from);

        let Some(choice) = chunk.choices.into_iter().next() else {
            // Usage-only terminal frame.
            return Self {
                id: chunk.id,
                model: chunk.model,
                created: chunk.created,
                usage,
                ..Default::default()
            };
        };

        Self {
            id: chunk.id,
            model: chunk.model,
            created: chunk.created,
            delta: UnifiedDelta {
                role: choice.delta.role.as_deref().map(parse_role),
                content: choice.delta.content,
                reasoning_content: choice.delta.reasoning_content,
                tool_calls: choice.delta.tool_calls.map(|calls| {
                    calls
                        .into_iter()
                        .map(|call| UnifiedToolCallDelta {
                            index: call.index,
                            id: call.id,
                            name: call.function.as_ref().and_then(|f| f.name.clone()),
                            arguments: call.function.and_then(|f| f.arguments),
                        })
                        .collect()
                }),
            },
            finish_reason: choice.finish_reason.as_deref().map(parse_finish_reason),
            usage,
        }
    }
}

impl From<&UnifiedStreamEvent> for ChatStreamChunk {
    fn from(event: &UnifiedStreamEvent) -> Self {
        let delta = ChatStreamDelta {
            role: event.delta.role.map(|role| format_role(role).to_string()),
            content: event.delta.content.clone(),
            reasoning_content: event.delta.reasoning_content.clone(),
            tool_calls: event.delta.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|call| ChatToolCallDelta {
                        index: call.index,
                        id: call.id.clone(),
                        r#type: call.id.is_some().then(|| "function".to_string()),
                        function: Some(ChatFunctionDelta {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        }),
                    })
                    .collect()
            }),
        };

        Self {
            id: event.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: event.created,
            model: event.model.clone(),
            choices: vec![ChatStreamChoice {
                index: 0,
                delta,
                finish_reason: event.finish_reason.map(|reason| reason.to_string()),
            }],
            usage: event.usage.as_ref().map(|usage| ChatUsage {
                prompt_tokens: usage.input_tokens,
                completion_tokens: usage.output_tokens + usage.reasoning_tokens.unwrap_or(0),
                total_tokens: usage.total_tokens,
                completion_tokens_details: usage.reasoning_tokens.map(|reasoning_tokens| CompletionTokensDetails {
                    reasoning_tokens: Some(reasoning_tokens),
                }),
                prompt_tokens_details: None,
            }),
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
              "model": "smart",
              "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "user", "content": "Hello"}
              ],
              "max_tokens": 256,
              "temperature": 0.7,
              "stop": ["END"],
              "stream": true
            }
        "#};

        let first = DialectTag::Chat.parse_request(body.as_bytes()).unwrap();
        let formatted = DialectTag::Chat.format_request(&first).unwrap();
        let second = DialectTag::Chat.parse_request(&formatted).unwrap();

        assert_eq!(second.model, "smart");
        assert_eq!(second.system.as_deref(), Some("Be terse."));
        assert_eq!(second.messages.len(), 1);
        assert_eq!(second.max_tokens, Some(256));
        assert_eq!(second.stop_sequences, Some(vec!["END".to_string()]));
        assert_eq!(second.stream, Some(true));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let body = r#"{"model":"m","messages":[],"brand_new_field":42}"#;
        DialectTag::Chat.parse_request(body.as_bytes()).unwrap();
    }

    #[test]
    fn malformed_body_is_invalid_request() {
        let err = DialectTag::Chat.parse_request(b"{\"model\":").unwrap_err();
        assert_eq!(err.error_type(), "invalid_request_error");
    }

    #[test]
    fn usage_round_trip_preserves_counts() {
        let usage = UnifiedUsage {
            input_tokens: 100,
            output_tokens: 40,
            total_tokens: 160,
            reasoning_tokens: Some(20),
            cache_read_tokens: Some(30),
            cache_creation_tokens: None,
        };

        let raw = format_usage(&usage);
        let back = parse_usage(&raw).unwrap();

        assert_eq!(back, usage);
    }

    #[test]
    fn reasoning_tokens_are_subtracted_from_completion() {
        let raw = indoc::indoc! {r#"
            {
              "prompt_tokens": 10,
              "completion_tokens": 50,
              "total_tokens": 60,
              "completion_tokens_details": {"reasoning_tokens": 15}
            }
        "#};

        let usage = parse_usage(raw.as_bytes()).unwrap();

        assert_eq!(usage.output_tokens, 35);
        assert_eq!(usage.reasoning_tokens, Some(15));

        let formatted = format_usage(&usage);
        let wire: ChatUsage = sonic_rs::from_slice(&formatted).unwrap();
        assert_eq!(wire.completion_tokens, 50);
    }

    #[test]
    fn tool_results_expand_to_tool_role_messages() {
        let request = UnifiedRequest {
            model: "m".into(),
            messages: vec![UnifiedMessage {
                role: UnifiedRole::User,
                content: UnifiedContent::Parts(vec![UnifiedPart::ToolResult {
                    tool_use_id: "call_1".into(),
                    content: "42".into(),
                    is_error: None,
                }]),
                tool_calls: None,
                tool_call_id: None,
            }],
            ..Default::default()
        };

        let raw = format_request(&request).unwrap();
        let wire: ChatRequest = sonic_rs::from_slice(&raw).unwrap();

        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].role, "tool");
        assert_eq!(wire.messages[0].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn stream_frame_parses_tool_call_fragments() {
        let data = r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"add","arguments":"{\"a"}}]},"finish_reason":null}]}"#;

        let event = parse_stream_frame(data).unwrap();
        let calls = event.delta.tool_calls.unwrap();

        assert_eq!(calls[0].index, 0);
        assert_eq!(calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(calls[0].name.as_deref(), Some("add"));
        assert_eq!(calls[0].arguments.as_deref(), Some("{\"a"));
    }

    #[test]
    fn usage_only_frame_keeps_usage() {
        let data = r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"m","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":7,"total_tokens":12}}"#;

        let event = parse_stream_frame(data).unwrap();
        assert_eq!(event.usage.unwrap().total_tokens, 12);
        assert!(event.delta.content.is_none());
    }

    #[test]
    fn reconstruct_joins_split_tool_arguments() {
        let sse = concat!(
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"add\",\"arguments\":\"{\\\"a\"}}]}}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\":1\"}}]}}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        );

        let response = DialectTag::Chat.reconstruct_from_stream(sse).unwrap();

        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments, "{\"a\":1}");
        assert_eq!(response.finish_reason, Some(UnifiedFinishReason::ToolCalls));
    }

    #[test]
    fn response_round_trip() {
        let body = indoc::indoc! {r#"
            {
              "id": "chatcmpl-1",
              "object": "chat.completion",
              "created": 1700000000,
              "model": "gpt-4o",
              "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hi there"},
                "finish_reason": "stop"
              }],
              "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            }
        "#};

        let unified = parse_response(body.as_bytes()).unwrap();
        assert_eq!(unified.content.as_deref(), Some("Hi there"));
        assert_eq!(unified.usage.total_tokens, 5);

        let formatted = format_response(&unified).unwrap();
        let back = parse_response(&formatted).unwrap();
        assert_eq!(back.content, unified.content);
        assert_eq!(back.usage, unified.usage);
    }
}
