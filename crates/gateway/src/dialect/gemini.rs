//! Gemini (Google-style) dialect transformer.
//!
//! Requests arrive at `/v1beta/models/{model}:{action}` so neither the model
//! nor the streaming flag lives in the body; the dispatcher injects both
//! after routing. Function calls carry no ids on this wire, so call ids are
//! synthesized when parsing and dropped when formatting. Streams have no end
//! sentinel, they simply close.

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
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDeclarations>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<ToolConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_budget: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_thoughts: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thought_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionDeclaration {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolConfig {
    function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionCallingConfig {
    mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_function_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage_metadata: Option<UsageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    thoughts_token_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cached_content_token_count: Option<u64>,
}

pub(crate) fn parse_request(raw: &[u8]) -> GatewayResult<UnifiedRequest> {
    let request: GeminiRequest = sonic_rs::from_slice(raw).map_err(invalid_request)?;
    Ok(request.into())
}

pub(crate) fn format_request(request: &UnifiedRequest) -> GatewayResult<Vec<u8>> {
    let wire = GeminiRequest::from(request);
    sonic_rs::to_vec(&wire).map_err(transform_error)
}

pub(crate) fn parse_response(raw: &[u8]) -> GatewayResult<UnifiedResponse> {
    let response: GeminiResponse = sonic_rs::from_slice(raw)
        .map_err(|e| crate::error::GatewayError::Transform(format!("Failed to parse gemini response: {e}")))?;
    Ok(response.into())
}

pub(crate) fn format_response(response: &UnifiedResponse) -> GatewayResult<Vec<u8>> {
    let wire = GeminiResponse::from(response);
    sonic_rs::to_vec(&wire).map_err(transform_error)
}

pub(crate) fn parse_usage(raw: &[u8]) -> GatewayResult<UnifiedUsage> {
    let usage: UsageMetadata = sonic_rs::from_slice(raw)
        .map_err(|e| crate::error::GatewayError::Transform(format!("Failed to parse gemini usage: {e}")))?;
    Ok(usage.into())
}

pub(crate) fn format_usage(usage: &UnifiedUsage) -> Vec<u8> {
    let wire = UsageMetadata::from(usage);
    sonic_rs::to_vec(&wire).unwrap_or_default()
}

fn parse_finish_reason(reason: &str) -> UnifiedFinishReason {
    match reason {
        "MAX_TOKENS" => UnifiedFinishReason::Length,
        "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" => UnifiedFinishReason::ContentFilter,
        _ => UnifiedFinishReason::Stop,
    }
}

fn format_finish_reason(reason: UnifiedFinishReason) -> &'static str {
    match reason {
        UnifiedFinishReason::Length => "MAX_TOKENS",
        UnifiedFinishReason::ContentFilter => "SAFETY",
        // Gemini reports tool-calling turns as a normal STOP.
        UnifiedFinishReason::Stop | UnifiedFinishReason::ToolCalls => "STOP",
    }
}

impl From<GeminiRequest> for UnifiedRequest {
    fn from(request: GeminiRequest) -> Self {
        let system = request.system_instruction.map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<Vec<_>>()
                .join("\n")
        });

        let mut messages = Vec::with_capacity(request.contents.len());
        let mut call_counter = 0usize;

        for content in request.contents {
            messages.push(parse_content(content, &mut call_counter));
        }

        let config = request.generation_config.unwrap_or_default();

        let reasoning = config.thinking_config.as_ref().map(|thinking| UnifiedReasoning {
            mode: None,
            effort: None,
            budget_tokens: thinking.thinking_budget,
        });

        let response_format = config.response_schema.clone().map(|schema| {
            serde_json::json!({
                "type": "json_schema",
                "json_schema": {"schema": schema}
            })
        });

        Self {
            model: String::new(),
            messages,
            system,
            max_tokens: config.max_output_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            frequency_penalty: config.frequency_penalty,
            presence_penalty: config.presence_penalty,
            stop_sequences: config.stop_sequences,
            stream: None,
            tools: request.tools.map(|tools| {
                tools
                    .into_iter()
                    .flat_map(|declarations| declarations.function_declarations)
                    .map(|declaration| UnifiedTool {
                        name: declaration.name,
                        description: declaration.description,
                        parameters: declaration.parameters,
                    })
                    .collect()
            }),
            tool_choice: request.tool_config.map(|config| {
                let mode = config.function_calling_config.mode.to_ascii_uppercase();
                match mode.as_str() {
                    "NONE" => UnifiedToolChoice::None,
                    "ANY" => match config
                        .function_calling_config
                        .allowed_function_names
                        .as_deref()
                    {
                        Some([name]) => UnifiedToolChoice::Specific { name: name.clone() },
                        _ => UnifiedToolChoice::Required,
                    },
                    _ => UnifiedToolChoice::Auto,
                }
            }),
            reasoning,
            response_format,
            modalities: config.response_modalities,
            image_config: None,
            logit_bias: None,
            user: None,
        }
    }
}

fn parse_content(content: Content, call_counter: &mut usize) -> UnifiedMessage {
    let role = match content.role.as_deref() {
        Some("model") => UnifiedRole::Assistant,
        _ => UnifiedRole::User,
    };

    let mut parts = Vec::with_capacity(content.parts.len());

    for part in content.parts {
        if let Some(text) = part.text {
            if part.thought.unwrap_or(false) {
                parts.push(UnifiedPart::Thinking {
                    text,
                    signature: part.thought_signature,
                });
            } else {
                parts.push(UnifiedPart::Text { text });
            }
            continue;
        }

        if let Some(inline) = part.inline_data {
            parts.push(UnifiedPart::Image {
                media_type: inline.mime_type,
                data: inline.data,
            });
            continue;
        }

        if let Some(call) = part.function_call {
            *call_counter += 1;
            parts.push(UnifiedPart::ToolUse {
                id: format!("call_{call_counter}"),
                name: call.name,
                input: call.args,
            });
            continue;
        }

        if let Some(response) = part.function_response {
            parts.push(UnifiedPart::ToolResult {
                tool_use_id: response.name,
                content: response.response.to_string(),
                is_error: None,
            });
        }
    }

    // Collapse the single-text case so simple prompts stay simple.
    if parts.len() == 1
        && let UnifiedPart::Text { text } = &parts[0]
    {
        return UnifiedMessage::text(role, text.clone());
    }

    UnifiedMessage {
        role,
        content: UnifiedContent::Parts(parts),
        tool_calls: None,
        tool_call_id: None,
    }
}

impl From<&UnifiedRequest> for GeminiRequest {
    fn from(request: &UnifiedRequest) -> Self {
        let system_instruction = request.system.as_ref().map(|system| Content {
            role: None,
            parts: vec![Part {
                text: Some(system.clone()),
                ..Default::default()
            }],
        });

        let contents = request.messages.iter().map(format_message).collect();

        let thinking_config = request.reasoning.as_ref().map(|reasoning| ThinkingConfig {
            thinking_budget: reasoning.budget_tokens,
            include_thoughts: Some(true),
        });

        let response_schema = request
            .response_format
            .as_ref()
            .and_then(|format| format.pointer("/json_schema/schema").cloned());

        let generation_config = GenerationConfig {
            max_output_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
            stop_sequences: request.stop_sequences.clone(),
            response_mime_type: response_schema.is_some().then(|| "application/json".to_string()),
            response_schema,
            response_modalities: request.modalities.clone(),
            thinking_config,
        };

        let tools = request.tools.as_ref().map(|tools| {
            vec![ToolDeclarations {
                function_declarations: tools
                    .iter()
                    .map(|tool| FunctionDeclaration {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    })
                    .collect(),
            }]
        });

        let tool_config = request.tool_choice.as_ref().map(|choice| {
            let (mode, allowed) = match choice {
                UnifiedToolChoice::Auto => ("AUTO", None),
                UnifiedToolChoice::None => ("NONE", None),
                UnifiedToolChoice::Required => ("ANY", None),
                UnifiedToolChoice::Specific { name } => ("ANY", Some(vec![name.clone()])),
            };

            ToolConfig {
                function_calling_config: FunctionCallingConfig {
                    mode: mode.to_string(),
                    allowed_function_names: allowed,
                },
            }
        });

        Self {
            contents,
            system_instruction,
            generation_config: Some(generation_config),
            tools,
            tool_config,
        }
    }
}

fn format_message(message: &UnifiedMessage) -> Content {
    let role = match message.role {
        UnifiedRole::Assistant => "model",
        _ => "user",
    };

    let mut parts = Vec::new();

    match &message.content {
        UnifiedContent::Text(text) => parts.push(Part {
            text: Some(text.clone()),
            ..Default::default()
        }),
        UnifiedContent::Parts(unified_parts) => {
            for part in unified_parts {
                match part {
                    UnifiedPart::Text { text } => parts.push(Part {
                        text: Some(text.clone()),
                        ..Default::default()
                    }),
                    UnifiedPart::Thinking { text, signature } => parts.push(Part {
                        text: Some(text.clone()),
                        thought: Some(true),
                        thought_signature: signature.clone(),
                        ..Default::default()
                    }),
                    UnifiedPart::Image { media_type, data } => parts.push(Part {
                        inline_data: Some(InlineData {
                            mime_type: media_type.clone(),
                            data: data.clone(),
                        }),
                        ..Default::default()
                    }),
                    UnifiedPart::ToolUse { name, input, .. } => parts.push(Part {
                        function_call: Some(FunctionCall {
                            name: name.clone(),
                            args: input.clone(),
                        }),
                        ..Default::default()
                    }),
                    UnifiedPart::ToolResult {
                        tool_use_id, content, ..
                    } => parts.push(Part {
                        function_response: Some(FunctionResponse {
                            name: tool_use_id.clone(),
                            response: serde_json::from_str(content)
                                .unwrap_or_else(|_| serde_json::json!({"result": content})),
                        }),
                        ..Default::default()
                    }),
                }
            }
        }
    }

    for call in message.tool_calls.iter().flatten() {
        parts.push(Part {
            function_call: Some(FunctionCall {
                name: call.name.clone(),
                args: serde_json::from_str(&call.arguments)
                    .unwrap_or_else(|_| Value::Object(serde_json::Map::new())),
            }),
            ..Default::default()
        });
    }

    Content {
        role: Some(role.to_string()),
        parts,
    }
}

impl From<GeminiResponse> for UnifiedResponse {
    fn from(response: GeminiResponse) -> Self {
        let usage = response.usage_metadata.map(UnifiedUsage::from).unwrap_or_default();

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();
        let mut images = Vec::new();
        let mut finish_reason = None;

        if let Some(candidate) = response.candidates.into_iter().next() {
            finish_reason = candidate.finish_reason.as_deref().map(parse_finish_reason);

            for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
                if let Some(text) = part.text {
                    if part.thought.unwrap_or(false) {
                        reasoning.push_str(&text);
                    } else {
                        content.push_str(&text);
                    }
                }

                if let Some(call) = part.function_call {
                    tool_calls.push(UnifiedToolCall {
                        id: format!("call_{}", tool_calls.len() + 1),
                        name: call.name,
                        arguments: call.args.to_string(),
                    });
                }

                if let Some(inline) = part.inline_data {
                    images.push(crate::unified::UnifiedImage {
                        media_type: inline.mime_type,
                        data: inline.data,
                    });
                }
            }
        }

        if finish_reason == Some(UnifiedFinishReason::Stop) && !tool_calls.is_empty() {
            finish_reason = Some(UnifiedFinishReason::ToolCalls);
        }

        Self {
            id: response.response_id.unwrap_or_default(),
            model: response.model_version.unwrap_or_default(),
            created: 0,
            content: if content.is_empty() { None } else { Some(content) },
            reasoning_content: if reasoning.is_empty() { None } else { Some(reasoning) },
            tool_calls,
            images,
            finish_reason,
            usage,
        }
    }
}

impl From<&UnifiedResponse> for GeminiResponse {
    fn from(response: &UnifiedResponse) -> Self {
        let mut parts = Vec::new();

        if let Some(reasoning) = &response.reasoning_content {
            parts.push(Part {
                text: Some(reasoning.clone()),
                thought: Some(true),
                ..Default::default()
            });
        }

        if let Some(text) = &response.content {
            parts.push(Part {
                text: Some(text.clone()),
                ..Default::default()
            });
        }

        for call in &response.tool_calls {
            parts.push(Part {
                function_call: Some(FunctionCall {
                    name: call.name.clone(),
                    args: serde_json::from_str(&call.arguments)
                        .unwrap_or_else(|_| Value::Object(serde_json::Map::new())),
                }),
                ..Default::default()
            });
        }

        for image in &response.images {
            parts.push(Part {
                inline_data: Some(InlineData {
                    mime_type: image.media_type.clone(),
                    data: image.data.clone(),
                }),
                ..Default::default()
            });
        }

        Self {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some("model".to_string()),
                    parts,
                }),
                finish_reason: Some(
                    format_finish_reason(response.finish_reason.unwrap_or(UnifiedFinishReason::Stop)).to_string(),
                ),
            }],
            usage_metadata: Some(UsageMetadata::from(&response.usage)),
            model_version: Some(response.model.clone()),
            response_id: Some(response.id.clone()),
        }
    }
}

impl From<UsageMetadata> for UnifiedUsage {
    fn from(usage: UsageMetadata) -> Self {
        Self {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
            reasoning_tokens: usage.thoughts_token_count,
            cache_read_tokens: usage.cached_content_token_count,
            cache_creation_tokens: None,
        }
    }
}

impl From<&UnifiedUsage> for UsageMetadata {
    fn from(usage: &UnifiedUsage) -> Self {
        Self {
            prompt_token_count: usage.input_tokens,
            candidates_token_count: usage.output_tokens,
            total_token_count: usage.total_tokens,
            thoughts_token_count: usage.reasoning_tokens,
            cached_content_token_count: usage.cache_read_tokens,
        }
    }
}

/// Decodes gemini stream chunks; stateful only to number function calls
/// across frames.
#[derive(Default)]
pub(crate) struct StreamDecoder {
    tool_count: u32,
}

impl StreamDecoder {
    pub(crate) fn parse_frame(&mut self, data: &str) -> Option<UnifiedStreamEvent> {
        let chunk: GeminiResponse = match sonic_rs::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                log::warn!("Failed to parse gemini streaming chunk: {e}");
                return None;
            }
        };

        let usage = chunk.usage_metadata.map(UnifiedUsage::from);

        let mut delta = UnifiedDelta::default();
        let mut finish_reason = None;

        if let Some(candidate) = chunk.candidates.into_iter().next() {
            finish_reason = candidate.finish_reason.as_deref().map(parse_finish_reason);

            let mut content = String::new();
            let mut reasoning = String::new();
            let mut tool_calls = Vec::new();

            for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
                if let Some(text) = part.text {
                    if part.thought.unwrap_or(false) {
                        reasoning.push_str(&text);
                    } else {
                        content.push_str(&text);
                    }
                }

                if let Some(call) = part.function_call {
                    let index = self.tool_count;
                    self.tool_count += 1;

                    tool_calls.push(UnifiedToolCallDelta {
                        index,
                        id: Some(format!("call_{}", index + 1)),
                        name: Some(call.name),
                        arguments: Some(call.args.to_string()),
                    });
                }
            }

            delta.content = (!content.is_empty()).then_some(content);
            delta.reasoning_content = (!reasoning.is_empty()).then_some(reasoning);
            delta.tool_calls = (!tool_calls.is_empty()).then_some(tool_calls);
        }

        Some(UnifiedStreamEvent {
            id: chunk.response_id.unwrap_or_default(),
            model: chunk.model_version.unwrap_or_default(),
            created: 0,
            delta,
            finish_reason,
            usage,
        })
    }
}

/// Encodes unified events as gemini stream chunks.
///
/// Function calls stream as argument fragments in the unified form but must
/// be whole objects on this wire, so they buffer until the stream closes.
#[derive(Default)]
pub(crate) struct StreamEncoder {
    model: String,
    response_id: String,
    tool_calls: std::collections::BTreeMap<u32, (String, String)>,
    finish_reason: Option<UnifiedFinishReason>,
    usage: Option<UnifiedUsage>,
}

impl StreamEncoder {
    pub(crate) fn encode(&mut self, event: &UnifiedStreamEvent) -> Vec<Bytes> {
        if self.model.is_empty() {
            self.model = event.model.clone();
        }
        if self.response_id.is_empty() {
            self.response_id = event.id.clone();
        }

        if event.finish_reason.is_some() {
            self.finish_reason = event.finish_reason;
        }
        if event.usage.is_some() {
            self.usage = event.usage;
        }

        for call in event.delta.tool_calls.iter().flatten() {
            let entry = self.tool_calls.entry(call.index).or_default();
            if let Some(name) = &call.name {
                entry.0 = name.clone();
            }
            if let Some(arguments) = &call.arguments {
                entry.1.push_str(arguments);
            }
        }

        let mut parts = Vec::new();

        if let Some(reasoning) = &event.delta.reasoning_content {
            parts.push(Part {
                text: Some(reasoning.clone()),
                thought: Some(true),
                ..Default::default()
            });
        }

        if let Some(content) = &event.delta.content {
            parts.push(Part {
                text: Some(content.clone()),
                ..Default::default()
            });
        }

        if parts.is_empty() {
            return Vec::new();
        }

        self.frame(parts, None)
    }

    pub(crate) fn finish(&mut self) -> Vec<Bytes> {
        let mut parts = Vec::new();

        for (name, arguments) in std::mem::take(&mut self.tool_calls).into_values() {
            parts.push(Part {
                function_call: Some(FunctionCall {
                    name,
                    args: serde_json::from_str(&arguments)
                        .unwrap_or_else(|_| Value::Object(serde_json::Map::new())),
                }),
                ..Default::default()
            });
        }

        let finish = self.finish_reason.take().unwrap_or(UnifiedFinishReason::Stop);

        self.frame(parts, Some(finish))
    }

    fn frame(&mut self, parts: Vec<Part>, finish_reason: Option<UnifiedFinishReason>) -> Vec<Bytes> {
        let chunk = GeminiResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some("model".to_string()),
                    parts,
                }),
                finish_reason: finish_reason.map(|reason| format_finish_reason(reason).to_string()),
            }],
            usage_metadata: if finish_reason.is_some() {
                self.usage.take().map(|usage| UsageMetadata::from(&usage))
            } else {
                None
            },
            model_version: (!self.model.is_empty()).then(|| self.model.clone()),
            response_id: (!self.response_id.is_empty()).then(|| self.response_id.clone()),
        };

        match sonic_rs::to_string(&chunk) {
            Ok(json) => vec![sse::data_frame(&json)],
            Err(e) => {
                log::error!("Failed to serialize gemini streaming chunk: {e}");
                Vec::new()
            }
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
              "contents": [
                {"role": "user", "parts": [{"text": "Hello"}]}
              ],
              "systemInstruction": {"parts": [{"text": "Be terse."}]},
              "generationConfig": {
                "maxOutputTokens": 128,
                "temperature": 0.5,
                "stopSequences": ["END"],
                "thinkingConfig": {"thinkingBudget": 512}
              }
            }
        "#};

        let first = DialectTag::Gemini.parse_request(body.as_bytes()).unwrap();
        let formatted = DialectTag::Gemini.format_request(&first).unwrap();
        let second = DialectTag::Gemini.parse_request(&formatted).unwrap();

        assert_eq!(second.system.as_deref(), Some("Be terse."));
        assert_eq!(second.max_tokens, Some(128));
        assert_eq!(second.stop_sequences, Some(vec!["END".to_string()]));
        assert_eq!(second.reasoning.unwrap().budget_tokens, Some(512));
        assert_eq!(second.messages.len(), 1);
    }

    #[test]
    fn usage_round_trip_preserves_counts() {
        let usage = UnifiedUsage {
            input_tokens: 11,
            output_tokens: 7,
            total_tokens: 25,
            reasoning_tokens: Some(7),
            cache_read_tokens: Some(4),
            cache_creation_tokens: None,
        };

        let raw = format_usage(&usage);
        let back = parse_usage(&raw).unwrap();

        assert_eq!(back, usage);
    }

    #[test]
    fn thought_parts_map_to_reasoning() {
        let body = indoc::indoc! {r#"
            {
              "candidates": [{
                "content": {
                  "role": "model",
                  "parts": [
                    {"text": "mulling it over", "thought": true},
                    {"text": "The answer is 4"}
                  ]
                },
                "finishReason": "STOP"
              }],
              "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 6, "totalTokenCount": 13, "thoughtsTokenCount": 2}
            }
        "#};

        let unified = parse_response(body.as_bytes()).unwrap();

        assert_eq!(unified.reasoning_content.as_deref(), Some("mulling it over"));
        assert_eq!(unified.content.as_deref(), Some("The answer is 4"));
        assert_eq!(unified.usage.reasoning_tokens, Some(2));
    }

    #[test]
    fn function_calls_get_synthesized_ids() {
        let body = indoc::indoc! {r#"
            {
              "candidates": [{
                "content": {
                  "role": "model",
                  "parts": [{"functionCall": {"name": "add", "args": {"a": 1}}}]
                },
                "finishReason": "STOP"
              }]
            }
        "#};

        let unified = parse_response(body.as_bytes()).unwrap();

        assert_eq!(unified.tool_calls[0].id, "call_1");
        assert_eq!(unified.tool_calls[0].name, "add");
        assert_eq!(unified.finish_reason, Some(UnifiedFinishReason::ToolCalls));
    }

    #[test]
    fn stream_decoder_numbers_calls_across_frames() {
        let mut decoder = StreamDecoder::default();

        let first = decoder
            .parse_frame(r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"a","args":{}}}]}}]}"#)
            .unwrap();
        let second = decoder
            .parse_frame(r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"b","args":{}}}]}}]}"#)
            .unwrap();

        assert_eq!(first.delta.tool_calls.unwrap()[0].index, 0);
        assert_eq!(second.delta.tool_calls.unwrap()[0].index, 1);
    }

    #[test]
    fn encoder_buffers_tool_fragments_until_finish() {
        let mut encoder = StreamEncoder::default();

        for fragment in ["{\"a", "\":1}"] {
            let event = UnifiedStreamEvent {
                id: "r1".into(),
                model: "gemini-pro".into(),
                delta: UnifiedDelta {
                    tool_calls: Some(vec![UnifiedToolCallDelta {
                        index: 0,
                        id: None,
                        name: fragment.starts_with('{').then(|| "add".to_string()),
                        arguments: Some(fragment.to_string()),
                    }]),
                    ..Default::default()
                },
                ..Default::default()
            };

            assert!(encoder.encode(&event).is_empty());
        }

        let frames = encoder.finish();
        let text = String::from_utf8_lossy(&frames[0]);

        assert!(text.contains(r#""name":"add""#));
        assert!(text.contains(r#""a":1"#));
        assert!(text.contains(r#""finishReason":"STOP""#));
    }

    #[test]
    fn encoder_and_reconstruct_agree() {
        let mut encoder = StreamEncoder::default();
        let mut captured = String::new();

        for text in ["Hello", ", world"] {
            let event = UnifiedStreamEvent {
                id: "r1".into(),
                model: "gemini-pro".into(),
                delta: UnifiedDelta {
                    content: Some(text.to_string()),
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

        let response = DialectTag::Gemini.reconstruct_from_stream(&captured).unwrap();
        assert_eq!(response.content.as_deref(), Some("Hello, world"));
    }
}
