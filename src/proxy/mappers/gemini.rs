// Gemini generateContent 协议映射
// 入站: GenerateContentRequest → ChatInput；出站: KiroEvent → GenerateContentResponse 片段

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ProxyError;
use crate::proxy::common::model_mapping::map_model_name;
use crate::proxy::mappers::{
    AggregatedResponse, ChatInput, ChatMessage, ImageAttachment, Role, ToolResult, ToolSpec,
    ToolUse,
};
use crate::proxy::upstream::event_stream::KiroEvent;

// ===== Request model =====

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(default)]
    pub system_instruction: Option<Content>,
    #[serde(default)]
    pub tools: Option<Vec<GeminiToolGroup>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<InlineData>,
    #[serde(default)]
    pub function_call: Option<FunctionCall>,
    #[serde(default)]
    pub function_response: Option<FunctionResponse>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    #[serde(default)]
    pub response: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiToolGroup {
    #[serde(default)]
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

// ===== Inbound conversion =====

pub fn to_chat_input(
    request: &GenerateContentRequest,
    client_model: &str,
    stream: bool,
) -> Result<ChatInput, ProxyError> {
    if request.contents.is_empty() {
        return Err(ProxyError::ProtocolTranslation("contents required".into()));
    }

    let system = request.system_instruction.as_ref().map(|content| {
        content
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    });

    let mut messages = Vec::with_capacity(request.contents.len());
    for content in &request.contents {
        let role = match content.role.as_deref().unwrap_or("user") {
            "user" => Role::User,
            "model" => Role::Assistant,
            other => {
                return Err(ProxyError::ProtocolTranslation(format!(
                    "unsupported role: {other}"
                )))
            }
        };

        let mut out = ChatMessage {
            role,
            text: String::new(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
        };

        let mut texts = Vec::new();
        for part in &content.parts {
            if let Some(text) = &part.text {
                texts.push(text.clone());
            }
            if let Some(inline) = &part.inline_data {
                out.images.push(ImageAttachment {
                    format: inline
                        .mime_type
                        .split('/')
                        .next_back()
                        .unwrap_or("jpeg")
                        .to_string(),
                    data: inline.data.clone(),
                });
            }
            if let Some(call) = &part.function_call {
                // Gemini 不携带调用 id，用函数名锚定
                out.tool_uses.push(ToolUse {
                    id: format!("call_{}", call.name),
                    name: call.name.clone(),
                    input: call.args.clone(),
                });
            }
            if let Some(resp) = &part.function_response {
                out.tool_results.push(ToolResult {
                    tool_use_id: format!("call_{}", resp.name),
                    content: resp.response.to_string(),
                    is_error: false,
                });
            }
        }
        out.text = texts.join("\n");
        messages.push(out);
    }

    let tools = request
        .tools
        .as_ref()
        .map(|groups| {
            groups
                .iter()
                .flat_map(|g| &g.function_declarations)
                .map(|decl| ToolSpec {
                    name: decl.name.clone(),
                    description: decl.description.clone().unwrap_or_default(),
                    input_schema: decl.parameters.clone().unwrap_or_else(|| json!({})),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatInput {
        upstream_model: map_model_name(client_model),
        client_model: client_model.to_string(),
        system,
        messages,
        tools,
        stream,
    })
}

// ===== Outbound streaming =====

struct PendingCall {
    tool_use_id: String,
    name: String,
    json_buffer: String,
}

/// KiroEvent → GenerateContentResponse 片段序列
///
/// Function-call arguments cannot be expressed incrementally in the Gemini
/// shape, so fragments buffer per toolUseId and each call is emitted as one
/// complete `functionCall` part once its input is finished.
pub struct GeminiStreamBuilder {
    current: Option<PendingCall>,
    finished: bool,
}

impl GeminiStreamBuilder {
    pub fn new() -> Self {
        Self {
            current: None,
            finished: false,
        }
    }

    fn fragment(parts: Vec<Value>, finish_reason: Option<&str>) -> String {
        let mut candidate = json!({
            "content": {"parts": parts, "role": "model"},
            "index": 0,
        });
        if let Some(reason) = finish_reason {
            candidate["finishReason"] = json!(reason);
        }
        format!("data: {}\n\n", json!({ "candidates": [candidate] }))
    }

    fn flush_call(&mut self) -> Option<Value> {
        let call = self.current.take()?;
        let args: Value = if call.json_buffer.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&call.json_buffer).unwrap_or_else(|_| {
                tracing::warn!(
                    "[Gemini] tool {} arguments did not reassemble to valid JSON",
                    call.tool_use_id
                );
                json!({"raw": call.json_buffer})
            })
        };
        Some(json!({"functionCall": {"name": call.name, "args": args}}))
    }

    pub fn process(&mut self, event: &KiroEvent) -> String {
        if self.finished {
            return String::new();
        }
        match event {
            KiroEvent::AssistantText(text) => {
                if text.is_empty() {
                    return String::new();
                }
                let mut parts = Vec::new();
                if let Some(call) = self.flush_call() {
                    parts.push(call);
                }
                let mut out = String::new();
                for part in parts {
                    out.push_str(&Self::fragment(vec![part], None));
                }
                out.push_str(&Self::fragment(vec![json!({"text": text})], None));
                out
            }
            KiroEvent::ToolUse {
                tool_use_id,
                name,
                input,
                stop,
            } => {
                let mut out = String::new();
                let switching = self
                    .current
                    .as_ref()
                    .map(|c| c.tool_use_id != *tool_use_id)
                    .unwrap_or(false);
                if switching {
                    if let Some(call) = self.flush_call() {
                        out.push_str(&Self::fragment(vec![call], None));
                    }
                }
                if self.current.is_none() {
                    self.current = Some(PendingCall {
                        tool_use_id: tool_use_id.clone(),
                        name: name.clone().unwrap_or_default(),
                        json_buffer: String::new(),
                    });
                }
                if let Some(call) = self.current.as_mut() {
                    if let Some(n) = name {
                        if call.name.is_empty() {
                            call.name = n.clone();
                        }
                    }
                    if let Some(fragment) = input {
                        call.json_buffer.push_str(fragment);
                    }
                }
                if *stop {
                    if let Some(call) = self.flush_call() {
                        out.push_str(&Self::fragment(vec![call], None));
                    }
                }
                out
            }
            KiroEvent::FollowupPrompt(_) => String::new(),
            KiroEvent::MessageStop => self.finish(),
        }
    }

    /// 终止片段，带 finishReason
    pub fn finish(&mut self) -> String {
        if self.finished {
            return String::new();
        }
        self.finished = true;
        let mut out = String::new();
        if let Some(call) = self.flush_call() {
            out.push_str(&Self::fragment(vec![call], None));
        }
        out.push_str(&Self::fragment(Vec::new(), Some("STOP")));
        out
    }

    /// 流中途错误：终止候选 + 错误 finishReason
    pub fn error_event(_err: &ProxyError) -> String {
        format!(
            "data: {}\n\n",
            json!({
                "candidates": [{
                    "content": {"parts": [], "role": "model"},
                    "index": 0,
                    "finishReason": "OTHER",
                }]
            })
        )
    }
}

impl Default for GeminiStreamBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::proxy::mappers::StreamTranslator for GeminiStreamBuilder {
    fn process(&mut self, event: &KiroEvent) -> String {
        GeminiStreamBuilder::process(self, event)
    }

    fn finish(&mut self) -> String {
        GeminiStreamBuilder::finish(self)
    }

    fn error_event(&self, err: &ProxyError) -> String {
        GeminiStreamBuilder::error_event(err)
    }
}

// ===== Outbound non-streaming =====

pub fn non_stream_response(agg: &AggregatedResponse) -> Value {
    let mut parts = Vec::new();
    if !agg.text.is_empty() {
        parts.push(json!({"text": agg.text}));
    }
    for tool_use in &agg.tool_uses {
        parts.push(json!({
            "functionCall": {"name": tool_use.name, "args": tool_use.input}
        }));
    }

    json!({
        "candidates": [{
            "content": {"parts": parts, "role": "model"},
            "finishReason": "STOP",
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": agg.input_tokens,
            "candidatesTokenCount": agg.output_tokens,
            "totalTokenCount": agg.input_tokens + agg.output_tokens,
        }
    })
}
