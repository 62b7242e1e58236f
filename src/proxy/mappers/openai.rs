// OpenAI /v1/chat/completions 协议映射
// 入站: ChatCompletionRequest → ChatInput；出站: KiroEvent → chat.completion.chunk 序列

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
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatCompletionMessage>,
    #[serde(default)]
    pub tools: Option<Vec<OpenAiTool>>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiToolCall {
    pub id: String,
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiFunctionCall {
    pub name: String,
    /// Arguments arrive as a JSON-encoded string.
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiTool {
    #[serde(rename = "type", default)]
    pub tool_type: String,
    pub function: OpenAiFunctionDef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiFunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

// ===== Inbound conversion =====

pub fn to_chat_input(request: &ChatCompletionRequest) -> Result<ChatInput, ProxyError> {
    if request.messages.is_empty() {
        return Err(ProxyError::ProtocolTranslation("messages required".into()));
    }

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<ChatMessage> = Vec::new();

    for msg in &request.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                if let Some(text) = content_text(msg.content.as_ref()) {
                    system_parts.push(text);
                }
            }
            "user" => {
                let (text, images) = content_text_and_images(msg.content.as_ref());
                messages.push(ChatMessage {
                    role: Role::User,
                    text,
                    tool_uses: Vec::new(),
                    tool_results: Vec::new(),
                    images,
                });
            }
            "assistant" => {
                let mut out = ChatMessage::assistant(
                    content_text(msg.content.as_ref()).unwrap_or_default(),
                );
                if let Some(calls) = &msg.tool_calls {
                    for call in calls {
                        let input = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        out.tool_uses.push(ToolUse {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            input,
                        });
                    }
                }
                messages.push(out);
            }
            "tool" => {
                // 工具结果并入下一条 user 轮（上游以 toolResults 表达）
                let result = ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: content_text(msg.content.as_ref()).unwrap_or_default(),
                    is_error: false,
                };
                match messages.last_mut() {
                    Some(last) if last.role == Role::User => last.tool_results.push(result),
                    _ => {
                        let mut holder = ChatMessage::user("");
                        holder.tool_results.push(result);
                        messages.push(holder);
                    }
                }
            }
            other => {
                return Err(ProxyError::ProtocolTranslation(format!(
                    "unsupported role: {other}"
                )))
            }
        }
    }

    if messages.is_empty() {
        return Err(ProxyError::ProtocolTranslation(
            "at least one user or assistant message required".into(),
        ));
    }

    let tools = request
        .tools
        .as_ref()
        .map(|tools| {
            tools
                .iter()
                .filter(|t| t.tool_type.is_empty() || t.tool_type == "function")
                .map(|t| ToolSpec {
                    name: t.function.name.clone(),
                    description: t.function.description.clone().unwrap_or_default(),
                    input_schema: t.function.parameters.clone().unwrap_or_else(|| json!({})),
                })
                .collect()
        })
        .unwrap_or_default();

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };

    Ok(ChatInput {
        upstream_model: map_model_name(&request.model),
        client_model: request.model.clone(),
        system,
        messages,
        tools,
        stream: request.stream,
    })
}

fn content_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect();
            Some(texts.join("\n"))
        }
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn content_text_and_images(content: Option<&Value>) -> (String, Vec<ImageAttachment>) {
    let mut images = Vec::new();
    if let Some(Value::Array(parts)) = content {
        for part in parts {
            if part.get("type").and_then(|t| t.as_str()) != Some("image_url") {
                continue;
            }
            let url = part
                .get("image_url")
                .and_then(|u| u.get("url"))
                .and_then(|u| u.as_str())
                .unwrap_or_default();
            // 仅支持 data URL；远程 URL 上游不收
            if let Some(rest) = url.strip_prefix("data:image/") {
                if let Some((format, data)) = rest.split_once(";base64,") {
                    images.push(ImageAttachment {
                        format: format.to_string(),
                        data: data.to_string(),
                    });
                }
            }
        }
    }
    (content_text(content).unwrap_or_default(), images)
}

// ===== Outbound streaming =====

struct ToolSlot {
    tool_use_id: String,
    json_buffer: String,
}

/// KiroEvent → OpenAI 流式 chunk 状态机
///
/// Tool fragments are keyed by toolUseId: the first fragment introduces the
/// call (index, id, name), later fragments append incremental
/// `function.arguments` JSON. Ordering of `tool_calls[].function.name`
/// follows upstream arrival order.
pub struct OpenAiStreamBuilder {
    completion_id: String,
    model: String,
    created: i64,
    sent_role: bool,
    tools: Vec<ToolSlot>,
    finished: bool,
}

impl OpenAiStreamBuilder {
    pub fn new(model: &str, completion_id: &str, created: i64) -> Self {
        Self {
            completion_id: completion_id.to_string(),
            model: model.to_string(),
            created,
            sent_role: false,
            tools: Vec::new(),
            finished: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        let body = json!({
            "id": self.completion_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }]
        });
        format!("data: {}\n\n", body)
    }

    fn role_preamble(&mut self) -> String {
        if self.sent_role {
            return String::new();
        }
        self.sent_role = true;
        self.chunk(json!({"role": "assistant", "content": ""}), None)
    }

    pub fn process(&mut self, event: &KiroEvent) -> String {
        if self.finished {
            return String::new();
        }
        let mut out = self.role_preamble();

        match event {
            KiroEvent::AssistantText(text) => {
                if text.is_empty() {
                    return out;
                }
                out.push_str(&self.chunk(json!({"content": text}), None));
            }
            KiroEvent::ToolUse {
                tool_use_id,
                name,
                input,
                ..
            } => {
                let index = match self
                    .tools
                    .iter()
                    .position(|t| t.tool_use_id == *tool_use_id)
                {
                    Some(i) => i,
                    None => {
                        self.tools.push(ToolSlot {
                            tool_use_id: tool_use_id.clone(),
                            json_buffer: String::new(),
                        });
                        let i = self.tools.len() - 1;
                        out.push_str(&self.chunk(
                            json!({"tool_calls": [{
                                "index": i,
                                "id": tool_use_id,
                                "type": "function",
                                "function": {"name": name.clone().unwrap_or_default(), "arguments": ""}
                            }]}),
                            None,
                        ));
                        i
                    }
                };
                if let Some(fragment) = input {
                    if !fragment.is_empty() {
                        self.tools[index].json_buffer.push_str(fragment);
                        out.push_str(&self.chunk(
                            json!({"tool_calls": [{
                                "index": index,
                                "function": {"arguments": fragment}
                            }]}),
                            None,
                        ));
                    }
                }
            }
            KiroEvent::FollowupPrompt(_) => {}
            KiroEvent::MessageStop => out.push_str(&self.finish()),
        }
        out
    }

    /// 终止 chunk + [DONE]
    pub fn finish(&mut self) -> String {
        if self.finished {
            return String::new();
        }
        self.finished = true;

        for tool in &self.tools {
            if !tool.json_buffer.is_empty()
                && serde_json::from_str::<Value>(&tool.json_buffer).is_err()
            {
                tracing::warn!(
                    "[OpenAI] tool {} arguments did not reassemble to valid JSON",
                    tool.tool_use_id
                );
            }
        }

        let finish_reason = if self.tools.is_empty() {
            "stop"
        } else {
            "tool_calls"
        };
        let mut out = self.chunk(json!({}), Some(finish_reason));
        out.push_str("data: [DONE]\n\n");
        out
    }

    /// 流中途的带内错误事件
    pub fn error_event(err: &ProxyError) -> String {
        let body = json!({
            "error": {
                "message": err.to_string(),
                "type": "api_error",
                "code": err.kind(),
            }
        });
        format!("data: {}\n\n", body)
    }
}

impl crate::proxy::mappers::StreamTranslator for OpenAiStreamBuilder {
    fn process(&mut self, event: &KiroEvent) -> String {
        OpenAiStreamBuilder::process(self, event)
    }

    fn finish(&mut self) -> String {
        OpenAiStreamBuilder::finish(self)
    }

    fn error_event(&self, err: &ProxyError) -> String {
        OpenAiStreamBuilder::error_event(err)
    }
}

// ===== Outbound non-streaming =====

pub fn non_stream_response(
    agg: &AggregatedResponse,
    model: &str,
    completion_id: &str,
    created: i64,
) -> Value {
    let tool_calls: Vec<Value> = agg
        .tool_uses
        .iter()
        .map(|t| {
            json!({
                "id": t.id,
                "type": "function",
                "function": {
                    "name": t.name,
                    "arguments": t.input.to_string(),
                }
            })
        })
        .collect();

    let mut message = json!({
        "role": "assistant",
        "content": if agg.text.is_empty() { Value::Null } else { Value::String(agg.text.clone()) },
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    json!({
        "id": completion_id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": if agg.tool_uses.is_empty() { "stop" } else { "tool_calls" },
        }],
        "usage": {
            "prompt_tokens": agg.input_tokens,
            "completion_tokens": agg.output_tokens,
            "total_tokens": agg.input_tokens + agg.output_tokens,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(out: &str) -> Vec<Value> {
        out.split("\n\n")
            .filter_map(|line| line.strip_prefix("data: "))
            .filter(|d| *d != "[DONE]")
            .map(|d| serde_json::from_str(d).unwrap())
            .collect()
    }

    #[test]
    fn test_inbound_system_and_tools() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be helpful"},
                {"role": "user", "content": "hi"},
            ],
            "tools": [{
                "type": "function",
                "function": {"name": "lookup", "description": "d", "parameters": {"type": "object"}}
            }]
        }))
        .unwrap();

        let input = to_chat_input(&request).unwrap();
        assert_eq!(input.upstream_model, "claude-sonnet-4");
        assert_eq!(input.system.as_deref(), Some("be helpful"));
        assert_eq!(input.messages.len(), 1);
        assert_eq!(input.tools[0].name, "lookup");
    }

    #[test]
    fn test_inbound_tool_round_trip_roles() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_1", "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
            ]
        }))
        .unwrap();

        let input = to_chat_input(&request).unwrap();
        assert_eq!(input.messages.len(), 3);
        assert_eq!(input.messages[1].tool_uses[0].input, json!({"city": "Paris"}));
        assert_eq!(input.messages[2].role, Role::User);
        assert_eq!(input.messages[2].tool_results[0].tool_use_id, "call_1");
    }

    #[test]
    fn test_inbound_data_url_image() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,aGk="}}
                ]}
            ]
        }))
        .unwrap();

        let input = to_chat_input(&request).unwrap();
        assert_eq!(input.messages[0].images[0].format, "png");
        assert_eq!(input.messages[0].images[0].data, "aGk=");
    }

    #[test]
    fn test_stream_text_chunks() {
        let mut builder = OpenAiStreamBuilder::new("gpt-4o", "chatcmpl-1", 1_700_000_000);
        let mut out = String::new();
        out.push_str(&builder.process(&KiroEvent::AssistantText("Hel".into())));
        out.push_str(&builder.process(&KiroEvent::AssistantText("lo".into())));
        out.push_str(&builder.process(&KiroEvent::MessageStop));

        assert!(out.trim_end().ends_with("data: [DONE]"));

        let parsed = chunks(&out);
        let text: String = parsed
            .iter()
            .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
            .collect();
        assert_eq!(text, "Hello");

        let finish = parsed
            .iter()
            .filter_map(|c| c["choices"][0]["finish_reason"].as_str())
            .next_back()
            .unwrap();
        assert_eq!(finish, "stop");
    }

    #[test]
    fn test_stream_tool_calls_ordering_and_arguments() {
        let mut builder = OpenAiStreamBuilder::new("gpt-4o", "chatcmpl-1", 0);
        let mut out = String::new();
        // 两个工具交错到达，name 顺序必须与到达顺序一致
        out.push_str(&builder.process(&KiroEvent::ToolUse {
            tool_use_id: "A".into(),
            name: Some("first".into()),
            input: Some("{\"x\":".into()),
            stop: false,
        }));
        out.push_str(&builder.process(&KiroEvent::ToolUse {
            tool_use_id: "B".into(),
            name: Some("second".into()),
            input: None,
            stop: false,
        }));
        out.push_str(&builder.process(&KiroEvent::ToolUse {
            tool_use_id: "A".into(),
            name: None,
            input: Some("1}".into()),
            stop: true,
        }));
        out.push_str(&builder.process(&KiroEvent::ToolUse {
            tool_use_id: "B".into(),
            name: None,
            input: Some("{}".into()),
            stop: true,
        }));
        out.push_str(&builder.finish());

        let parsed = chunks(&out);

        let names: Vec<String> = parsed
            .iter()
            .filter_map(|c| c["choices"][0]["delta"]["tool_calls"].as_array())
            .flatten()
            .filter_map(|t| t["function"]["name"].as_str().map(String::from))
            .collect();
        assert_eq!(names, vec!["first", "second"]);

        // index 0 的 arguments 片段拼接为合法 JSON
        let args_a: String = parsed
            .iter()
            .filter_map(|c| c["choices"][0]["delta"]["tool_calls"].as_array())
            .flatten()
            .filter(|t| t["index"] == 0)
            .filter_map(|t| t["function"]["arguments"].as_str())
            .collect();
        assert_eq!(serde_json::from_str::<Value>(&args_a).unwrap(), json!({"x": 1}));

        let finish = parsed
            .iter()
            .filter_map(|c| c["choices"][0]["finish_reason"].as_str())
            .next_back()
            .unwrap();
        assert_eq!(finish, "tool_calls");
    }

    #[test]
    fn test_non_stream_response() {
        let agg = AggregatedResponse {
            text: "hi".into(),
            tool_uses: Vec::new(),
            input_tokens: 4,
            output_tokens: 2,
        };
        let resp = non_stream_response(&agg, "gpt-4o", "chatcmpl-1", 1);
        assert_eq!(resp["choices"][0]["message"]["content"], "hi");
        assert_eq!(resp["choices"][0]["finish_reason"], "stop");
        assert_eq!(resp["usage"]["total_tokens"], 6);
    }
}
