// Anthropic /v1/messages 协议映射
// 入站: ClaudeRequest → ChatInput；出站: KiroEvent → Anthropic SSE 事件序列

use serde::{Deserialize, Serialize};
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
pub struct ClaudeRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub tools: Option<Vec<Tool>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    String(String),
    Array(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemBlock {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    String(String),
    Array(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "image")]
    Image { source: ImageSource },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSource {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

// ===== Inbound conversion =====

pub fn to_chat_input(request: &ClaudeRequest) -> Result<ChatInput, ProxyError> {
    if request.messages.is_empty() {
        return Err(ProxyError::ProtocolTranslation("messages required".into()));
    }

    let system = request.system.as_ref().map(|s| match s {
        SystemPrompt::String(text) => text.clone(),
        SystemPrompt::Array(blocks) => blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    });

    let mut messages = Vec::with_capacity(request.messages.len());
    for msg in &request.messages {
        let role = match msg.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
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

        match &msg.content {
            MessageContent::String(text) => out.text = text.clone(),
            MessageContent::Array(blocks) => {
                let mut texts = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => texts.push(text.clone()),
                        ContentBlock::Image { source } => {
                            out.images.push(ImageAttachment {
                                format: media_type_to_format(&source.media_type),
                                data: strip_data_url(&source.data),
                            });
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            out.tool_uses.push(ToolUse {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                            });
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            out.tool_results.push(ToolResult {
                                tool_use_id: tool_use_id.clone(),
                                content: tool_result_text(content),
                                is_error: is_error.unwrap_or(false),
                            });
                        }
                    }
                }
                out.text = texts.join("\n");
            }
        }
        messages.push(out);
    }

    let tools = request
        .tools
        .as_ref()
        .map(|tools| {
            tools
                .iter()
                .map(|t| ToolSpec {
                    name: t.name.clone(),
                    description: t.description.clone().unwrap_or_default(),
                    input_schema: t.input_schema.clone().unwrap_or_else(|| json!({})),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatInput {
        upstream_model: map_model_name(&request.model),
        client_model: request.model.clone(),
        system,
        messages,
        tools,
        stream: request.stream,
    })
}

fn media_type_to_format(media_type: &str) -> String {
    media_type
        .split('/')
        .next_back()
        .unwrap_or("jpeg")
        .to_string()
}

fn strip_data_url(data: &str) -> String {
    match data.split_once(",") {
        Some((header, rest)) if header.starts_with("data:") => rest.to_string(),
        _ => data.to_string(),
    }
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ===== Outbound streaming =====

struct OpenTool {
    tool_use_id: String,
    json_buffer: String,
}

/// KiroEvent → Anthropic SSE 状态机
///
/// One content block per interleaved text run or tool use. Tool input
/// fragments are forwarded as `input_json_delta` in arrival order; the
/// concatenation per toolUseId equals the upstream concatenation.
pub struct AnthropicSseBuilder {
    message_id: String,
    model: String,
    input_tokens: u32,
    content_index: usize,
    in_text_block: bool,
    current_tool: Option<OpenTool>,
    has_tool_calls: bool,
    started: bool,
    finished: bool,
    output_chars: usize,
}

impl AnthropicSseBuilder {
    pub fn new(model: &str, message_id: &str, input_tokens: u32) -> Self {
        Self {
            message_id: message_id.to_string(),
            model: model.to_string(),
            input_tokens,
            content_index: 0,
            in_text_block: false,
            current_tool: None,
            has_tool_calls: false,
            started: false,
            finished: false,
            output_chars: 0,
        }
    }

    fn sse(event: &str, data: &Value) -> String {
        format!(
            "event: {}\ndata: {}\n\n",
            event,
            serde_json::to_string(data).unwrap_or_default()
        )
    }

    fn message_start(&mut self) -> String {
        if self.started {
            return String::new();
        }
        self.started = true;
        Self::sse(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": self.input_tokens, "output_tokens": 0}
                }
            }),
        )
    }

    fn close_text_block(&mut self) -> String {
        if !self.in_text_block {
            return String::new();
        }
        self.in_text_block = false;
        let out = Self::sse(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.content_index}),
        );
        self.content_index += 1;
        out
    }

    fn close_tool_block(&mut self) -> String {
        let Some(tool) = self.current_tool.take() else {
            return String::new();
        };
        if !tool.json_buffer.is_empty()
            && serde_json::from_str::<Value>(&tool.json_buffer).is_err()
        {
            tracing::warn!(
                "[Anthropic] tool {} arguments did not reassemble to valid JSON",
                tool.tool_use_id
            );
        }
        let out = Self::sse(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.content_index}),
        );
        self.content_index += 1;
        out
    }

    /// 处理一个上游事件，返回应立即下发的 SSE 文本
    pub fn process(&mut self, event: &KiroEvent) -> String {
        if self.finished {
            return String::new();
        }
        let mut out = self.message_start();

        match event {
            KiroEvent::AssistantText(text) => {
                if text.is_empty() {
                    return out;
                }
                out.push_str(&self.close_tool_block());
                if !self.in_text_block {
                    out.push_str(&Self::sse(
                        "content_block_start",
                        &json!({
                            "type": "content_block_start",
                            "index": self.content_index,
                            "content_block": {"type": "text", "text": ""}
                        }),
                    ));
                    self.in_text_block = true;
                }
                self.output_chars += text.len();
                out.push_str(&Self::sse(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.content_index,
                        "delta": {"type": "text_delta", "text": text}
                    }),
                ));
            }
            KiroEvent::ToolUse {
                tool_use_id,
                name,
                input,
                stop,
            } => {
                let switching = self
                    .current_tool
                    .as_ref()
                    .map(|t| t.tool_use_id != *tool_use_id)
                    .unwrap_or(true);
                if switching {
                    out.push_str(&self.close_text_block());
                    out.push_str(&self.close_tool_block());
                    self.has_tool_calls = true;
                    out.push_str(&Self::sse(
                        "content_block_start",
                        &json!({
                            "type": "content_block_start",
                            "index": self.content_index,
                            "content_block": {
                                "type": "tool_use",
                                "id": tool_use_id,
                                "name": name.clone().unwrap_or_default(),
                                "input": {}
                            }
                        }),
                    ));
                    self.current_tool = Some(OpenTool {
                        tool_use_id: tool_use_id.clone(),
                        json_buffer: String::new(),
                    });
                }
                if let Some(fragment) = input {
                    if !fragment.is_empty() {
                        if let Some(tool) = self.current_tool.as_mut() {
                            tool.json_buffer.push_str(fragment);
                        }
                        self.output_chars += fragment.len();
                        out.push_str(&Self::sse(
                            "content_block_delta",
                            &json!({
                                "type": "content_block_delta",
                                "index": self.content_index,
                                "delta": {"type": "input_json_delta", "partial_json": fragment}
                            }),
                        ));
                    }
                }
                if *stop {
                    out.push_str(&self.close_tool_block());
                }
            }
            // 跟进提示不转发给客户端
            KiroEvent::FollowupPrompt(_) => {}
            KiroEvent::MessageStop => out.push_str(&self.finish()),
        }
        out
    }

    /// 收尾：关闭未完块，发 message_delta + message_stop（只发一次）
    pub fn finish(&mut self) -> String {
        if self.finished {
            return String::new();
        }
        let mut out = self.message_start();
        out.push_str(&self.close_text_block());
        out.push_str(&self.close_tool_block());

        let stop_reason = if self.has_tool_calls {
            "tool_use"
        } else {
            "end_turn"
        };
        let output_tokens = crate::proxy::mappers::estimate_tokens_from_chars(self.output_chars);
        out.push_str(&Self::sse(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {"output_tokens": output_tokens}
            }),
        ));
        out.push_str(&Self::sse("message_stop", &json!({"type": "message_stop"})));
        self.finished = true;
        out
    }

    /// 流中途的带内错误事件
    pub fn error_event(err: &ProxyError) -> String {
        Self::sse(
            "error",
            &json!({
                "type": "error",
                "error": {"type": "api_error", "message": err.to_string()}
            }),
        )
    }
}

impl crate::proxy::mappers::StreamTranslator for AnthropicSseBuilder {
    fn process(&mut self, event: &KiroEvent) -> String {
        AnthropicSseBuilder::process(self, event)
    }

    fn finish(&mut self) -> String {
        AnthropicSseBuilder::finish(self)
    }

    fn error_event(&self, err: &ProxyError) -> String {
        AnthropicSseBuilder::error_event(err)
    }
}

// ===== Outbound non-streaming =====

pub fn non_stream_response(agg: &AggregatedResponse, model: &str, message_id: &str) -> Value {
    let mut content = Vec::new();
    if !agg.text.is_empty() {
        content.push(json!({"type": "text", "text": agg.text}));
    }
    for tool_use in &agg.tool_uses {
        content.push(json!({
            "type": "tool_use",
            "id": tool_use.id,
            "name": tool_use.name,
            "input": tool_use.input,
        }));
    }

    json!({
        "id": message_id,
        "type": "message",
        "role": "assistant",
        "content": content,
        "model": model,
        "stop_reason": agg.stop_reason(),
        "stop_sequence": null,
        "usage": {
            "input_tokens": agg.input_tokens,
            "output_tokens": agg.output_tokens,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_sse(out: &str) -> Vec<(String, Value)> {
        let mut events = Vec::new();
        for block in out.split("\n\n").filter(|b| !b.trim().is_empty()) {
            let mut event = String::new();
            let mut data = Value::Null;
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event = rest.to_string();
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data = serde_json::from_str(rest).unwrap();
                }
            }
            events.push((event, data));
        }
        events
    }

    #[test]
    fn test_inbound_basic() {
        let request: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4.5",
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": [{"type": "text", "text": "hi"}]},
                {"role": "user", "content": "more"}
            ],
            "system": "be brief"
        }))
        .unwrap();

        let input = to_chat_input(&request).unwrap();
        assert_eq!(input.upstream_model, "claude-sonnet-4.5");
        assert_eq!(input.system.as_deref(), Some("be brief"));
        assert_eq!(input.messages.len(), 3);
        assert_eq!(input.messages[1].role, Role::Assistant);
        assert_eq!(input.messages[1].text, "hi");
    }

    #[test]
    fn test_inbound_tool_blocks() {
        let request: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "T1", "name": "get_weather", "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "T1", "content": [{"type": "text", "text": "sunny"}]}
                ]}
            ],
            "tools": [{"name": "get_weather", "description": "d", "input_schema": {"type": "object"}}]
        }))
        .unwrap();

        let input = to_chat_input(&request).unwrap();
        assert_eq!(input.messages[1].tool_uses[0].name, "get_weather");
        assert_eq!(input.messages[2].tool_results[0].content, "sunny");
        assert_eq!(input.tools[0].name, "get_weather");
    }

    #[test]
    fn test_inbound_empty_messages_rejected() {
        let request: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4",
            "messages": []
        }))
        .unwrap();
        assert!(matches!(
            to_chat_input(&request),
            Err(ProxyError::ProtocolTranslation(_))
        ));
    }

    #[test]
    fn test_stream_text_only() {
        let mut builder = AnthropicSseBuilder::new("claude-sonnet-4", "msg_1", 10);
        let mut out = String::new();
        out.push_str(&builder.process(&KiroEvent::AssistantText("Hel".into())));
        out.push_str(&builder.process(&KiroEvent::AssistantText("lo".into())));
        out.push_str(&builder.process(&KiroEvent::MessageStop));

        let events = parse_sse(&out);
        let kinds: Vec<&str> = events.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );

        let text: String = events
            .iter()
            .filter(|(e, _)| e == "content_block_delta")
            .map(|(_, d)| d["delta"]["text"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(text, "Hello");
    }

    #[test]
    fn test_stream_tool_call_round_trip() {
        // 上游三个 input 片段拼接为 {"a":1,"b":2}
        let mut builder = AnthropicSseBuilder::new("claude-sonnet-4", "msg_1", 0);
        let mut out = String::new();
        out.push_str(&builder.process(&KiroEvent::ToolUse {
            tool_use_id: "X".into(),
            name: Some("merge".into()),
            input: Some("{\"a\":".into()),
            stop: false,
        }));
        out.push_str(&builder.process(&KiroEvent::ToolUse {
            tool_use_id: "X".into(),
            name: None,
            input: Some("1,\"b\":".into()),
            stop: false,
        }));
        out.push_str(&builder.process(&KiroEvent::ToolUse {
            tool_use_id: "X".into(),
            name: None,
            input: Some("2}".into()),
            stop: false,
        }));
        out.push_str(&builder.process(&KiroEvent::MessageStop));

        let events = parse_sse(&out);
        let starts: Vec<&Value> = events
            .iter()
            .filter(|(e, _)| e == "content_block_start")
            .map(|(_, d)| d)
            .collect();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0]["content_block"]["type"], "tool_use");
        assert_eq!(starts[0]["content_block"]["id"], "X");
        assert_eq!(starts[0]["content_block"]["name"], "merge");

        let fragments: Vec<String> = events
            .iter()
            .filter(|(e, d)| {
                e == "content_block_delta" && d["delta"]["type"] == "input_json_delta"
            })
            .map(|(_, d)| d["delta"]["partial_json"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(fragments.len(), 3);
        let joined: String = fragments.concat();
        let parsed: Value = serde_json::from_str(&joined).unwrap();
        assert_eq!(parsed, json!({"a": 1, "b": 2}));

        let stops = events
            .iter()
            .filter(|(e, _)| e == "content_block_stop")
            .count();
        assert_eq!(stops, 1);

        let delta = events
            .iter()
            .find(|(e, _)| e == "message_delta")
            .map(|(_, d)| d)
            .unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn test_message_stop_emitted_exactly_once() {
        let mut builder = AnthropicSseBuilder::new("m", "msg_1", 0);
        let mut out = String::new();
        out.push_str(&builder.process(&KiroEvent::AssistantText("x".into())));
        out.push_str(&builder.process(&KiroEvent::MessageStop));
        out.push_str(&builder.process(&KiroEvent::MessageStop));
        out.push_str(&builder.finish());

        let count = parse_sse(&out)
            .iter()
            .filter(|(e, _)| e == "message_stop")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_text_after_tool_opens_new_block() {
        let mut builder = AnthropicSseBuilder::new("m", "msg_1", 0);
        let mut out = String::new();
        out.push_str(&builder.process(&KiroEvent::ToolUse {
            tool_use_id: "X".into(),
            name: Some("t".into()),
            input: Some("{}".into()),
            stop: true,
        }));
        out.push_str(&builder.process(&KiroEvent::AssistantText("after".into())));
        out.push_str(&builder.finish());

        let events = parse_sse(&out);
        let indexes: Vec<i64> = events
            .iter()
            .filter(|(e, _)| e == "content_block_start")
            .map(|(_, d)| d["index"].as_i64().unwrap())
            .collect();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[test]
    fn test_non_stream_response_shape() {
        let agg = AggregatedResponse {
            text: "Hello".into(),
            tool_uses: vec![ToolUse {
                id: "X".into(),
                name: "t".into(),
                input: json!({"a": 1}),
            }],
            input_tokens: 5,
            output_tokens: 7,
        };
        let resp = non_stream_response(&agg, "claude-sonnet-4", "msg_9");
        assert_eq!(resp["content"][0]["text"], "Hello");
        assert_eq!(resp["content"][1]["type"], "tool_use");
        assert_eq!(resp["stop_reason"], "tool_use");
        assert_eq!(resp["usage"]["output_tokens"], 7);
    }
}
