pub mod anthropic;
pub mod gemini;
pub mod kiro;
pub mod openai;

use serde_json::Value;

use crate::error::ProxyError;
use crate::proxy::upstream::event_stream::KiroEvent;

/// 流式出站翻译器：上游事件 → 协议帧文本
///
/// Explicit state machines, one per protocol. `process` returns the bytes to
/// forward immediately (possibly empty while buffering), `finish` closes any
/// open blocks, `error_event` renders an in-band mid-stream error.
pub trait StreamTranslator: Send + 'static {
    fn process(&mut self, event: &KiroEvent) -> String;
    fn finish(&mut self) -> String;
    fn error_event(&self, err: &ProxyError) -> String;
}

/// 客户端协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    OpenAi,
    Anthropic,
    Gemini,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenAi => "openai",
            Protocol::Anthropic => "anthropic",
            Protocol::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// 助手消息中的一次完整工具调用
#[derive(Debug, Clone)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// 用户消息中携带的工具执行结果
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Inline image attachment, base64 bytes plus short format tag ("png", "jpeg").
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub format: String,
    pub data: String,
}

/// 规范化后的一条对话消息（三种协议解析后的公共形态）
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    pub tool_uses: Vec<ToolUse>,
    pub tool_results: Vec<ToolResult>,
    pub images: Vec<ImageAttachment>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
        }
    }
}

/// 客户端工具声明
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// 三种协议统一的入站请求形态，交给 kiro mapper 组装上游载荷
#[derive(Debug, Clone)]
pub struct ChatInput {
    pub client_model: String,
    pub upstream_model: String,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub stream: bool,
}

/// 聚合后的完整响应（非流式路径物化用）
#[derive(Debug, Clone, Default)]
pub struct AggregatedResponse {
    pub text: String,
    pub tool_uses: Vec<ToolUse>,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl AggregatedResponse {
    pub fn stop_reason(&self) -> &'static str {
        if self.tool_uses.is_empty() {
            "end_turn"
        } else {
            "tool_use"
        }
    }
}

// 估算系数：Claude 分词比 cl100k 约多 15%
const CLAUDE_CORRECTION_FACTOR: f64 = 1.15;

/// chars/4 token heuristic with the Claude correction factor.
pub fn estimate_tokens(text: &str) -> u32 {
    estimate_tokens_from_chars(text.len())
}

pub fn estimate_tokens_from_chars(chars: usize) -> u32 {
    if chars == 0 {
        return 0;
    }
    let base = (chars / 4).max(1);
    (base as f64 * CLAUDE_CORRECTION_FACTOR) as u32
}

/// 对整个入站请求的 token 估算（count_tokens 与 usage 字段共用）
pub fn estimate_input_tokens(input: &ChatInput) -> u32 {
    let mut total: u32 = 0;
    if let Some(system) = &input.system {
        total += estimate_tokens(system);
    }
    for msg in &input.messages {
        total += 4;
        total += estimate_tokens(&msg.text);
        for result in &msg.tool_results {
            total += estimate_tokens(&result.content);
        }
        for tool_use in &msg.tool_uses {
            total += estimate_tokens(&tool_use.input.to_string());
        }
        total += msg.images.len() as u32 * 100;
    }
    total + 3
}
