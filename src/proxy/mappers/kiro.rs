// ChatInput → Kiro conversationState 载荷
//
// Upstream expects a strictly alternating user/assistant history that starts
// with a user message, a single currentMessage, and tools/toolResults hung
// off userInputMessageContext. System content is inlined into the first user
// message — the upstream shape has no system slot.

use serde_json::{json, Map, Value};

use super::{ChatInput, ChatMessage, Role, ToolSpec};

const EMPTY_PLACEHOLDER: &str = "(empty)";
const CONTINUE_PLACEHOLDER: &str = "Continue";
/// 上游对工具描述长度有限制
const TOOL_DESCRIPTION_MAX_LENGTH: usize = 10_000;

/// Build the full request payload for `POST {base}/conversation`.
pub fn build_conversation_payload(input: &ChatInput, conversation_id: &str) -> Value {
    let mut messages = merge_consecutive_roles(&input.messages);

    // 必须以 user 开头
    if messages.first().map(|m| m.role) != Some(Role::User) {
        messages.insert(0, ChatMessage::user(EMPTY_PLACEHOLDER));
    }

    // 系统提示并入首条 user 消息
    if let Some(system) = input.system.as_deref().filter(|s| !s.trim().is_empty()) {
        if let Some(first) = messages.first_mut() {
            if first.text.is_empty() || first.text == EMPTY_PLACEHOLDER {
                first.text = system.to_string();
            } else {
                first.text = format!("{}\n\n{}", system, first.text);
            }
        }
    }

    // 末尾是 assistant 时补一条 Continue，保证 currentMessage 为 user
    if messages.last().map(|m| m.role) == Some(Role::Assistant) {
        messages.push(ChatMessage::user(CONTINUE_PLACEHOLDER));
    }

    let current = messages.pop().unwrap_or_else(|| ChatMessage::user(CONTINUE_PLACEHOLDER));
    let history = build_history(&messages, &input.upstream_model);
    let current_message = build_current_message(&current, input, &input.upstream_model);

    let mut conversation_state = json!({
        "chatTriggerType": "MANUAL",
        "conversationId": conversation_id,
        "currentMessage": current_message,
    });
    if !history.is_empty() {
        conversation_state["history"] = Value::Array(history);
    }

    json!({ "conversationState": conversation_state })
}

/// 连续同角色消息合并为一条（文本换行拼接，附件顺序保留）
fn merge_consecutive_roles(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut merged: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        match merged.last_mut() {
            Some(last) if last.role == msg.role => {
                if !msg.text.is_empty() {
                    if last.text.is_empty() {
                        last.text = msg.text.clone();
                    } else {
                        last.text = format!("{}\n\n{}", last.text, msg.text);
                    }
                }
                last.tool_uses.extend(msg.tool_uses.iter().cloned());
                last.tool_results.extend(msg.tool_results.iter().cloned());
                last.images.extend(msg.images.iter().cloned());
            }
            _ => merged.push(msg.clone()),
        }
    }
    merged
}

fn build_history(messages: &[ChatMessage], model_id: &str) -> Vec<Value> {
    let mut history = Vec::with_capacity(messages.len());
    let mut expect = Role::User;

    for msg in messages {
        // 合并后仍可能出现角色空洞（如首条为 assistant 的残段），补占位
        if msg.role != expect {
            history.push(filler_entry(expect, model_id));
        }
        history.push(history_entry(msg, model_id));
        expect = match msg.role {
            Role::User => Role::Assistant,
            Role::Assistant => Role::User,
        };
    }

    // history 必须以 assistant 收尾（currentMessage 是下一条 user）
    if expect == Role::Assistant && !history.is_empty() {
        history.push(filler_entry(Role::Assistant, model_id));
    }
    history
}

fn filler_entry(role: Role, model_id: &str) -> Value {
    match role {
        Role::User => json!({
            "userInputMessage": {
                "content": EMPTY_PLACEHOLDER,
                "modelId": model_id,
                "origin": "AI_EDITOR",
            }
        }),
        Role::Assistant => json!({
            "assistantResponseMessage": { "content": EMPTY_PLACEHOLDER }
        }),
    }
}

fn history_entry(msg: &ChatMessage, model_id: &str) -> Value {
    match msg.role {
        Role::User => {
            let content = if msg.text.is_empty() {
                EMPTY_PLACEHOLDER
            } else {
                msg.text.as_str()
            };
            let mut user_input = json!({
                "content": content,
                "modelId": model_id,
                "origin": "AI_EDITOR",
            });
            if !msg.images.is_empty() {
                user_input["images"] = images_json(msg);
            }
            if !msg.tool_results.is_empty() {
                user_input["userInputMessageContext"] = json!({
                    "toolResults": tool_results_json(msg),
                });
            }
            json!({ "userInputMessage": user_input })
        }
        Role::Assistant => {
            let content = if msg.text.is_empty() {
                EMPTY_PLACEHOLDER
            } else {
                msg.text.as_str()
            };
            let mut assistant = json!({ "content": content });
            if !msg.tool_uses.is_empty() {
                let uses: Vec<Value> = msg
                    .tool_uses
                    .iter()
                    .map(|t| {
                        json!({
                            "toolUseId": t.id,
                            "name": t.name,
                            "input": t.input,
                        })
                    })
                    .collect();
                assistant["toolUses"] = Value::Array(uses);
            }
            json!({ "assistantResponseMessage": assistant })
        }
    }
}

fn build_current_message(current: &ChatMessage, input: &ChatInput, model_id: &str) -> Value {
    let content = if current.text.is_empty() {
        CONTINUE_PLACEHOLDER
    } else {
        current.text.as_str()
    };

    let mut user_input = json!({
        "content": content,
        "modelId": model_id,
        "origin": "AI_EDITOR",
    });

    if !current.images.is_empty() {
        user_input["images"] = images_json(current);
    }

    let mut context = Map::new();
    if !input.tools.is_empty() {
        context.insert("tools".to_string(), Value::Array(tool_specifications(&input.tools)));
    }
    if !current.tool_results.is_empty() {
        context.insert("toolResults".to_string(), tool_results_json(current));
    }
    if !context.is_empty() {
        user_input["userInputMessageContext"] = Value::Object(context);
    }

    json!({ "userInputMessage": user_input })
}

fn images_json(msg: &ChatMessage) -> Value {
    let images: Vec<Value> = msg
        .images
        .iter()
        .map(|img| {
            json!({
                "format": img.format,
                "source": { "bytes": img.data },
            })
        })
        .collect();
    Value::Array(images)
}

fn tool_results_json(msg: &ChatMessage) -> Value {
    let results: Vec<Value> = msg
        .tool_results
        .iter()
        .map(|r| {
            json!({
                "toolUseId": r.tool_use_id,
                "content": [{"text": r.content}],
                "status": if r.is_error { "error" } else { "success" },
            })
        })
        .collect();
    Value::Array(results)
}

fn tool_specifications(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let description: String = tool.description.chars().take(TOOL_DESCRIPTION_MAX_LENGTH).collect();
            json!({
                "toolSpecification": {
                    "name": tool.name,
                    "description": description,
                    "inputSchema": { "json": tool.input_schema },
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::mappers::{ImageAttachment, ToolResult, ToolUse};

    fn input(messages: Vec<ChatMessage>) -> ChatInput {
        ChatInput {
            client_model: "gpt-4o".into(),
            upstream_model: "claude-sonnet-4".into(),
            system: None,
            messages,
            tools: Vec::new(),
            stream: false,
        }
    }

    #[test]
    fn test_single_user_message() {
        let payload = build_conversation_payload(&input(vec![ChatMessage::user("hi")]), "conv-1");
        let state = &payload["conversationState"];
        assert_eq!(state["conversationId"], "conv-1");
        assert_eq!(state["chatTriggerType"], "MANUAL");
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["content"],
            "hi"
        );
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["modelId"],
            "claude-sonnet-4"
        );
        assert!(state.get("history").is_none());
    }

    #[test]
    fn test_system_inlined_into_first_user() {
        let mut i = input(vec![
            ChatMessage::user("question"),
            ChatMessage::assistant("answer"),
            ChatMessage::user("follow-up"),
        ]);
        i.system = Some("You are terse.".into());

        let payload = build_conversation_payload(&i, "c");
        let history = payload["conversationState"]["history"].as_array().unwrap();
        assert_eq!(
            history[0]["userInputMessage"]["content"],
            "You are terse.\n\nquestion"
        );
        assert_eq!(history[1]["assistantResponseMessage"]["content"], "answer");
        assert_eq!(
            payload["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "follow-up"
        );
    }

    #[test]
    fn test_consecutive_same_role_collapsed() {
        let i = input(vec![
            ChatMessage::user("part one"),
            ChatMessage::user("part two"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("next"),
        ]);
        let payload = build_conversation_payload(&i, "c");
        let history = payload["conversationState"]["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[0]["userInputMessage"]["content"],
            "part one\n\npart two"
        );
    }

    #[test]
    fn test_assistant_last_appends_continue() {
        let i = input(vec![
            ChatMessage::user("q"),
            ChatMessage::assistant("partial answer"),
        ]);
        let payload = build_conversation_payload(&i, "c");
        assert_eq!(
            payload["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "Continue"
        );
        let history = payload["conversationState"]["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_assistant_first_gets_user_filler() {
        let i = input(vec![ChatMessage::assistant("greeting"), ChatMessage::user("q")]);
        let payload = build_conversation_payload(&i, "c");
        let history = payload["conversationState"]["history"].as_array().unwrap();
        assert!(history[0]["userInputMessage"].is_object());
        assert!(history[1]["assistantResponseMessage"].is_object());
    }

    #[test]
    fn test_tools_and_tool_results_on_current_message() {
        let mut current = ChatMessage::user("run it");
        current.tool_results.push(ToolResult {
            tool_use_id: "T1".into(),
            content: "42".into(),
            is_error: false,
        });
        let mut i = input(vec![current]);
        i.tools.push(ToolSpec {
            name: "get_answer".into(),
            description: "Returns the answer".into(),
            input_schema: json!({"type": "object"}),
        });

        let payload = build_conversation_payload(&i, "c");
        let context =
            &payload["conversationState"]["currentMessage"]["userInputMessage"]["userInputMessageContext"];
        assert_eq!(
            context["tools"][0]["toolSpecification"]["name"],
            "get_answer"
        );
        assert_eq!(context["toolResults"][0]["toolUseId"], "T1");
        assert_eq!(context["toolResults"][0]["status"], "success");
    }

    #[test]
    fn test_assistant_tool_uses_in_history() {
        let mut assistant = ChatMessage::assistant("calling tool");
        assistant.tool_uses.push(ToolUse {
            id: "T1".into(),
            name: "get_weather".into(),
            input: json!({"city": "Paris"}),
        });
        let i = input(vec![
            ChatMessage::user("weather?"),
            assistant,
            ChatMessage::user("thanks"),
        ]);
        let payload = build_conversation_payload(&i, "c");
        let history = payload["conversationState"]["history"].as_array().unwrap();
        assert_eq!(
            history[1]["assistantResponseMessage"]["toolUses"][0]["name"],
            "get_weather"
        );
    }

    #[test]
    fn test_images_attached() {
        let mut current = ChatMessage::user("look");
        current.images.push(ImageAttachment {
            format: "png".into(),
            data: "aGVsbG8=".into(),
        });
        let payload = build_conversation_payload(&input(vec![current]), "c");
        let images =
            &payload["conversationState"]["currentMessage"]["userInputMessage"]["images"];
        assert_eq!(images[0]["format"], "png");
        assert_eq!(images[0]["source"]["bytes"], "aGVsbG8=");
    }
}
