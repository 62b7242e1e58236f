use sha2::{Digest, Sha256};

use crate::proxy::mappers::ChatMessage;

/// 会话指纹锚定的消息前缀长度
///
/// Hashing only the opening exchange keeps the key stable as the
/// conversation grows, so every turn of one dialogue lands on the same
/// account while the affinity entry stays warm.
const PREFIX_MESSAGES: usize = 3;

/// Derive the sticky-session key from the ordered user/assistant prefix.
pub fn session_key(messages: &[ChatMessage]) -> Option<String> {
    let mut hasher = Sha256::new();
    let mut hashed = 0usize;

    for msg in messages {
        if msg.text.trim().is_empty() {
            continue;
        }
        hasher.update(msg.role.as_str().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(msg.text.as_bytes());
        hasher.update(b"\x1e");
        hashed += 1;
        if hashed == PREFIX_MESSAGES {
            break;
        }
    }

    if hashed == 0 {
        return None;
    }

    let hash = hasher.finalize();
    Some(format!("sid-{}", crate::models::credential::hex_lower(&hash[..8])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::mappers::{ChatMessage, Role};

    fn msg(role: Role, text: &str) -> ChatMessage {
        ChatMessage {
            role,
            text: text.to_string(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
        }
    }

    #[test]
    fn test_same_prefix_same_key() {
        let first = vec![msg(Role::User, "hello")];
        let second = vec![
            msg(Role::User, "hello"),
            msg(Role::Assistant, "hi!"),
            msg(Role::User, "tell me more"),
            msg(Role::Assistant, "sure"),
            msg(Role::User, "go on"),
        ];
        // 同一对话的后续轮次保持同一 key
        assert_eq!(session_key(&first), session_key(&second[..1].to_vec()));
        assert_eq!(session_key(&second[..3].to_vec()), session_key(&second));
    }

    #[test]
    fn test_different_conversations_differ() {
        let a = vec![msg(Role::User, "hello")];
        let b = vec![msg(Role::User, "goodbye")];
        assert_ne!(session_key(&a), session_key(&b));
    }

    #[test]
    fn test_role_matters() {
        let a = vec![msg(Role::User, "x")];
        let b = vec![msg(Role::Assistant, "x")];
        assert_ne!(session_key(&a), session_key(&b));
    }

    #[test]
    fn test_empty_messages_no_key() {
        assert_eq!(session_key(&[]), None);
        assert_eq!(session_key(&[msg(Role::User, "   ")]), None);
    }

    #[test]
    fn test_key_format() {
        let key = session_key(&[msg(Role::User, "hello")]).unwrap();
        assert!(key.starts_with("sid-"));
        assert_eq!(key.len(), 4 + 16);
    }
}
