// AWS event-stream decoder for the Kiro conversation endpoint.
//
// Frame layout: total_len(u32 BE) | headers_len(u32 BE) | prelude_crc(u32)
// | headers | payload | message_crc(u32). Headers are name_len(u8), name,
// value_type(u8, 7 = string), value_len(u16 BE), value. The event type
// arrives in the `:event-type` header; the payload is a small JSON object.

use bytes::BytesMut;
use serde_json::Value;
use tracing::{debug, warn};

/// 帧长度上限，超出视为流已损坏
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;

/// Decoded upstream event.
#[derive(Debug, Clone, PartialEq)]
pub enum KiroEvent {
    /// assistantResponseEvent — one text delta.
    AssistantText(String),
    /// toolUseEvent — one tool-call fragment. `name` arrives on the first
    /// fragment for a toolUseId, `input` carries incremental argument JSON,
    /// `stop` marks the last fragment of that tool call.
    ToolUse {
        tool_use_id: String,
        name: Option<String>,
        input: Option<String>,
        stop: bool,
    },
    /// followupPromptEvent — upstream-suggested next prompt, not forwarded.
    FollowupPrompt(String),
    /// Terminal event.
    MessageStop,
}

/// Incremental frame decoder. Feed raw chunks, drain complete events.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buf: BytesMut,
    corrupt: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        if !self.corrupt {
            self.buf.extend_from_slice(chunk);
        }
    }

    /// Next complete event, or None when more bytes are needed.
    /// Unknown or malformed frames are skipped, not fatal.
    pub fn next_event(&mut self) -> Option<KiroEvent> {
        loop {
            if self.corrupt || self.buf.len() < PRELUDE_LEN {
                return None;
            }

            let total_len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            let headers_len =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;

            if total_len < PRELUDE_LEN + CRC_LEN
                || total_len > MAX_FRAME_LEN
                || headers_len > total_len - PRELUDE_LEN - CRC_LEN
            {
                warn!(
                    "[EventStream] invalid frame prelude (total={}, headers={}), dropping stream",
                    total_len, headers_len
                );
                self.corrupt = true;
                return None;
            }

            if self.buf.len() < total_len {
                return None;
            }

            let frame = self.buf.split_to(total_len);
            let headers = &frame[PRELUDE_LEN..PRELUDE_LEN + headers_len];
            let payload = &frame[PRELUDE_LEN + headers_len..total_len - CRC_LEN];

            let event_type = parse_event_type(headers);
            match decode_event(event_type.as_deref(), payload) {
                Some(event) => return Some(event),
                None => continue, // skipped frame, try the next one
            }
        }
    }

    /// True when the decoder gave up on a corrupted stream.
    pub fn is_corrupt(&self) -> bool {
        self.corrupt
    }
}

/// 从帧头中取出 `:event-type` 的字符串值
fn parse_event_type(mut headers: &[u8]) -> Option<String> {
    let mut result = None;
    while headers.len() >= 2 {
        let name_len = headers[0] as usize;
        headers = &headers[1..];
        if headers.len() < name_len + 1 {
            break;
        }
        let name = &headers[..name_len];
        headers = &headers[name_len..];

        let value_type = headers[0];
        headers = &headers[1..];

        // Only type 7 (string) appears in practice; anything else ends parsing.
        if value_type != 7 || headers.len() < 2 {
            break;
        }
        let value_len = u16::from_be_bytes([headers[0], headers[1]]) as usize;
        headers = &headers[2..];
        if headers.len() < value_len {
            break;
        }
        let value = &headers[..value_len];
        headers = &headers[value_len..];

        if name == b":event-type" {
            result = String::from_utf8(value.to_vec()).ok();
        }
    }
    result
}

/// 帧 → 事件。未知类型按载荷字段兜底识别。
fn decode_event(event_type: Option<&str>, payload: &[u8]) -> Option<KiroEvent> {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            if !payload.is_empty() {
                debug!("[EventStream] unparseable payload ({} bytes): {}", payload.len(), e);
            }
            // messageStop frames may carry an empty payload
            if matches!(event_type, Some("messageStopEvent") | Some("messageStop")) {
                return Some(KiroEvent::MessageStop);
            }
            return None;
        }
    };

    match event_type {
        Some("assistantResponseEvent") | Some("assistantResponseMessage") => value
            .get("content")
            .and_then(|c| c.as_str())
            .map(|c| KiroEvent::AssistantText(c.to_string())),
        Some("toolUseEvent") => decode_tool_use(&value),
        Some("followupPromptEvent") => {
            let content = value
                .get("followupPrompt")
                .and_then(|f| f.get("content"))
                .and_then(|c| c.as_str())
                .unwrap_or_default();
            Some(KiroEvent::FollowupPrompt(content.to_string()))
        }
        Some("messageStopEvent") | Some("messageStop") => Some(KiroEvent::MessageStop),
        _ => {
            // 无头帧：按字段推断
            if value.get("toolUseId").is_some() {
                decode_tool_use(&value)
            } else if let Some(content) = value.get("content").and_then(|c| c.as_str()) {
                Some(KiroEvent::AssistantText(content.to_string()))
            } else if value.get("stop").and_then(|s| s.as_bool()) == Some(true) {
                Some(KiroEvent::MessageStop)
            } else {
                None
            }
        }
    }
}

fn decode_tool_use(value: &Value) -> Option<KiroEvent> {
    let tool_use_id = value.get("toolUseId")?.as_str()?.to_string();
    Some(KiroEvent::ToolUse {
        tool_use_id,
        name: value
            .get("name")
            .and_then(|n| n.as_str())
            .filter(|n| !n.is_empty())
            .map(String::from),
        input: value
            .get("input")
            .and_then(|i| i.as_str())
            .map(String::from),
        stop: value.get("stop").and_then(|s| s.as_bool()).unwrap_or(false),
    })
}

#[cfg(test)]
pub(crate) fn encode_frame(event_type: &str, payload: &[u8]) -> Vec<u8> {
    let name = b":event-type";
    let headers_len = 1 + name.len() + 1 + 2 + event_type.len();
    let total_len = PRELUDE_LEN + headers_len + payload.len() + CRC_LEN;

    let mut frame = Vec::with_capacity(total_len);
    frame.extend_from_slice(&(total_len as u32).to_be_bytes());
    frame.extend_from_slice(&(headers_len as u32).to_be_bytes());
    frame.extend_from_slice(&[0u8; 4]); // prelude crc (unchecked)
    frame.push(name.len() as u8);
    frame.extend_from_slice(name);
    frame.push(7u8);
    frame.extend_from_slice(&(event_type.len() as u16).to_be_bytes());
    frame.extend_from_slice(event_type.as_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&[0u8; 4]); // message crc (unchecked)
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut EventStreamDecoder) -> Vec<KiroEvent> {
        let mut events = Vec::new();
        while let Some(e) = decoder.next_event() {
            events.push(e);
        }
        events
    }

    #[test]
    fn test_single_text_frame() {
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&encode_frame(
            "assistantResponseEvent",
            br#"{"content":"Hello"}"#,
        ));
        assert_eq!(
            drain(&mut decoder),
            vec![KiroEvent::AssistantText("Hello".into())]
        );
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let frame = encode_frame("assistantResponseEvent", br#"{"content":"partial"}"#);
        let mut decoder = EventStreamDecoder::new();

        decoder.feed(&frame[..7]);
        assert_eq!(decoder.next_event(), None);
        decoder.feed(&frame[7..frame.len() - 3]);
        assert_eq!(decoder.next_event(), None);
        decoder.feed(&frame[frame.len() - 3..]);
        assert_eq!(
            drain(&mut decoder),
            vec![KiroEvent::AssistantText("partial".into())]
        );
    }

    #[test]
    fn test_tool_use_fragments() {
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&encode_frame(
            "toolUseEvent",
            br#"{"toolUseId":"X","name":"get_weather"}"#,
        ));
        decoder.feed(&encode_frame(
            "toolUseEvent",
            br#"{"toolUseId":"X","input":"{\"a\":"}"#,
        ));
        decoder.feed(&encode_frame(
            "toolUseEvent",
            br#"{"toolUseId":"X","input":"1}","stop":true}"#,
        ));

        let events = drain(&mut decoder);
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            KiroEvent::ToolUse {
                tool_use_id: "X".into(),
                name: Some("get_weather".into()),
                input: None,
                stop: false,
            }
        );
        assert_eq!(
            events[2],
            KiroEvent::ToolUse {
                tool_use_id: "X".into(),
                name: None,
                input: Some("1}".into()),
                stop: true,
            }
        );
    }

    #[test]
    fn test_message_stop_and_followup() {
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&encode_frame(
            "followupPromptEvent",
            br#"{"followupPrompt":{"content":"More?"}}"#,
        ));
        decoder.feed(&encode_frame("messageStopEvent", br#"{}"#));

        assert_eq!(
            drain(&mut decoder),
            vec![
                KiroEvent::FollowupPrompt("More?".into()),
                KiroEvent::MessageStop
            ]
        );
    }

    #[test]
    fn test_unknown_event_skipped() {
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&encode_frame("metricsEvent", br#"{"latencyMs":12}"#));
        decoder.feed(&encode_frame("assistantResponseEvent", br#"{"content":"ok"}"#));
        assert_eq!(drain(&mut decoder), vec![KiroEvent::AssistantText("ok".into())]);
    }

    #[test]
    fn test_headerless_frame_inferred_from_payload() {
        // 某些网关剥掉事件头，仅剩 JSON 字段
        let name = b"x-ignored";
        let payload = br#"{"content":"inferred"}"#;
        let headers_len = 1 + name.len() + 1 + 2 + 1;
        let total_len = PRELUDE_LEN + headers_len + payload.len() + CRC_LEN;
        let mut frame = Vec::new();
        frame.extend_from_slice(&(total_len as u32).to_be_bytes());
        frame.extend_from_slice(&(headers_len as u32).to_be_bytes());
        frame.extend_from_slice(&[0u8; 4]);
        frame.push(name.len() as u8);
        frame.extend_from_slice(name);
        frame.push(7u8);
        frame.extend_from_slice(&1u16.to_be_bytes());
        frame.push(b'y');
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&[0u8; 4]);

        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&frame);
        assert_eq!(
            drain(&mut decoder),
            vec![KiroEvent::AssistantText("inferred".into())]
        );
    }

    #[test]
    fn test_corrupt_prelude_poisons_stream() {
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&[0xFF; 64]);
        assert_eq!(decoder.next_event(), None);
        assert!(decoder.is_corrupt());
    }

    use proptest::prelude::*;

    proptest! {
        /// Decoding is chunking-invariant: any split of the byte stream
        /// yields the same events.
        #[test]
        fn prop_chunking_invariant(
            texts in proptest::collection::vec("[a-zA-Z0-9 ]{0,40}", 1..8),
            split in 1usize..200,
        ) {
            let mut stream = Vec::new();
            for t in &texts {
                let payload = serde_json::json!({"content": t}).to_string();
                stream.extend_from_slice(&encode_frame("assistantResponseEvent", payload.as_bytes()));
            }
            stream.extend_from_slice(&encode_frame("messageStopEvent", b"{}"));

            let mut whole = EventStreamDecoder::new();
            whole.feed(&stream);
            let expected = drain(&mut whole);

            let mut chunked = EventStreamDecoder::new();
            for chunk in stream.chunks(split) {
                chunked.feed(chunk);
            }
            let actual = drain(&mut chunked);

            prop_assert_eq!(expected, actual);
        }
    }
}
