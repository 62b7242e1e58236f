use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// 单次客户端请求的终态摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: String,
    /// "openai" | "anthropic" | "gemini"
    pub protocol: String,
    pub client_model: String,
    pub upstream_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Unix milliseconds.
    pub started_at: i64,
    pub finished_at: i64,
    pub status: FlowStatus,
    pub tokens_in: u32,
    pub tokens_out: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Success,
    Failure,
    Cancelled,
}

/// 请求终态的外部接收方。核心只负责调用 record()，存储由外部实现。
pub trait FlowSink: Send + Sync {
    fn record(&self, flow: FlowRecord);
}

/// In-memory ring buffer sink, newest first. Backs `GET /api/flows`.
pub struct MemoryFlowSink {
    flows: RwLock<VecDeque<FlowRecord>>,
    max_flows: usize,
}

impl MemoryFlowSink {
    pub fn new(max_flows: usize) -> Self {
        Self {
            flows: RwLock::new(VecDeque::with_capacity(max_flows)),
            max_flows,
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<FlowRecord> {
        let flows = self.flows.read().await;
        flows.iter().take(limit).cloned().collect()
    }
}

impl FlowSink for MemoryFlowSink {
    fn record(&self, flow: FlowRecord) {
        tracing::debug!(
            "[Flow] {} {} account={:?} status={:?} in={} out={}",
            flow.protocol,
            flow.id,
            flow.account_id,
            flow.status,
            flow.tokens_in,
            flow.tokens_out
        );
        // record() is sync by contract; push from a blocking-free path
        let mut flows = match self.flows.try_write() {
            Ok(guard) => guard,
            Err(_) => {
                // 写锁竞争极少见；丢弃一条比阻塞请求路径好
                tracing::warn!("[Flow] sink contended, dropping record {}", flow.id);
                return;
            }
        };
        if flows.len() >= self.max_flows {
            flows.pop_back();
        }
        flows.push_front(flow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(id: &str) -> FlowRecord {
        FlowRecord {
            id: id.to_string(),
            protocol: "openai".into(),
            client_model: "gpt-4o".into(),
            upstream_model: "claude-sonnet-4".into(),
            account_id: Some("acct".into()),
            started_at: 1,
            finished_at: 2,
            status: FlowStatus::Success,
            tokens_in: 10,
            tokens_out: 20,
            error_kind: None,
        }
    }

    #[tokio::test]
    async fn test_ring_buffer_caps_and_orders() {
        let sink = MemoryFlowSink::new(2);
        sink.record(flow("a"));
        sink.record(flow("b"));
        sink.record(flow("c"));

        let recent = sink.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "c");
        assert_eq!(recent[1].id, "b");
    }

    #[test]
    fn test_flow_status_serializes_snake_case() {
        let json = serde_json::to_string(&FlowStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }
}
