// 单请求编排：算会话键 → 选号 → 上游调用 → 失败转移 → 出站流
//
// Failover budget: up to 3 send attempts for Network/5xx with 0.5/1/2s
// backoff, staying on the same account until it fails twice; up to 3 accounts
// total per request. Quota failures cool the account and switch immediately.
// Once the first byte reaches the client there is no failover, only an
// in-band error event.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::{RefreshError, TokenRefresher};
use crate::error::ProxyError;
use crate::models::{FlowRecord, FlowSink, FlowStatus};
use crate::proxy::errors::{classify_network_error, classify_upstream_error};
use crate::proxy::mappers::{
    estimate_tokens_from_chars, AggregatedResponse, ChatInput, Protocol, StreamTranslator, ToolUse,
};
use crate::proxy::pool::{AccountPool, SelectedAccount};
use crate::proxy::session::session_key;
use crate::proxy::upstream::{backoff_delay, EventStreamDecoder, KiroEvent, UpstreamClient};

/// 全请求最多尝试的账号数（首选 + 2 个备选）
const MAX_ACCOUNT_ATTEMPTS: usize = 3;
/// Network/5xx 整请求重试上限
const MAX_SEND_ATTEMPTS: usize = 3;
/// 同一账号连续失败多少次后换号
const SAME_ACCOUNT_FAILURE_LIMIT: u32 = 2;

pub struct DispatchOutcome {
    pub account: SelectedAccount,
    pub response: reqwest::Response,
}

/// 选号并发出上游请求，处理重试与故障转移，返回已确认 2xx 的响应
pub async fn dispatch(
    pool: &AccountPool,
    refresher: &TokenRefresher,
    upstream: &UpstreamClient,
    input: &ChatInput,
) -> Result<DispatchOutcome, ProxyError> {
    let key = session_key(&input.messages);
    let payload = crate::proxy::mappers::kiro::build_conversation_payload(
        input,
        &uuid::Uuid::new_v4().to_string(),
    );

    let mut account = pool.select(key.as_deref()).await?;
    let mut accounts_tried = 1usize;
    let mut send_attempts = 0usize;
    let mut same_account_failures = 0u32;
    let mut refreshed_this_account = false;

    loop {
        let err = match upstream
            .send_conversation(&account.access_token, &account.id, &payload)
            .await
        {
            Ok(response) if response.status().is_success() => {
                pool.report_success(&account.id).await;
                return Ok(DispatchOutcome { account, response });
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                classify_upstream_error(status, &body)
            }
            Err(err) => err,
        };

        match &err {
            // 重试无意义，立刻浮出
            ProxyError::ContentTooLong(_) => {
                pool.report_failure(&account.id, &err).await;
                return Err(err);
            }
            ProxyError::QuotaExceeded(_) => {
                pool.report_failure(&account.id, &err).await;
                if accounts_tried >= MAX_ACCOUNT_ATTEMPTS {
                    return Err(err);
                }
                let next = pool
                    .select_excluding(key.as_deref(), Some(&account.id))
                    .await
                    .map_err(|_| err)?;
                info!("[Orchestrator] quota hit, switching {} → {}", account.id, next.id);
                account = next;
                accounts_tried += 1;
                same_account_failures = 0;
                refreshed_this_account = false;
            }
            ProxyError::AuthExpired => {
                if !refreshed_this_account {
                    refreshed_this_account = true;
                    match refresher.refresh(pool, &account.id).await {
                        Ok(token) => {
                            debug!("[Orchestrator] token refreshed for {}", account.id);
                            account.access_token = token.access_token;
                            account.expires_at = token.expires_at;
                            continue;
                        }
                        Err(RefreshError::InvalidRefreshToken) => {
                            // 账号已被刷新器转 Unhealthy，换号
                        }
                        Err(e) => {
                            warn!("[Orchestrator] refresh failed for {}: {}", account.id, e);
                        }
                    }
                } else {
                    pool.report_failure(&account.id, &err).await;
                }
                if accounts_tried >= MAX_ACCOUNT_ATTEMPTS {
                    return Err(ProxyError::AuthExpired);
                }
                let next = pool
                    .select_excluding(key.as_deref(), Some(&account.id))
                    .await
                    .map_err(|_| ProxyError::AuthExpired)?;
                account = next;
                accounts_tried += 1;
                same_account_failures = 0;
                refreshed_this_account = false;
            }
            ProxyError::Network(_) | ProxyError::UpstreamServerError { .. } => {
                pool.report_failure(&account.id, &err).await;
                send_attempts += 1;
                if send_attempts >= MAX_SEND_ATTEMPTS {
                    return Err(err);
                }
                tokio::time::sleep(backoff_delay(send_attempts - 1)).await;
                same_account_failures += 1;
                if same_account_failures >= SAME_ACCOUNT_FAILURE_LIMIT {
                    if accounts_tried >= MAX_ACCOUNT_ATTEMPTS {
                        return Err(err);
                    }
                    let next = pool
                        .select_excluding(key.as_deref(), Some(&account.id))
                        .await
                        .map_err(|_| err)?;
                    info!(
                        "[Orchestrator] repeated failures, switching {} → {}",
                        account.id, next.id
                    );
                    account = next;
                    accounts_tried += 1;
                    same_account_failures = 0;
                    refreshed_this_account = false;
                }
            }
            _ => return Err(err),
        }
    }
}

// ===== Flow records =====

/// 请求级 Flow 记录装配器
pub struct FlowTracker {
    id: String,
    protocol: &'static str,
    client_model: String,
    upstream_model: String,
    account_id: Option<String>,
    started_at: i64,
    tokens_in: u32,
    output_chars: usize,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl FlowTracker {
    pub fn new(protocol: Protocol, input: &ChatInput, tokens_in: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            protocol: protocol.as_str(),
            client_model: input.client_model.clone(),
            upstream_model: input.upstream_model.clone(),
            account_id: None,
            started_at: now_ms(),
            tokens_in,
            output_chars: 0,
        }
    }

    pub fn set_account(&mut self, id: &str) {
        self.account_id = Some(id.to_string());
    }

    fn observe(&mut self, event: &KiroEvent) {
        match event {
            KiroEvent::AssistantText(text) => self.output_chars += text.len(),
            KiroEvent::ToolUse { input: Some(s), .. } => self.output_chars += s.len(),
            _ => {}
        }
    }

    fn into_record(self, status: FlowStatus, error_kind: Option<&str>) -> FlowRecord {
        FlowRecord {
            id: self.id,
            protocol: self.protocol.to_string(),
            client_model: self.client_model,
            upstream_model: self.upstream_model,
            account_id: self.account_id,
            started_at: self.started_at,
            finished_at: now_ms(),
            status,
            tokens_in: self.tokens_in,
            tokens_out: estimate_tokens_from_chars(self.output_chars),
            error_kind: error_kind.map(String::from),
        }
    }

    /// 请求在发流前就失败时直接落一条失败记录
    pub fn record_failure(self, sink: &dyn FlowSink, err: &ProxyError) {
        sink.record(self.into_record(FlowStatus::Failure, Some(err.kind())));
    }

    pub fn record_success(self, sink: &dyn FlowSink, tokens_out: u32) {
        let mut record = self.into_record(FlowStatus::Success, None);
        record.tokens_out = tokens_out;
        sink.record(record);
    }
}

// ===== Streaming pipeline =====

/// 把已确认 2xx 的上游响应接到协议翻译器上，产出 SSE Body。
///
/// 客户端断开（send 失败）时：丢弃上游流（连接随 drop 中止）并落一条
/// cancelled Flow 记录。流中途的上游错误以带内事件收尾，不做换号重试。
pub fn stream_response<T: StreamTranslator>(
    response: reqwest::Response,
    mut translator: T,
    idle_timeout: Duration,
    mut flow: FlowTracker,
    sink: Arc<dyn FlowSink>,
) -> axum::body::Body {
    let (mut tx, rx) = futures::channel::mpsc::channel::<Result<Bytes, std::convert::Infallible>>(32);

    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        let mut decoder = EventStreamDecoder::new();

        let outcome: (FlowStatus, Option<String>) = loop {
            match tokio::time::timeout(idle_timeout, stream.next()).await {
                // 块间静默超时 → Network
                Err(_) => {
                    let err = ProxyError::Network("idle timeout between chunks".into());
                    warn!("[Stream] {}", err);
                    let event = translator.error_event(&err);
                    let _ = tx.send(Ok(Bytes::from(event))).await;
                    break (FlowStatus::Failure, Some(err.kind().to_string()));
                }
                Ok(None) => {
                    let tail = translator.finish();
                    if !tail.is_empty() && tx.send(Ok(Bytes::from(tail))).await.is_err() {
                        break (FlowStatus::Cancelled, None);
                    }
                    break (FlowStatus::Success, None);
                }
                Ok(Some(Err(e))) => {
                    let err = classify_network_error(&e);
                    warn!("[Stream] upstream read failed: {}", err);
                    let event = translator.error_event(&err);
                    let _ = tx.send(Ok(Bytes::from(event))).await;
                    break (FlowStatus::Failure, Some(err.kind().to_string()));
                }
                Ok(Some(Ok(chunk))) => {
                    decoder.feed(&chunk);
                    let mut out = String::new();
                    while let Some(event) = decoder.next_event() {
                        flow.observe(&event);
                        out.push_str(&translator.process(&event));
                    }
                    if !out.is_empty() && tx.send(Ok(Bytes::from(out))).await.is_err() {
                        // 客户端已断开；drop 上游流即关闭连接
                        debug!("[Stream] client disconnected, aborting upstream");
                        break (FlowStatus::Cancelled, None);
                    }
                    if decoder.is_corrupt() {
                        let err = ProxyError::Network("upstream event stream corrupted".into());
                        let event = translator.error_event(&err);
                        let _ = tx.send(Ok(Bytes::from(event))).await;
                        break (FlowStatus::Failure, Some(err.kind().to_string()));
                    }
                }
            }
        };

        let (status, error_kind) = outcome;
        sink.record(flow.into_record(status, error_kind.as_deref()));
    });

    axum::body::Body::from_stream(rx)
}

// ===== Non-streaming aggregation =====

struct ToolBuffer {
    id: String,
    name: String,
    input: String,
}

/// 完整消费上游流并物化为聚合响应（非流式路径）
pub async fn aggregate_response(
    response: reqwest::Response,
    idle_timeout: Duration,
    tokens_in: u32,
) -> Result<AggregatedResponse, ProxyError> {
    let mut stream = response.bytes_stream();
    let mut decoder = EventStreamDecoder::new();
    let mut text = String::new();
    let mut tools: Vec<ToolBuffer> = Vec::new();

    loop {
        match tokio::time::timeout(idle_timeout, stream.next()).await {
            Err(_) => return Err(ProxyError::Network("idle timeout between chunks".into())),
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(classify_network_error(&e)),
            Ok(Some(Ok(chunk))) => {
                decoder.feed(&chunk);
                while let Some(event) = decoder.next_event() {
                    match event {
                        KiroEvent::AssistantText(t) => text.push_str(&t),
                        KiroEvent::ToolUse {
                            tool_use_id,
                            name,
                            input,
                            ..
                        } => {
                            let idx = match tools.iter().position(|t| t.id == tool_use_id) {
                                Some(idx) => idx,
                                None => {
                                    tools.push(ToolBuffer {
                                        id: tool_use_id.clone(),
                                        name: String::new(),
                                        input: String::new(),
                                    });
                                    tools.len() - 1
                                }
                            };
                            let slot = &mut tools[idx];
                            if let Some(n) = name {
                                if slot.name.is_empty() {
                                    slot.name = n;
                                }
                            }
                            if let Some(fragment) = input {
                                slot.input.push_str(&fragment);
                            }
                        }
                        KiroEvent::FollowupPrompt(_) => {}
                        KiroEvent::MessageStop => {}
                    }
                }
                if decoder.is_corrupt() {
                    return Err(ProxyError::Network("upstream event stream corrupted".into()));
                }
            }
        }
    }

    let output_chars = text.len() + tools.iter().map(|t| t.input.len()).sum::<usize>();
    let tool_uses = tools
        .into_iter()
        .map(|t| {
            let input: Value = if t.input.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&t.input).unwrap_or_else(|_| {
                    warn!("[Aggregate] tool {} input not valid JSON, wrapping raw", t.id);
                    serde_json::json!({"raw": t.input})
                })
            };
            ToolUse {
                id: t.id,
                name: t.name,
                input,
            }
        })
        .collect();

    Ok(AggregatedResponse {
        text,
        tool_uses,
        input_tokens: tokens_in,
        output_tokens: estimate_tokens_from_chars(output_chars),
    })
}
