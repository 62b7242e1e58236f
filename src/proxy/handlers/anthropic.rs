// Anthropic 协议端点: /v1/messages, /v1/messages/count_tokens

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::proxy::common::errors::error_response;
use crate::proxy::mappers::anthropic::{
    non_stream_response, to_chat_input, AnthropicSseBuilder, ClaudeRequest,
};
use crate::proxy::mappers::{estimate_input_tokens, Protocol};
use crate::proxy::orchestrator::{aggregate_response, dispatch, stream_response, FlowTracker};
use crate::proxy::server::AppState;

fn new_message_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}", &hex[..24])
}

pub async fn messages(
    State(state): State<AppState>,
    Json(request): Json<ClaudeRequest>,
) -> Response {
    let input = match to_chat_input(&request) {
        Ok(input) => input,
        Err(e) => return error_response(Protocol::Anthropic, &e),
    };
    let tokens_in = estimate_input_tokens(&input);
    let mut flow = FlowTracker::new(Protocol::Anthropic, &input, tokens_in);

    let outcome = match dispatch(&state.pool, &state.refresher, &state.upstream, &input).await {
        Ok(outcome) => outcome,
        Err(e) => {
            flow.record_failure(state.flow_sink.as_ref(), &e);
            return error_response(Protocol::Anthropic, &e);
        }
    };
    flow.set_account(&outcome.account.id);
    let message_id = new_message_id();

    if input.stream {
        let builder = AnthropicSseBuilder::new(&input.client_model, &message_id, tokens_in);
        let body = stream_response(
            outcome.response,
            builder,
            state.config.idle_timeout,
            flow,
            state.flow_sink.clone(),
        );
        (
            [(header::CONTENT_TYPE, "text/event-stream"), (header::CACHE_CONTROL, "no-cache")],
            body,
        )
            .into_response()
    } else {
        match aggregate_response(outcome.response, state.config.idle_timeout, tokens_in).await {
            Ok(agg) => {
                flow.record_success(state.flow_sink.as_ref(), agg.output_tokens);
                Json(non_stream_response(&agg, &input.client_model, &message_id)).into_response()
            }
            Err(e) => {
                flow.record_failure(state.flow_sink.as_ref(), &e);
                error_response(Protocol::Anthropic, &e)
            }
        }
    }
}

pub async fn count_tokens(Json(request): Json<ClaudeRequest>) -> Response {
    match to_chat_input(&request) {
        Ok(input) => {
            let tokens = estimate_input_tokens(&input);
            Json(json!({"input_tokens": tokens})).into_response()
        }
        Err(e) => error_response(Protocol::Anthropic, &e),
    }
}
