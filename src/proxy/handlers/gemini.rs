// Gemini 协议端点: /v1/models/{model}:generateContent 及流式变体
//
// axum 路由按单段捕获 "{model}:{action}"，这里再拆出模型名与动作。

use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::ProxyError;
use crate::proxy::common::errors::error_response;
use crate::proxy::mappers::gemini::{
    non_stream_response, to_chat_input, GeminiStreamBuilder, GenerateContentRequest,
};
use crate::proxy::mappers::{estimate_input_tokens, Protocol};
use crate::proxy::orchestrator::{aggregate_response, dispatch, stream_response, FlowTracker};
use crate::proxy::server::AppState;

pub async fn generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    Json(request): Json<GenerateContentRequest>,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return error_response(
            Protocol::Gemini,
            &ProxyError::ProtocolTranslation(format!("malformed path segment: {model_action}")),
        );
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return error_response(
                Protocol::Gemini,
                &ProxyError::ProtocolTranslation(format!("unsupported action: {other}")),
            )
        }
    };

    let input = match to_chat_input(&request, model, stream) {
        Ok(input) => input,
        Err(e) => return error_response(Protocol::Gemini, &e),
    };
    let tokens_in = estimate_input_tokens(&input);
    let mut flow = FlowTracker::new(Protocol::Gemini, &input, tokens_in);

    let outcome = match dispatch(&state.pool, &state.refresher, &state.upstream, &input).await {
        Ok(outcome) => outcome,
        Err(e) => {
            flow.record_failure(state.flow_sink.as_ref(), &e);
            return error_response(Protocol::Gemini, &e);
        }
    };
    flow.set_account(&outcome.account.id);

    if stream {
        let builder = GeminiStreamBuilder::new();
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
                Json(non_stream_response(&agg)).into_response()
            }
            Err(e) => {
                flow.record_failure(state.flow_sink.as_ref(), &e);
                error_response(Protocol::Gemini, &e)
            }
        }
    }
}
