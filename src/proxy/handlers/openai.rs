// OpenAI 协议端点: /v1/chat/completions, /v1/models

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::proxy::common::errors::error_response;
use crate::proxy::common::model_mapping::static_model_list;
use crate::proxy::mappers::openai::{
    non_stream_response, to_chat_input, ChatCompletionRequest, OpenAiStreamBuilder,
};
use crate::proxy::mappers::{estimate_input_tokens, Protocol};
use crate::proxy::orchestrator::{aggregate_response, dispatch, stream_response, FlowTracker};
use crate::proxy::server::AppState;

fn new_completion_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{}", &hex[..24])
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let input = match to_chat_input(&request) {
        Ok(input) => input,
        Err(e) => return error_response(Protocol::OpenAi, &e),
    };
    let tokens_in = estimate_input_tokens(&input);
    let mut flow = FlowTracker::new(Protocol::OpenAi, &input, tokens_in);

    let outcome = match dispatch(&state.pool, &state.refresher, &state.upstream, &input).await {
        Ok(outcome) => outcome,
        Err(e) => {
            flow.record_failure(state.flow_sink.as_ref(), &e);
            return error_response(Protocol::OpenAi, &e);
        }
    };
    flow.set_account(&outcome.account.id);
    let completion_id = new_completion_id();
    let created = chrono::Utc::now().timestamp();

    if input.stream {
        let builder = OpenAiStreamBuilder::new(&input.client_model, &completion_id, created);
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
                Json(non_stream_response(&agg, &input.client_model, &completion_id, created))
                    .into_response()
            }
            Err(e) => {
                flow.record_failure(state.flow_sink.as_ref(), &e);
                error_response(Protocol::OpenAi, &e)
            }
        }
    }
}

/// 模型列表：先试上游动态列举，失败回退静态表
pub async fn models(State(state): State<AppState>) -> Response {
    if let Ok(account) = state.pool.select(None).await {
        if let Ok(models) = state
            .upstream
            .list_models(&account.access_token, &account.id)
            .await
        {
            if !models.is_empty() {
                let data: Vec<_> = models
                    .into_iter()
                    .map(|(id, name)| {
                        json!({"id": id, "object": "model", "owned_by": "kiro", "name": name})
                    })
                    .collect();
                return Json(json!({"object": "list", "data": data})).into_response();
            }
        }
    }

    let data: Vec<_> = static_model_list()
        .into_iter()
        .map(|m| json!({"id": m.id, "object": "model", "owned_by": "kiro", "name": m.name}))
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}
