// 模型名称映射 (client → Kiro upstream)

use serde::Serialize;

/// Model metadata for the /v1/models listing.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
}

/// Exact client-name → upstream-name table.
const MODEL_MAPPING: &[(&str, &str)] = &[
    ("gpt-4o", "claude-sonnet-4"),
    ("gpt-4", "claude-sonnet-4"),
    ("gpt-4o-mini", "claude-haiku-4.5"),
    ("gpt-3.5-turbo", "claude-haiku-4.5"),
    ("o1", "claude-opus-4.5"),
    ("o1-preview", "claude-opus-4.5"),
    ("claude-haiku-4.5", "claude-haiku-4.5"),
    ("claude-opus-4.5", "claude-opus-4.5"),
    ("claude-sonnet-4.5", "claude-sonnet-4.5"),
];

/// Upstream-native model ids, passed through untouched.
const KIRO_MODELS: &[&str] = &[
    "auto",
    "claude-sonnet-4",
    "claude-sonnet-4.5",
    "claude-haiku-4.5",
    "claude-opus-4.5",
];

const DEFAULT_MODEL: &str = "claude-sonnet-4";

/// 将任意客户端模型名映射为上游支持的名称
pub fn map_model_name(model: &str) -> String {
    if model.is_empty() {
        return DEFAULT_MODEL.to_string();
    }
    if let Some((_, upstream)) = MODEL_MAPPING.iter().find(|(client, _)| *client == model) {
        return upstream.to_string();
    }
    if KIRO_MODELS.contains(&model) {
        return model.to_string();
    }
    // claude-sonnet-4* 家族（带日期后缀等）归并到 claude-sonnet-4
    if model.starts_with("claude-sonnet-4.5") {
        return "claude-sonnet-4.5".to_string();
    }
    if model.starts_with("claude-sonnet-4") {
        return "claude-sonnet-4".to_string();
    }
    let lower = model.to_lowercase();
    if lower.contains("opus") {
        return "claude-opus-4.5".to_string();
    }
    if lower.contains("haiku") {
        return "claude-haiku-4.5".to_string();
    }
    DEFAULT_MODEL.to_string()
}

/// /v1/models 静态列表（上游列举失败时的回退）
pub fn static_model_list() -> Vec<ModelInfo> {
    [
        ("auto", "Auto"),
        ("claude-sonnet-4.5", "Claude Sonnet 4.5"),
        ("claude-sonnet-4", "Claude Sonnet 4"),
        ("claude-haiku-4.5", "Claude Haiku 4.5"),
        ("claude-opus-4.5", "Claude Opus 4.5"),
    ]
    .iter()
    .map(|(id, name)| ModelInfo {
        id: id.to_string(),
        name: name.to_string(),
    })
    .collect()
}
