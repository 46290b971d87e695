//! Health, preferences, providers, runtime profile, models, cloud summary.

use super::{ApiError, ApiResult};
use crate::app::AppContext;
use crate::cloud_summary;
use crate::error::SiktError;
use crate::manifest;
use crate::runtime::RuntimePreferences;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub(super) async fn health(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(json!({
        "status": "ok",
        "data_dir": ctx.settings.data_dir.to_string_lossy(),
        "cloud_summary_default": ctx.settings.enable_cloud_summary,
        "concurrency": ctx.runtime.diagnostics(),
    }))
    .into_response()
}

pub(super) async fn get_models(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(manifest::load_manifest(&ctx.settings)).into_response()
}

pub(super) async fn get_llm_preferences(State(ctx): State<Arc<AppContext>>) -> ApiResult<Response> {
    let preferences = ctx.store.get_default_llm_preferences()?;
    Ok(Json(json!({ "preferences": preferences })).into_response())
}

#[derive(Deserialize)]
pub(super) struct LlmPreferencesRequest {
    #[serde(default = "default_provider")]
    provider: String,
    model: Option<String>,
    #[serde(default = "default_temperature")]
    temperature: f64,
    #[serde(default = "default_max_tokens")]
    max_tokens: i64,
    output_language: Option<String>,
}

fn default_provider() -> String {
    "fake".to_string()
}

fn default_temperature() -> f64 {
    0.2
}

fn default_max_tokens() -> i64 {
    512
}

pub(super) async fn put_llm_preferences(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<LlmPreferencesRequest>,
) -> ApiResult<Response> {
    let mut prefs = serde_json::Map::new();
    prefs.insert("provider".into(), json!(req.provider.trim()));
    prefs.insert("model".into(), json!(req.model));
    prefs.insert("temperature".into(), json!(req.temperature));
    prefs.insert("max_tokens".into(), json!(req.max_tokens));
    if let Some(lang) = req.output_language {
        prefs.insert("output_language".into(), json!(lang));
    }

    let stored = ctx
        .store
        .set_default_llm_preferences(&Value::Object(prefs))?;
    Ok(Json(json!({ "preferences": stored })).into_response())
}

pub(super) async fn list_llm_providers(State(ctx): State<Arc<AppContext>>) -> Response {
    let mut providers = vec!["none".to_string()];
    providers.extend(ctx.llm.list());
    Json(json!({ "providers": providers })).into_response()
}

/// Probe the local OpenAI-compatible endpoint for its model list.
pub(super) async fn llm_local_status(State(ctx): State<Arc<AppContext>>) -> Response {
    let base_url = ctx.settings.llm_local_base_url.trim_end_matches('/');
    let mut out = json!({
        "provider": "openai_local",
        "base_url": base_url,
        "default_model": ctx.settings.llm_local_model,
    });

    let probe = async {
        let client = reqwest::Client::new();
        let response = client
            .get(format!("{base_url}/models"))
            .timeout(Duration::from_millis(2500))
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Ok::<_, reqwest::Error>((status, text))
    };

    match probe.await {
        Ok((status, text)) if status.is_success() => {
            let body: Value = serde_json::from_str(&text).unwrap_or_default();
            let models: Vec<String> = body["data"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.get("id"))
                        .map(|id| match id {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            out["ok"] = json!(true);
            out["models"] = json!(models);
        }
        Ok((status, text)) => {
            let detail: String = text.chars().take(500).collect();
            out["ok"] = json!(false);
            out["error"] = json!(format!("HTTP_{}:{}", status.as_u16(), detail));
        }
        Err(e) if e.is_timeout() => {
            out["ok"] = json!(false);
            out["error"] = json!("TIMEOUT");
        }
        Err(e) => {
            out["ok"] = json!(false);
            out["error"] = json!(format!("ERROR:{e}"));
        }
    }

    Json(out).into_response()
}

pub(super) async fn get_runtime_profile(
    State(ctx): State<Arc<AppContext>>,
) -> ApiResult<Response> {
    let preferences = ctx.store.get_default_runtime_preferences()?;
    let effective = ctx.runtime.resolve(&preferences);
    Ok(Json(json!({
        "preferences": preferences,
        "effective": effective,
    }))
    .into_response())
}

#[derive(Deserialize)]
pub(super) struct RuntimeProfileRequest {
    profile: Option<String>,
    asr_concurrency: Option<i64>,
    llm_concurrency: Option<i64>,
    heavy_concurrency: Option<i64>,
    llm_timeout_seconds: Option<i64>,
    asr_device: Option<String>,
    asr_compute_type: Option<String>,
    asr_model: Option<String>,
}

pub(super) async fn put_runtime_profile(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<RuntimeProfileRequest>,
) -> ApiResult<Response> {
    let mut prefs = ctx.store.get_default_runtime_preferences()?;
    if let Some(profile) = req.profile {
        prefs.profile = Some(profile.trim().to_lowercase());
    }
    if req.asr_concurrency.is_some() {
        prefs.asr_concurrency = req.asr_concurrency;
    }
    if req.llm_concurrency.is_some() {
        prefs.llm_concurrency = req.llm_concurrency;
    }
    if req.heavy_concurrency.is_some() {
        prefs.heavy_concurrency = req.heavy_concurrency;
    }
    if req.llm_timeout_seconds.is_some() {
        prefs.llm_timeout_seconds = req.llm_timeout_seconds;
    }
    if let Some(device) = req.asr_device {
        prefs.asr_device = Some(device.trim().to_string());
    }
    if let Some(compute) = req.asr_compute_type {
        prefs.asr_compute_type = Some(compute.trim().to_string());
    }
    if let Some(model) = req.asr_model {
        prefs.asr_model = Some(model.trim().to_string());
    }

    let stored: RuntimePreferences = ctx.store.set_default_runtime_preferences(&prefs)?;
    let effective = ctx.runtime.apply_preferences(&stored);
    Ok(Json(json!({
        "preferences": stored,
        "effective": effective,
    }))
    .into_response())
}

#[derive(Deserialize)]
pub(super) struct CloudSummaryRequest {
    text: String,
    api_key: Option<String>,
    #[serde(default)]
    confirm_send: bool,
}

pub(super) async fn cloud_summary(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<CloudSummaryRequest>,
) -> ApiResult<Response> {
    if !req.confirm_send {
        return Err(ApiError::bad_request("CONFIRM_SEND_REQUIRED"));
    }

    let summary = cloud_summary::summarize(
        &ctx.settings,
        &req.text,
        req.api_key.as_deref().unwrap_or(""),
    )
    .await
    .map_err(|e| match &e {
        SiktError::Llm(detail)
            if matches!(
                detail.as_str(),
                "CLOUD_SUMMARY_DISABLED" | "MISSING_DASHSCOPE_API_KEY" | "TEXT_TOO_SHORT"
            ) =>
        {
            ApiError::bad_request(detail.clone())
        }
        _ => ApiError::from(e),
    })?;

    Ok(Json(json!({ "summary": summary })).into_response())
}
