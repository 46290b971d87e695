//! Single-shot remote summarization via a DashScope-compatible endpoint.

use crate::config::Settings;
use crate::error::{Result, SiktError};
use serde_json::{json, Value};
use tracing::instrument;

const DASHSCOPE_URL: &str =
    "https://dashscope.aliyuncs.com/api/v1/services/aigc/text-generation/generation";

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Summarize free text in the cloud. Gate order: feature flag, API key,
/// minimum text length.
#[instrument(skip_all)]
pub async fn summarize(settings: &Settings, text: &str, api_key: &str) -> Result<String> {
    if !settings.enable_cloud_summary {
        return Err(SiktError::Llm("CLOUD_SUMMARY_DISABLED".into()));
    }

    let effective_key = if api_key.trim().is_empty() {
        settings.dashscope_api_key.as_str()
    } else {
        api_key.trim()
    };
    if effective_key.is_empty() {
        return Err(SiktError::Llm("MISSING_DASHSCOPE_API_KEY".into()));
    }

    if text.trim().chars().count() < 10 {
        return Err(SiktError::Llm("TEXT_TOO_SHORT".into()));
    }

    let prompt = format!(
        "你是一个专业的视频内容整理助手。请根据以下视频转写文本，\
         生成一份简洁的中文摘要。主要包含核心观点和重要细节。\n\n\
         文本内容：\n{}",
        truncate_chars(text, 15000)
    );

    let payload = json!({
        "model": settings.cloud_llm_model,
        "input": {
            "messages": [{"role": "user", "content": prompt}],
        },
        "parameters": {"result_format": "message"},
    });

    let client = reqwest::Client::new();
    let response = client
        .post(DASHSCOPE_URL)
        .bearer_auth(effective_key)
        .json(&payload)
        .send()
        .await
        .map_err(|e| SiktError::Llm(format!("LLM_REQUEST_FAILED:request:{e}")))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| SiktError::Llm(format!("LLM_REQUEST_FAILED:decode:{e}")))?;

    if !status.is_success() {
        let code = body["code"].as_str().unwrap_or("UNKNOWN");
        let message = body["message"].as_str().unwrap_or("");
        return Err(SiktError::Llm(format!("ERROR: {code} - {message}")));
    }

    Ok(body["output"]["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(enabled: bool, key: &str) -> Settings {
        let mut settings = Settings::with_data_dir("/tmp/sikt-cloud-test");
        settings.enable_cloud_summary = enabled;
        settings.dashscope_api_key = key.to_string();
        settings
    }

    #[tokio::test]
    async fn test_disabled_wins_over_everything() {
        let err = summarize(&settings(false, "key"), "long enough text here", "")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "CLOUD_SUMMARY_DISABLED");
    }

    #[tokio::test]
    async fn test_missing_key_then_short_text() {
        let err = summarize(&settings(true, ""), "long enough text here", "")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "MISSING_DASHSCOPE_API_KEY");

        let err = summarize(&settings(true, "key"), "short", "")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "TEXT_TOO_SHORT");
    }
}
