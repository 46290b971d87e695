//! LLM provider abstraction.
//!
//! A provider is a message-array-in, string-or-stream-out capability set.
//! The fake echo provider keeps every offline path (tests, retrieval-only
//! chat) deterministic; the OpenAI-compatible provider speaks to any local or
//! cloud `/chat/completions` endpoint. The cloud instance additionally
//! requires an explicit per-request confirmation before anything leaves the
//! machine.

use crate::config::Settings;
use crate::error::{Result, SiktError};
use crate::runtime::Runtime;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// One chat message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Per-call generation preferences.
#[derive(Debug, Clone)]
pub struct LlmPreferences {
    pub provider: String,
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: i64,
}

impl LlmPreferences {
    /// Build from the stored preferences JSON, filling defaults.
    pub fn from_stored(stored: &Value) -> Self {
        let provider = stored
            .get("provider")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("fake")
            .to_string();
        let model = stored
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Self {
            provider,
            model,
            temperature: stored
                .get("temperature")
                .and_then(Value::as_f64)
                .unwrap_or(0.2),
            max_tokens: stored
                .get("max_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(512),
        }
    }

    pub fn with_min_max_tokens(mut self, floor: i64) -> Self {
        self.max_tokens = self.max_tokens.max(floor);
        self
    }
}

/// Capability set every provider implements.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether calls must carry an explicit `confirm_send`.
    fn requires_confirm_send(&self) -> bool;

    async fn generate(
        &self,
        messages: &[ChatMessage],
        prefs: &LlmPreferences,
        confirm_send: bool,
    ) -> Result<String>;

    async fn stream_generate(
        &self,
        messages: &[ChatMessage],
        prefs: &LlmPreferences,
        confirm_send: bool,
    ) -> Result<BoxStream<'static, Result<String>>>;
}

fn text_parts(text: &str, part_size: usize) -> Vec<String> {
    text.chars()
        .collect::<Vec<_>>()
        .chunks(part_size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// Echo provider for offline use.
pub struct FakeProvider;

#[async_trait]
impl LlmProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn requires_confirm_send(&self) -> bool {
        false
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        prefs: &LlmPreferences,
        _confirm_send: bool,
    ) -> Result<String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let model = prefs.model.as_deref().unwrap_or("default");
        Ok(format!("[FAKE:{model}] {last_user}").trim().to_string())
    }

    async fn stream_generate(
        &self,
        messages: &[ChatMessage],
        prefs: &LlmPreferences,
        confirm_send: bool,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let text = self.generate(messages, prefs, confirm_send).await?;
        Ok(futures::stream::iter(text_parts(&text, 16).into_iter().map(Ok)).boxed())
    }
}

/// Provider speaking the OpenAI `/chat/completions` contract.
pub struct OpenAiCompatibleProvider {
    name: String,
    base_url: String,
    default_model: String,
    api_key: String,
    requires_confirm_send: bool,
    require_enabled: bool,
    enabled: bool,
    client: reqwest::Client,
    runtime: Arc<Runtime>,
}

impl OpenAiCompatibleProvider {
    #[allow(clippy::too_many_arguments)]
    fn new(
        name: &str,
        base_url: &str,
        default_model: &str,
        api_key: &str,
        requires_confirm_send: bool,
        require_enabled: bool,
        enabled: bool,
        runtime: Arc<Runtime>,
    ) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: default_model.to_string(),
            api_key: api_key.to_string(),
            requires_confirm_send,
            require_enabled,
            enabled,
            client: reqwest::Client::new(),
            runtime,
        }
    }

    fn assert_allowed(&self) -> Result<()> {
        if self.require_enabled && !self.enabled {
            return Err(SiktError::Llm("CLOUD_LLM_DISABLED".into()));
        }
        if self.require_enabled && self.api_key.is_empty() {
            return Err(SiktError::Llm("CLOUD_LLM_API_KEY_MISSING".into()));
        }
        Ok(())
    }

    fn assert_confirmed(&self, confirm_send: bool) -> Result<()> {
        if self.requires_confirm_send && !confirm_send {
            return Err(SiktError::Llm("CONFIRM_SEND_REQUIRED".into()));
        }
        Ok(())
    }

    fn payload(&self, messages: &[ChatMessage], prefs: &LlmPreferences, stream: bool) -> Value {
        let model = prefs
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": prefs.temperature,
            "max_tokens": prefs.max_tokens,
            "stream": stream,
        })
    }

    async fn post(
        &self,
        messages: &[ChatMessage],
        prefs: &LlmPreferences,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .timeout(self.runtime.llm_request_timeout())
            .json(&self.payload(messages, prefs, stream));
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SiktError::Llm("LLM_TIMEOUT".into())
            } else {
                SiktError::Llm(format!("LLM_REQUEST_FAILED:request:{e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SiktError::Llm(format!("LLM_HTTP_{}:{}", status.as_u16(), body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_confirm_send(&self) -> bool {
        self.requires_confirm_send
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        prefs: &LlmPreferences,
        confirm_send: bool,
    ) -> Result<String> {
        self.assert_allowed()?;
        self.assert_confirmed(confirm_send)?;

        let response = self.post(messages, prefs, false).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| SiktError::Llm(format!("LLM_REQUEST_FAILED:decode:{e}")))?;

        Ok(body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn stream_generate(
        &self,
        messages: &[ChatMessage],
        prefs: &LlmPreferences,
        confirm_send: bool,
    ) -> Result<BoxStream<'static, Result<String>>> {
        self.assert_allowed()?;
        self.assert_confirmed(confirm_send)?;

        let response = self.post(messages, prefs, true).await?;
        debug!("Streaming completion from {}", self.name);

        let bytes = response.bytes_stream();
        let stream = futures::stream::unfold(
            (bytes, String::new(), false),
            |(mut bytes, mut buf, done)| async move {
                if done {
                    return None;
                }
                loop {
                    // Drain complete SSE lines already buffered.
                    while let Some(pos) = buf.find('\n') {
                        let line = buf[..pos].trim().to_string();
                        buf.drain(..=pos);
                        let Some(data) = line.strip_prefix("data:") else {
                            continue;
                        };
                        let data = data.trim();
                        if data == "[DONE]" {
                            return None;
                        }
                        let Ok(obj) = serde_json::from_str::<Value>(data) else {
                            continue;
                        };
                        if let Some(part) = obj["choices"][0]["delta"]["content"].as_str() {
                            return Some((Ok(part.to_string()), (bytes, buf, false)));
                        }
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => buf.push_str(&String::from_utf8_lossy(&chunk)),
                        Some(Err(e)) => {
                            return Some((
                                Err(SiktError::Llm(format!("LLM_REQUEST_FAILED:stream:{e}"))),
                                (bytes, buf, true),
                            ))
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

/// Process-wide provider registry.
pub struct LlmRegistry {
    providers: Vec<Arc<dyn LlmProvider>>,
}

impl LlmRegistry {
    pub fn new(settings: &Settings, runtime: Arc<Runtime>) -> Self {
        let providers: Vec<Arc<dyn LlmProvider>> = vec![
            Arc::new(FakeProvider),
            Arc::new(OpenAiCompatibleProvider::new(
                "openai_local",
                &settings.llm_local_base_url,
                &settings.llm_local_model,
                "",
                false,
                false,
                true,
                runtime.clone(),
            )),
            Arc::new(OpenAiCompatibleProvider::new(
                "openai_cloud",
                &settings.llm_cloud_base_url,
                &settings.llm_cloud_model,
                &settings.llm_cloud_api_key,
                true,
                true,
                settings.enable_cloud_llm,
                runtime,
            )),
        ];
        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        let name = name.trim();
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|p| p.name().to_string()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefs(model: Option<&str>) -> LlmPreferences {
        LlmPreferences {
            provider: "fake".into(),
            model: model.map(str::to_string),
            temperature: 0.2,
            max_tokens: 512,
        }
    }

    #[tokio::test]
    async fn test_fake_provider_echoes_last_user_message() {
        let provider = FakeProvider;
        let messages = vec![
            ChatMessage::system("you are a test"),
            ChatMessage::user("first"),
            ChatMessage::user("second"),
        ];
        let out = provider.generate(&messages, &prefs(None), false).await.unwrap();
        assert_eq!(out, "[FAKE:default] second");

        let out = provider
            .generate(&messages, &prefs(Some("m1")), false)
            .await
            .unwrap();
        assert!(out.starts_with("[FAKE:m1]"));
    }

    #[tokio::test]
    async fn test_fake_provider_streams_in_parts() {
        let provider = FakeProvider;
        let messages = vec![ChatMessage::user("a".repeat(40))];
        let stream = provider
            .stream_generate(&messages, &prefs(None), false)
            .await
            .unwrap();
        let parts: Vec<String> = stream.map(|p| p.unwrap()).collect().await;
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.chars().count() <= 16));
        let joined: String = parts.concat();
        assert!(joined.ends_with(&"a".repeat(40)));
    }

    #[test]
    fn test_preferences_from_stored_defaults() {
        let prefs = LlmPreferences::from_stored(&serde_json::json!({}));
        assert_eq!(prefs.provider, "fake");
        assert!(prefs.model.is_none());
        assert_eq!(prefs.max_tokens, 512);

        let prefs = LlmPreferences::from_stored(&serde_json::json!({
            "provider": "openai_local", "model": "llama", "max_tokens": 64
        }));
        assert_eq!(prefs.provider, "openai_local");
        assert_eq!(prefs.with_min_max_tokens(2048).max_tokens, 2048);
    }
}
