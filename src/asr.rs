//! Speech recognition seam.
//!
//! The worker only sees the `Transcriber` trait. The default engine shells
//! out to a whisper.cpp `whisper-cli` binary and parses its JSON output; it
//! is constructed lazily and rebuilt under exclusive access whenever the
//! runtime profile changes the model, device, or compute type, so a
//! preference edit takes effect on the next window without restarting.

use crate::config::Settings;
use crate::error::{Result, SiktError};
use crate::runtime::Runtime;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One recognized segment, times relative to the start of the WAV.
#[derive(Debug, Clone)]
pub struct AsrSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub language: Option<String>,
}

/// Trait for speech recognition backends.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a 16 kHz mono WAV file into timed segments.
    async fn transcribe_wav(&self, wav_path: &Path) -> Result<Vec<AsrSegment>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LoadedConfig {
    model: String,
    device: String,
    compute_type: String,
}

/// whisper.cpp CLI backend.
struct WhisperCliTranscriber {
    model_path: PathBuf,
    language: String,
    use_gpu: bool,
}

impl WhisperCliTranscriber {
    fn new(settings: &Settings, config: &LoadedConfig) -> Self {
        Self {
            model_path: settings
                .data_dir
                .join("models")
                .join(format!("ggml-{}.bin", config.model)),
            language: settings.asr_language.clone(),
            use_gpu: config.device != "cpu",
        }
    }
}

#[async_trait]
impl Transcriber for WhisperCliTranscriber {
    async fn transcribe_wav(&self, wav_path: &Path) -> Result<Vec<AsrSegment>> {
        let out_dir = tempfile::tempdir()?;
        let out_prefix = out_dir.path().join("asr");

        let mut cmd = Command::new("whisper-cli");
        cmd.arg("-m")
            .arg(&self.model_path)
            .arg("-l")
            .arg(&self.language)
            .arg("-oj")
            .arg("-of")
            .arg(&out_prefix);
        if !self.use_gpu {
            cmd.arg("-ng");
        }
        cmd.arg(wav_path);

        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SiktError::ToolNotFound("whisper-cli".into()),
                _ => SiktError::Transcription(format!("whisper-cli execution failed: {e}")),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail: String = stderr.chars().take(2000).collect();
            return Err(SiktError::Transcription(format!("whisper-cli failed: {detail}")));
        }

        let json_path = out_prefix.with_extension("json");
        let raw = std::fs::read_to_string(&json_path)
            .map_err(|e| SiktError::Transcription(format!("missing ASR output: {e}")))?;
        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|e| SiktError::Transcription(format!("bad ASR output: {e}")))?;

        let language = parsed["result"]["language"].as_str().map(str::to_string);
        let mut segments = Vec::new();
        if let Some(items) = parsed["transcription"].as_array() {
            for item in items {
                let from_ms = item["offsets"]["from"].as_f64().unwrap_or(0.0);
                let to_ms = item["offsets"]["to"].as_f64().unwrap_or(0.0);
                let text = item["text"].as_str().unwrap_or("").trim().to_string();
                if text.is_empty() {
                    continue;
                }
                segments.push(AsrSegment {
                    start: from_ms / 1000.0,
                    end: to_ms / 1000.0,
                    text,
                    language: language.clone(),
                });
            }
        }

        debug!("Recognized {} segments", segments.len());
        Ok(segments)
    }
}

/// Lazily-built process-wide recognizer, rebuilt when the runtime profile
/// changes model/device/compute.
pub struct AsrEngine {
    settings: Settings,
    runtime: Arc<Runtime>,
    loaded: Mutex<Option<(LoadedConfig, Arc<dyn Transcriber>)>>,
}

impl AsrEngine {
    pub fn new(settings: Settings, runtime: Arc<Runtime>) -> Self {
        Self {
            settings,
            runtime,
            loaded: Mutex::new(None),
        }
    }

    async fn current(&self) -> Arc<dyn Transcriber> {
        let effective = self.runtime.effective();
        let wanted = LoadedConfig {
            model: effective.asr_model,
            device: effective.asr_device,
            compute_type: effective.asr_compute_type,
        };

        let mut loaded = self.loaded.lock().await;
        match loaded.as_ref() {
            Some((config, transcriber)) if *config == wanted => transcriber.clone(),
            _ => {
                info!(
                    "Loading ASR engine model={} device={} compute={}",
                    wanted.model, wanted.device, wanted.compute_type
                );
                let transcriber: Arc<dyn Transcriber> =
                    Arc::new(WhisperCliTranscriber::new(&self.settings, &wanted));
                *loaded = Some((wanted, transcriber.clone()));
                transcriber
            }
        }
    }
}

#[async_trait]
impl Transcriber for AsrEngine {
    async fn transcribe_wav(&self, wav_path: &Path) -> Result<Vec<AsrSegment>> {
        let transcriber = self.current().await;
        transcriber.transcribe_wav(wav_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimePreferences;

    #[tokio::test]
    async fn test_engine_reloads_on_device_change() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_data_dir(dir.path());
        let runtime = Arc::new(Runtime::new("small"));
        let engine = AsrEngine::new(settings, runtime.clone());

        engine.current().await;
        let first = engine.loaded.lock().await.as_ref().unwrap().0.clone();
        assert_eq!(first.device, "cpu");

        runtime.apply_preferences(&RuntimePreferences {
            profile: Some("gpu".into()),
            ..Default::default()
        });
        engine.current().await;
        let second = engine.loaded.lock().await.as_ref().unwrap().0.clone();
        assert_eq!(second.device, "cuda");
        assert_eq!(second.compute_type, "float16");
    }
}
