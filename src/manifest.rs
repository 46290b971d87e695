//! Model manifest under the data directory.

use crate::config::Settings;
use crate::error::Result;
use serde_json::{json, Value};

/// Default manifest contents.
pub fn default_manifest() -> Value {
    json!({
        "version": 1,
        "llm_local_models": [],
        "asr_models": ["small", "large-v3"],
    })
}

/// Load `models/manifest.json`, falling back to the defaults on any failure.
pub fn load_manifest(settings: &Settings) -> Value {
    let path = settings.models_manifest_path();
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .filter(Value::is_object)
        .unwrap_or_else(default_manifest)
}

/// Persist and re-read the manifest.
pub fn save_manifest(settings: &Settings, manifest: &Value) -> Result<Value> {
    let path = settings.models_manifest_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(manifest)?)?;
    Ok(load_manifest(settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_manifest_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_data_dir(dir.path());
        let manifest = load_manifest(&settings);
        assert_eq!(manifest["version"], 1);
        assert_eq!(manifest["asr_models"][0], "small");
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_data_dir(dir.path());
        let saved = save_manifest(
            &settings,
            &json!({"version": 2, "asr_models": ["large-v3"], "llm_local_models": ["llama"]}),
        )
        .unwrap();
        assert_eq!(saved["version"], 2);
        assert_eq!(load_manifest(&settings)["llm_local_models"][0], "llama");
    }
}
