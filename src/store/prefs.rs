//! Singleton preference rows.

use super::{Store, NOW};
use crate::error::Result;
use crate::runtime::RuntimePreferences;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

impl Store {
    /// Stored LLM defaults; `{}` on parse failure so callers always get an
    /// object.
    pub fn get_default_llm_preferences(&self) -> Result<Value> {
        let raw: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT prefs_json FROM llm_preferences WHERE id=1",
                    [],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        Ok(raw
            .and_then(|s| serde_json::from_str::<Value>(&s).ok())
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Default::default())))
    }

    pub fn set_default_llm_preferences(&self, prefs: &Value) -> Result<Value> {
        let prefs_json = serde_json::to_string(prefs)?;
        self.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE llm_preferences SET prefs_json=?1, updated_at={NOW} WHERE id=1"),
                params![prefs_json],
            )?;
            Ok(())
        })?;
        self.get_default_llm_preferences()
    }

    pub fn get_default_runtime_preferences(&self) -> Result<RuntimePreferences> {
        let raw: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT prefs_json FROM runtime_preferences WHERE id=1",
                    [],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        Ok(raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default())
    }

    pub fn set_default_runtime_preferences(
        &self,
        prefs: &RuntimePreferences,
    ) -> Result<RuntimePreferences> {
        let prefs_json = serde_json::to_string(prefs)?;
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "UPDATE runtime_preferences SET prefs_json=?1, updated_at={NOW} WHERE id=1"
                ),
                params![prefs_json],
            )?;
            Ok(())
        })?;
        self.get_default_runtime_preferences()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_llm_preferences_roundtrip() {
        let store = Store::in_memory().unwrap();
        let stored = store
            .set_default_llm_preferences(&json!({
                "provider": "openai_local",
                "model": "llama",
                "temperature": 0.1,
                "max_tokens": 256
            }))
            .unwrap();
        assert_eq!(stored["provider"], "openai_local");
        assert_eq!(store.get_default_llm_preferences().unwrap()["model"], "llama");
    }

    #[test]
    fn test_runtime_preferences_roundtrip() {
        let store = Store::in_memory().unwrap();
        let mut prefs = store.get_default_runtime_preferences().unwrap();
        prefs.profile = Some("gpu".into());
        prefs.llm_concurrency = Some(2);
        let stored = store.set_default_runtime_preferences(&prefs).unwrap();
        assert_eq!(stored.profile.as_deref(), Some("gpu"));
        assert_eq!(stored.llm_concurrency, Some(2));
    }
}
