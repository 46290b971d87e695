//! Application wiring shared by the HTTP surface, the worker, and tests.

use crate::asr::{AsrEngine, Transcriber};
use crate::config::Settings;
use crate::error::Result;
use crate::llm::LlmRegistry;
use crate::runtime::{EffectivePreferences, Runtime};
use crate::store::Store;
use crate::transcript_store::TranscriptStore;
use crate::vector_store::VectorDb;
use std::sync::Arc;

/// Everything a request handler or pipeline needs, constructed once.
pub struct AppContext {
    pub settings: Settings,
    pub store: Store,
    pub transcripts: TranscriptStore,
    pub vectors: VectorDb,
    pub runtime: Arc<Runtime>,
    pub llm: LlmRegistry,
    pub asr: Arc<dyn Transcriber>,
}

impl AppContext {
    pub fn new(settings: Settings) -> Result<Arc<Self>> {
        let runtime = Arc::new(Runtime::new(&settings.asr_model));
        let asr: Arc<dyn Transcriber> =
            Arc::new(AsrEngine::new(settings.clone(), runtime.clone()));
        Self::build(settings, runtime, asr)
    }

    /// Wire with an injected transcriber (tests).
    pub fn with_transcriber(settings: Settings, asr: Arc<dyn Transcriber>) -> Result<Arc<Self>> {
        let runtime = Arc::new(Runtime::new(&settings.asr_model));
        Self::build(settings, runtime, asr)
    }

    fn build(
        settings: Settings,
        runtime: Arc<Runtime>,
        asr: Arc<dyn Transcriber>,
    ) -> Result<Arc<Self>> {
        settings.ensure_dirs()?;
        let store = Store::open(&settings.db_path())?;
        let llm = LlmRegistry::new(&settings, runtime.clone());
        let vectors = VectorDb::new(settings.vector_db_path());
        let transcripts = TranscriptStore::new(settings.clone());

        Ok(Arc::new(Self {
            settings,
            store,
            transcripts,
            vectors,
            runtime,
            llm,
            asr,
        }))
    }

    /// Re-read stored runtime preferences and apply them to the limiters.
    pub fn refresh_runtime_preferences(&self) -> Result<EffectivePreferences> {
        let prefs = self.store.get_default_runtime_preferences()?;
        Ok(self.runtime.apply_preferences(&prefs))
    }

    /// Remove every `*.jpg` in a video's keyframe directory; other files in
    /// there are left alone.
    pub fn remove_keyframe_jpgs(&self, video_id: &str) {
        let dir = self.settings.keyframes_dir(video_id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if !name.ends_with(".jpg") {
                continue;
            }
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!("Failed to remove keyframe {:?}: {e}", entry.path());
            }
        }
    }
}
