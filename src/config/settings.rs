//! Environment-driven settings for Sikt.
//!
//! All knobs come from environment variables so the backend can be dropped
//! into a desktop shell or a container without a config file. Paths derived
//! from the data directory live here as well, so callers never assemble
//! storage paths by hand.

use std::path::PathBuf;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).unwrap_or_default().as_str(),
        "1" | "true" | "True" | "yes" | "YES"
    )
}

/// Runtime configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all persisted state.
    pub data_dir: PathBuf,
    /// Comma-separated CORS origins; empty disables the CORS layer.
    pub cors_origins: Vec<String>,
    /// When set, the job worker is not spawned at startup.
    pub disable_worker: bool,

    pub asr_model: String,
    pub asr_device: String,
    pub asr_compute_type: String,
    pub asr_language: String,

    /// Transcription window length in seconds.
    pub segment_seconds: i64,
    /// Overlap rewound at the start of a resumed transcription run.
    pub overlap_seconds: i64,

    pub index_target_window_seconds: f64,
    pub index_max_window_seconds: f64,
    pub index_min_window_seconds: f64,
    pub index_overlap_seconds: f64,

    pub embedding_model: String,
    pub embedding_dim: i64,

    pub enable_cloud_summary: bool,
    pub dashscope_api_key: String,
    pub cloud_llm_model: String,

    pub llm_local_base_url: String,
    pub llm_local_model: String,

    pub enable_cloud_llm: bool,
    pub llm_cloud_base_url: String,
    pub llm_cloud_api_key: String,
    pub llm_cloud_model: String,

    pub host: String,
    pub port: u16,
}

impl Settings {
    /// Load settings from the environment.
    pub fn from_env() -> Self {
        let default_data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".edge-video-agent");
        let data_dir = std::env::var("EDGE_VIDEO_AGENT_DATA_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| PathBuf::from(shellexpand::tilde(&v).to_string()))
            .unwrap_or(default_data_dir);

        let cors_origins = std::env::var("EDGE_VIDEO_AGENT_CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            data_dir,
            cors_origins,
            disable_worker: env_flag("EDGE_VIDEO_AGENT_DISABLE_WORKER"),

            asr_model: env_string("ASR_MODEL", "small"),
            asr_device: env_string("ASR_DEVICE", "cpu"),
            asr_compute_type: env_string("ASR_COMPUTE_TYPE", "int8"),
            asr_language: env_string("ASR_LANGUAGE", "zh"),

            segment_seconds: env_parse("ASR_SEGMENT_SECONDS", 60),
            overlap_seconds: env_parse("ASR_OVERLAP_SECONDS", 3),

            index_target_window_seconds: env_parse("INDEX_TARGET_WINDOW_SECONDS", 45.0),
            index_max_window_seconds: env_parse("INDEX_MAX_WINDOW_SECONDS", 60.0),
            index_min_window_seconds: env_parse("INDEX_MIN_WINDOW_SECONDS", 20.0),
            index_overlap_seconds: env_parse("INDEX_OVERLAP_SECONDS", 5.0),

            embedding_model: env_string("EMBEDDING_MODEL", "hash"),
            embedding_dim: env_parse("EMBEDDING_DIM", 384),

            enable_cloud_summary: env_flag("ENABLE_CLOUD_SUMMARY"),
            dashscope_api_key: env_string("DASHSCOPE_API_KEY", ""),
            cloud_llm_model: env_string("CLOUD_LLM_MODEL", "qwen-plus"),

            llm_local_base_url: env_string("LLM_LOCAL_BASE_URL", "http://127.0.0.1:8080/v1"),
            llm_local_model: env_string("LLM_LOCAL_MODEL", "llama"),

            enable_cloud_llm: env_flag("ENABLE_CLOUD_LLM"),
            llm_cloud_base_url: env_string("LLM_CLOUD_BASE_URL", "https://api.openai.com/v1"),
            llm_cloud_api_key: env_string("LLM_CLOUD_API_KEY", ""),
            llm_cloud_model: env_string("LLM_CLOUD_MODEL", "gpt-4o-mini"),

            host: env_string("EDGE_VIDEO_AGENT_HOST", "127.0.0.1"),
            port: env_parse("BACKEND_PORT", 8000),
        }
    }

    /// Create settings rooted at an explicit data directory (used by tests).
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut settings = Self::from_env();
        settings.data_dir = data_dir.into();
        settings
    }

    /// Create all storage directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for rel in [
            "data",
            "data/vectors",
            "storage/audio",
            "storage/transcripts",
            "storage/keyframes",
            "logs",
        ] {
            std::fs::create_dir_all(self.data_dir.join(rel))?;
        }
        Ok(())
    }

    /// Path of the durable SQLite database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("data").join("database.db")
    }

    /// Path of the vector store database.
    pub fn vector_db_path(&self) -> PathBuf {
        self.data_dir.join("data").join("vectors").join("vectors.db")
    }

    /// Path of a video's append-only transcript log.
    pub fn transcript_path(&self, video_id: &str) -> PathBuf {
        self.data_dir
            .join("storage")
            .join("transcripts")
            .join(format!("{video_id}.jsonl"))
    }

    /// Directory holding a video's extracted keyframes.
    pub fn keyframes_dir(&self, video_id: &str) -> PathBuf {
        self.data_dir.join("storage").join("keyframes").join(video_id)
    }

    /// Data-dir-relative path of one keyframe image.
    pub fn keyframe_relpath(&self, video_id: &str, keyframe_id: &str) -> String {
        format!("storage/keyframes/{video_id}/{keyframe_id}.jpg")
    }

    /// Absolute path of one keyframe image.
    pub fn keyframe_abspath(&self, video_id: &str, keyframe_id: &str) -> PathBuf {
        self.keyframes_dir(video_id).join(format!("{keyframe_id}.jpg"))
    }

    /// Path of the model manifest file.
    pub fn models_manifest_path(&self) -> PathBuf {
        self.data_dir.join("models").join("manifest.json")
    }
}
