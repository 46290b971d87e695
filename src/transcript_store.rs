//! Append-only transcript segment log.
//!
//! Each video owns one JSONL file under `storage/transcripts/`; every line is
//! a complete segment, so a crash can only truncate at a line boundary and a
//! resumed transcription run picks up from `last_end_time`. Segments are kept
//! in emission order, not sorted by time.

use crate::config::Settings;
use crate::error::Result;
use crate::hashing::sha256_file;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

/// One recognized speech segment with absolute times in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            language: None,
        }
    }
}

/// Per-video append-only segment log on disk.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    settings: Settings,
}

impl TranscriptStore {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn path(&self, video_id: &str) -> PathBuf {
        self.settings.transcript_path(video_id)
    }

    /// Whether a transcript log exists for the video.
    pub fn exists(&self, video_id: &str) -> bool {
        self.path(video_id).exists()
    }

    /// Load segments in emission order, optionally capped at `limit`.
    pub fn load(&self, video_id: &str, limit: Option<usize>) -> Result<Vec<Segment>> {
        let path = self.path(video_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(std::fs::File::open(&path)?);
        let mut segments = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            segments.push(serde_json::from_str(line)?);
            if let Some(limit) = limit {
                if segments.len() >= limit {
                    break;
                }
            }
        }
        Ok(segments)
    }

    /// Largest `end` time seen in the log; 0.0 when absent. Malformed lines
    /// (a torn tail write) are skipped.
    pub fn last_end_time(&self, video_id: &str) -> Result<f64> {
        let path = self.path(video_id);
        if !path.exists() {
            return Ok(0.0);
        }

        let reader = BufReader::new(std::fs::File::open(&path)?);
        let mut last_end = 0.0f64;
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(seg) = serde_json::from_str::<Segment>(line) {
                if seg.end > last_end {
                    last_end = seg.end;
                }
            }
        }
        Ok(last_end)
    }

    /// Append segments, one complete JSON line each.
    pub fn append(&self, video_id: &str, segments: &[Segment]) -> Result<()> {
        let path = self.path(video_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        for seg in segments {
            let mut line = serde_json::to_string(seg)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
        }
        file.flush()?;
        Ok(())
    }

    /// Remove the log; missing files are not an error.
    pub fn delete(&self, video_id: &str) -> Result<()> {
        match std::fs::remove_file(self.path(video_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// SHA-256 of the log file bytes; empty string when absent.
    pub fn content_hash(&self, video_id: &str) -> Result<String> {
        let path = self.path(video_id);
        if !path.exists() {
            return Ok(String::new());
        }
        sha256_file(&path)
    }
}
