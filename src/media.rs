//! Media probing and extraction via ffmpeg/ffprobe.
//!
//! Everything here shells out; nothing links against libav. Binaries are
//! resolved from PATH with `which`, and failures carry the tool's stderr.

use crate::error::{Result, SiktError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, instrument};

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Duration:\s*(\d+):(\d+):(\d+(?:\.\d+)?)").unwrap())
}

fn pts_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"pts_time:(\d+(?:\.\d+)?)").unwrap())
}

fn scene_score_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"lavfi\.scene_score=(\d+(?:\.\d+)?)").unwrap())
}

fn resolve_ffmpeg() -> Result<PathBuf> {
    which::which("ffmpeg").map_err(|_| SiktError::ToolNotFound("ffmpeg".into()))
}

fn resolve_ffprobe() -> Option<PathBuf> {
    which::which("ffprobe").ok()
}

async fn run_checked(mut cmd: Command, tool: &str) -> Result<std::process::Output> {
    let output = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SiktError::ToolNotFound(tool.into()),
            _ => SiktError::ToolFailed(format!("{tool} execution failed: {e}")),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail: String = stderr.chars().take(2000).collect();
        return Err(SiktError::ToolFailed(format!("{tool} failed: {detail}")));
    }
    Ok(output)
}

/// Media duration in seconds. Prefers ffprobe; falls back to parsing the
/// `Duration:` banner from ffmpeg's stderr.
#[instrument(skip_all, fields(path = %media_path.display()))]
pub async fn duration_seconds(media_path: &Path) -> Result<f64> {
    if let Some(ffprobe) = resolve_ffprobe() {
        let mut cmd = Command::new(ffprobe);
        cmd.arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(media_path);
        let output = run_checked(cmd, "ffprobe").await?;
        let text = String::from_utf8_lossy(&output.stdout);
        return text
            .trim()
            .parse()
            .map_err(|_| SiktError::ToolFailed(format!("unparsable duration: {}", text.trim())));
    }

    let ffmpeg = resolve_ffmpeg()?;
    let output = Command::new(ffmpeg)
        .arg("-i")
        .arg(media_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| SiktError::ToolFailed(format!("ffmpeg execution failed: {e}")))?;

    // ffmpeg exits non-zero without an output file; only the banner matters.
    let stderr = String::from_utf8_lossy(&output.stderr);
    let caps = duration_re()
        .captures(&stderr)
        .ok_or_else(|| SiktError::ToolFailed("unable to parse media duration".into()))?;
    let hours: f64 = caps[1].parse().unwrap_or(0.0);
    let minutes: f64 = caps[2].parse().unwrap_or(0.0);
    let seconds: f64 = caps[3].parse().unwrap_or(0.0);
    Ok(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Extract a 16 kHz mono WAV slice.
#[instrument(skip_all, fields(start = start_seconds, dur = ?duration_seconds))]
pub async fn extract_audio_wav(
    media_path: &Path,
    wav_path: &Path,
    start_seconds: f64,
    duration_seconds: Option<f64>,
) -> Result<()> {
    if let Some(parent) = wav_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let ffmpeg = resolve_ffmpeg()?;
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-y");
    if start_seconds > 0.0 {
        cmd.arg("-ss").arg(format!("{start_seconds}"));
    }
    cmd.arg("-i").arg(media_path);
    if let Some(dur) = duration_seconds {
        cmd.arg("-t").arg(format!("{dur}"));
    }
    cmd.arg("-vn")
        .arg("-ac")
        .arg("1")
        .arg("-ar")
        .arg("16000")
        .arg("-f")
        .arg("wav")
        .arg(wav_path);
    run_checked(cmd, "ffmpeg").await?;
    Ok(())
}

/// Extract a single JPEG frame at a timestamp, optionally scaled to a width.
#[instrument(skip_all, fields(ts = timestamp_seconds))]
pub async fn extract_frame_jpg(
    media_path: &Path,
    jpg_path: &Path,
    timestamp_seconds: f64,
    target_width: Option<i64>,
) -> Result<()> {
    if let Some(parent) = jpg_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let ffmpeg = resolve_ffmpeg()?;
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-y")
        .arg("-ss")
        .arg(format!("{timestamp_seconds}"))
        .arg("-i")
        .arg(media_path)
        .arg("-frames:v")
        .arg("1")
        .arg("-q:v")
        .arg("3");
    if let Some(width) = target_width.filter(|w| *w > 0) {
        cmd.arg("-vf").arg(format!("scale={width}:-2"));
    }
    cmd.arg(jpg_path);
    run_checked(cmd, "ffmpeg").await?;
    Ok(())
}

/// Detect scene changes above a threshold; returns (timestamp, score) pairs
/// parsed from the `metadata=print` filter output.
#[instrument(skip_all, fields(threshold = scene_threshold))]
pub async fn detect_scene_changes(
    media_path: &Path,
    scene_threshold: f64,
) -> Result<Vec<(f64, f64)>> {
    let threshold = if scene_threshold <= 0.0 {
        0.3
    } else {
        scene_threshold.min(1.0)
    };

    let ffmpeg = resolve_ffmpeg()?;
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-hide_banner")
        .arg("-nostats")
        .arg("-i")
        .arg(media_path)
        .arg("-vf")
        .arg(format!("select='gt(scene,{threshold})',metadata=print"))
        .arg("-an")
        .arg("-f")
        .arg("null")
        .arg("-");
    let output = run_checked(cmd, "ffmpeg").await?;

    let text = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stderr),
        String::from_utf8_lossy(&output.stdout)
    );

    let mut out = Vec::new();
    let mut last_pts_time: Option<f64> = None;
    for line in text.lines() {
        if let Some(caps) = pts_time_re().captures(line) {
            last_pts_time = caps[1].parse().ok();
            continue;
        }
        if let Some(caps) = scene_score_re().captures(line) {
            if let (Some(ts), Ok(score)) = (last_pts_time, caps[1].parse::<f64>()) {
                out.push((ts, score));
            }
        }
    }

    debug!("Detected {} scene changes", out.len());
    Ok(out)
}

/// JPEG frame markers that carry frame dimensions (SOF0..SOF15 minus DHT,
/// JPG, DAC placeholders).
const SOF_MARKERS: [u8; 13] = [
    0xC0, 0xC1, 0xC2, 0xC3, 0xC5, 0xC6, 0xC7, 0xC9, 0xCA, 0xCB, 0xCD, 0xCE, 0xCF,
];

/// Read pixel dimensions from a JPEG by walking segment markers up to SOS.
pub fn jpg_dimensions(jpg_path: &Path) -> Result<(u32, u32)> {
    let data = std::fs::read(jpg_path)?;
    let data = &data[..data.len().min(256 * 1024)];

    if data.len() < 4 || data[0..2] != [0xFF, 0xD8] {
        return Err(SiktError::InvalidInput("INVALID_JPG".into()));
    }

    let n = data.len();
    let mut i = 2usize;
    while i + 4 <= n {
        if data[i] != 0xFF {
            i += 1;
            continue;
        }

        while i < n && data[i] == 0xFF {
            i += 1;
        }
        if i >= n {
            break;
        }

        let marker = data[i];
        i += 1;

        if marker == 0xD8 || marker == 0xD9 {
            continue;
        }
        if marker == 0xDA {
            break;
        }

        if i + 2 > n {
            break;
        }
        let seg_len = ((data[i] as usize) << 8) + data[i + 1] as usize;
        i += 2;
        if seg_len < 2 || i + (seg_len - 2) > n {
            break;
        }

        if SOF_MARKERS.contains(&marker) {
            if seg_len < 7 {
                break;
            }
            let height = ((data[i + 1] as u32) << 8) + data[i + 2] as u32;
            let width = ((data[i + 3] as u32) << 8) + data[i + 4] as u32;
            if width == 0 || height == 0 {
                return Err(SiktError::InvalidInput("INVALID_JPG_DIM".into()));
            }
            return Ok((width, height));
        }

        i += seg_len - 2;
    }

    Err(SiktError::InvalidInput("JPG_DIM_NOT_FOUND".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_jpg(bytes: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.jpg");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        (dir, path)
    }

    /// Minimal JPEG: SOI, APP0 stub, SOF0 with 320x240, SOS.
    fn synthetic_jpg(width: u16, height: u16) -> Vec<u8> {
        let mut out = vec![0xFF, 0xD8];
        // APP0 segment, 4 payload bytes.
        out.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x06, b'J', b'F', b'I', b'F']);
        // SOF0: len=11, precision=8, height, width, 1 component.
        out.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
        // SOS terminates the scan.
        out.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x02]);
        out
    }

    #[test]
    fn test_jpg_dimensions_from_sof0() {
        let (_dir, path) = write_jpg(&synthetic_jpg(320, 240));
        assert_eq!(jpg_dimensions(&path).unwrap(), (320, 240));
    }

    #[test]
    fn test_jpg_dimensions_rejects_non_jpeg() {
        let (_dir, path) = write_jpg(b"not a jpeg at all");
        let err = jpg_dimensions(&path).unwrap_err();
        assert!(err.to_string().contains("INVALID_JPG"));
    }

    #[test]
    fn test_jpg_dimensions_missing_sof() {
        // SOI then straight to SOS: no SOF marker to read.
        let (_dir, path) = write_jpg(&[0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02]);
        let err = jpg_dimensions(&path).unwrap_err();
        assert!(err.to_string().contains("JPG_DIM_NOT_FOUND"));
    }

    #[test]
    fn test_jpg_dimensions_zero_size_rejected() {
        let (_dir, path) = write_jpg(&synthetic_jpg(0, 240));
        let err = jpg_dimensions(&path).unwrap_err();
        assert!(err.to_string().contains("INVALID_JPG_DIM"));
    }

    #[test]
    fn test_scene_score_regexes() {
        let line = "frame:12 pts:3000 pts_time:3.125";
        let caps = pts_time_re().captures(line).unwrap();
        assert_eq!(&caps[1], "3.125");

        let line = "lavfi.scene_score=0.412";
        let caps = scene_score_re().captures(line).unwrap();
        assert_eq!(&caps[1], "0.412");
    }
}
