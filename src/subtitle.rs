//! Subtitle export formats.

use crate::transcript_store::Segment;

fn timestamp(seconds: f64, separator: char) -> String {
    let mut ms = (seconds.max(0.0) * 1000.0).round() as i64;
    let h = ms / 3_600_000;
    ms -= h * 3_600_000;
    let m = ms / 60_000;
    ms -= m * 60_000;
    let s = ms / 1000;
    ms -= s * 1000;
    format!("{h:02}:{m:02}:{s:02}{separator}{ms:03}")
}

/// Render segments as SubRip text.
pub fn segments_to_srt(segments: &[Segment]) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut idx = 0;
    for seg in segments {
        let text = seg.text.trim();
        if text.is_empty() {
            continue;
        }
        idx += 1;
        lines.push(idx.to_string());
        lines.push(format!(
            "{} --> {}",
            timestamp(seg.start, ','),
            timestamp(seg.end, ',')
        ));
        lines.push(text.to_string());
        lines.push(String::new());
    }
    format!("{}\n", lines.join("\n").trim())
}

/// Render segments as WebVTT text.
pub fn segments_to_vtt(segments: &[Segment]) -> String {
    let mut lines: Vec<String> = vec!["WEBVTT".to_string(), String::new()];
    for seg in segments {
        let text = seg.text.trim();
        if text.is_empty() {
            continue;
        }
        lines.push(format!(
            "{} --> {}",
            timestamp(seg.start, '.'),
            timestamp(seg.end, '.')
        ));
        lines.push(text.to_string());
        lines.push(String::new());
    }
    format!("{}\n", lines.join("\n").trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_srt_numbering_and_timestamps() {
        let segs = vec![
            Segment::new(0.0, 1.5, "hello"),
            Segment::new(1.5, 3661.25, "world"),
            Segment::new(5.0, 6.0, "   "),
        ];
        let srt = segments_to_srt(&segs);
        assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:01,500\nhello"));
        assert!(srt.contains("2\n00:00:01,500 --> 01:01:01,250\nworld"));
        // Blank segment is skipped, so only two cues.
        assert!(!srt.contains("\n3\n"));
    }

    #[test]
    fn test_vtt_header_and_dot_separator() {
        let segs = vec![Segment::new(0.0, 1.0, "hi")];
        let vtt = segments_to_vtt(&segs);
        assert!(vtt.starts_with("WEBVTT\n"));
        assert!(vtt.contains("00:00:00.000 --> 00:00:01.000\nhi"));
    }
}
