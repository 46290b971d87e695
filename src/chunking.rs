//! Time-window chunking of transcript segments.
//!
//! Greedy windows aimed at `target_window_seconds`, cut early at natural
//! boundaries (sentence terminators or silence gaps) once past the target,
//! force-cut at `max_window_seconds`, and rewound by `overlap_seconds` so
//! consecutive chunks share trailing context.

use crate::transcript_store::Segment;

/// Sentence terminators recognized as natural boundaries. Chinese and ASCII
/// punctuation are equivalent: 。！？； and . ! ? ;
const BOUNDARY_TERMINATORS: [char; 8] =
    ['\u{3002}', '\u{FF01}', '\u{FF1F}', '.', '!', '?', '\u{FF1B}', ';'];

/// Gap between consecutive segments treated as a boundary, in seconds.
const SILENCE_GAP_SECONDS: f64 = 0.8;

/// One emitted time window.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeChunk {
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
}

/// Windowing parameters.
#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub target_window_seconds: f64,
    pub max_window_seconds: f64,
    pub min_window_seconds: f64,
    pub overlap_seconds: f64,
}

fn is_natural_boundary(text: &str) -> bool {
    let t = text.trim();
    match t.chars().last() {
        Some(c) => BOUNDARY_TERMINATORS.contains(&c),
        None => false,
    }
}

/// Split ordered segments into overlapping time windows.
pub fn segments_to_time_chunks(segments: &[Segment], params: &ChunkParams) -> Vec<TimeChunk> {
    let segs: Vec<(f64, f64, &str)> = segments
        .iter()
        .filter(|s| s.end > s.start && !s.text.trim().is_empty())
        .map(|s| (s.start, s.end, s.text.trim()))
        .collect();

    if segs.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let n = segs.len();
    let mut i = 0usize;

    while i < n {
        let start_time = segs[i].0;
        let mut end_time = segs[i].1;
        let mut texts: Vec<&str> = vec![segs[i].2];
        let mut last_boundary_j: Option<usize> = None;

        let mut j = i;
        loop {
            let cur_len = end_time - start_time;
            if cur_len >= params.target_window_seconds {
                if is_natural_boundary(texts[texts.len() - 1]) {
                    last_boundary_j = Some(j);
                }

                if j + 1 < n {
                    let gap = segs[j + 1].0 - segs[j].1;
                    if gap >= SILENCE_GAP_SECONDS {
                        last_boundary_j = Some(j);
                    }
                }

                if let Some(boundary) = last_boundary_j {
                    if cur_len >= params.min_window_seconds {
                        j = boundary;
                        end_time = segs[j].1;
                        texts = segs[i..=j].iter().map(|s| s.2).collect();
                        break;
                    }
                }
            }

            if cur_len >= params.max_window_seconds {
                break;
            }

            if j + 1 >= n {
                break;
            }

            j += 1;
            end_time = segs[j].1;
            texts.push(segs[j].2);
        }

        chunks.push(TimeChunk {
            start_time,
            end_time,
            text: texts.join(" ").trim().to_string(),
        });

        if j + 1 >= n {
            break;
        }

        // Rewind the next window to include overlap, but always advance.
        let next_start_threshold = end_time - params.overlap_seconds;
        let mut k = j;
        while k > i && segs[k - 1].1 > next_start_threshold {
            k -= 1;
        }
        i = k.max(i + 1);
    }

    chunks
}
