//! Markdown-aware chunking with scored split-point selection.
//!
//! Documents are cut at structurally meaningful boundaries (headings,
//! horizontal rules, code-fence edges, blank lines, list items). Each
//! boundary carries a baseline importance that decays quadratically with
//! distance from the ideal cut point, so a nearby heading beats a closer
//! blank line but loses to one right on target.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s").expect("valid heading regex"));
static HR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(-{3,}|\*{3,}|_{3,})\s*$").expect("valid hr regex"));
static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^(`{3,}|~{3,})").expect("valid fence regex"));
static LIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*[-*+]|\s*\d+\.)\s").expect("valid list regex"));
static DATA_IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\(data:[^)]+\)").expect("valid data image regex"));

/// A bounded, positionally-addressed slice of a document's text; the unit
/// of retrieval and embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub content: String,
    /// Position within the file's chunk set, contiguous from 0.
    pub sequence: usize,
    /// 1-indexed first line of the chunk in the source document.
    pub start_line: usize,
    /// 1-indexed last line, inclusive.
    pub end_line: usize,
    /// SHA-256 of the chunk text, hex-encoded.
    pub content_hash: String,
}

/// Kinds of candidate split points, ordered by structural weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    /// Markdown heading with its level (1–6).
    Heading(u8),
    /// Fenced code block edge (``` or ~~~). Toggles fence state.
    Fence,
    /// Horizontal rule.
    Rule,
    /// Blank line, i.e. a paragraph break.
    Blank,
    /// List item start.
    ListItem,
}

impl Boundary {
    fn baseline(self) -> f32 {
        match self {
            Boundary::Heading(level) => (110 - 10 * u32::from(level)) as f32,
            Boundary::Fence => 80.0,
            Boundary::Rule => 70.0,
            Boundary::Blank => 10.0,
            Boundary::ListItem => 5.0,
        }
    }
}

/// Hex-encoded SHA-256 of a text, used for chunk and file fingerprints.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Rough token count; 4 bytes per token is close enough for cut placement.
fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

fn classify_line(line: &str) -> Option<Boundary> {
    if let Some(captures) = HEADING_RE.captures(line) {
        let level = captures.get(1).map_or(1, |m| m.as_str().len()) as u8;
        return Some(Boundary::Heading(level));
    }
    if HR_RE.is_match(line) {
        return Some(Boundary::Rule);
    }
    if FENCE_RE.is_match(line) {
        return Some(Boundary::Fence);
    }
    if line.trim().is_empty() {
        return Some(Boundary::Blank);
    }
    if LIST_RE.is_match(line) {
        return Some(Boundary::ListItem);
    }
    None
}

/// Score a candidate cut. Importance decays quadratically with distance
/// from the ideal cut line.
fn score_boundary(baseline: f32, distance: usize, window: usize) -> f32 {
    if window == 0 {
        return baseline;
    }
    let ratio = distance as f32 / window as f32;
    baseline * (1.0 - ratio * ratio)
}

/// Split a markdown document into overlapping chunks near `target_tokens`.
///
/// Inline base64 image payloads are stripped first and never count toward
/// chunk size. Fenced code blocks are never split internally; a fence too
/// large for the target is emitted whole. Trailing content shorter than
/// the overlap becomes its own final chunk.
pub fn chunk_markdown(text: &str, target_tokens: usize, overlap_fraction: f32) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let stripped = DATA_IMAGE_RE.replace_all(text, "");
    let lines: Vec<&str> = stripped.split_inclusive('\n').collect();
    let total_lines = lines.len();
    let classes: Vec<Option<Boundary>> = lines.iter().map(|line| classify_line(line)).collect();

    let mut chunks = Vec::new();
    let mut pos = 0usize;
    let mut seq = 0usize;

    while pos < total_lines {
        // Accumulate tokens, tracking code fence state. The candidate
        // window opens at 70% of target; accumulation stops at 130%.
        let mut in_fence = false;
        let mut tokens = 0usize;
        let mut window_start: Option<usize> = None;
        let mut end = pos;

        for i in pos..total_lines {
            tokens += estimate_tokens(lines[i]);
            end = i + 1;
            if classes[i] == Some(Boundary::Fence) {
                in_fence = !in_fence;
            }
            if window_start.is_none() && tokens * 10 >= target_tokens * 7 {
                window_start = Some(i);
            }
            if tokens * 10 >= target_tokens * 13 {
                break;
            }
        }

        // Everything left fits in one chunk.
        if end >= total_lines {
            let content: String = lines[pos..total_lines].concat();
            if !content.trim().is_empty() {
                chunks.push(Chunk {
                    content_hash: content_hash(&content),
                    content,
                    sequence: seq,
                    start_line: pos + 1,
                    end_line: total_lines,
                });
            }
            break;
        }

        let window_start = window_start.unwrap_or(pos);

        // The ideal cut is where the running total reaches the target.
        let mut target_line = None;
        let mut running = 0usize;
        for i in pos..end {
            running += estimate_tokens(lines[i]);
            if running >= target_tokens {
                target_line = Some(i);
                break;
            }
        }
        let target_line = target_line.unwrap_or(end - 1);
        let window_size = end - window_start;

        // Fence state entering the window, so cuts inside an open fence
        // are rejected (cutting ON a fence line is allowed).
        let mut fence_state = false;
        for i in pos..window_start {
            if classes[i] == Some(Boundary::Fence) {
                fence_state = !fence_state;
            }
        }

        let mut best_score = f32::NEG_INFINITY;
        let mut best_idx = end;
        let mut found = false;
        for i in window_start..end {
            let class = classes[i];
            if class == Some(Boundary::Fence) {
                fence_state = !fence_state;
            }
            let Some(boundary) = class else { continue };
            if fence_state && boundary != Boundary::Fence {
                continue;
            }
            let distance = target_line.abs_diff(i);
            let score = score_boundary(boundary.baseline(), distance, window_size);
            if score > best_score {
                best_score = score;
                best_idx = i;
                found = true;
            }
        }

        // Trapped inside a fence with no safe cut: extend to the closing
        // fence, capped at 3x target, and emit the block whole.
        if !found && in_fence {
            let max_tokens = target_tokens * 3;
            let mut tokens_ext = tokens;
            let mut extend_end = end;
            let mut fence_state_ext = in_fence;
            while extend_end < total_lines && tokens_ext < max_tokens {
                let class = classes[extend_end];
                tokens_ext += estimate_tokens(lines[extend_end]);
                extend_end += 1;
                if class == Some(Boundary::Fence) {
                    fence_state_ext = !fence_state_ext;
                    if !fence_state_ext {
                        break;
                    }
                }
            }
            if extend_end > end {
                best_idx = extend_end;
            }
        }

        // A cut at or before the current position would produce an empty
        // chunk; push forward to the hard limit instead.
        if best_idx <= pos {
            best_idx = end;
        }

        let content: String = lines[pos..best_idx].concat();
        if !content.trim().is_empty() {
            chunks.push(Chunk {
                content_hash: content_hash(&content),
                content,
                sequence: seq,
                start_line: pos + 1,
                end_line: best_idx,
            });
            seq += 1;
        }

        // Next chunk starts a fraction of this chunk's lines before the cut.
        let overlap_lines = ((best_idx - pos) as f32 * overlap_fraction) as usize;
        let mut next_pos = best_idx.saturating_sub(overlap_lines);
        if next_pos <= pos {
            next_pos = best_idx;
        }
        pos = next_pos;
    }

    chunks
}
