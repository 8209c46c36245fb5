//! Search-text normalization and hashing
//!
//! The strip list below is part of the embedding-version contract:
//! changing it requires bumping [`NORM_RULES_REV`], which forces every
//! row to re-embed on the next sync.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Revision tag for the normalization rules
pub const NORM_RULES_REV: &str = "n1";

/// Release-name noise stripped before hashing and embedding
const NOISE_TOKENS: &[&str] = &[
    // resolution
    "2160p", "1080p", "1080i", "720p", "480p", "4k", "8k", "uhd",
    // codec
    "x264", "x265", "h264", "h265", "h 264", "h 265", "hevc", "avc", "av1", "xvid", "divx",
    // container / rip source
    "bluray", "blu ray", "blu-ray", "bdrip", "brrip", "webrip", "web dl", "web-dl", "webdl",
    "hdtv", "dvdrip", "hdrip", "remux", "mkv", "mp4", "avi",
    // audio
    "aac", "ac3", "dts", "truehd", "atmos", "flac", "ddp5 1", "dd5 1",
    // misc release tags
    "hdr", "hdr10", "dolby vision", "10bit", "8bit", "proper", "repack", "internal",
    "limited", "extended", "unrated", "remastered",
];

fn noise_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let alternation = NOISE_TOKENS
            .iter()
            .map(|t| regex::escape(t))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).expect("static noise pattern")
    })
}

fn whitespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+").expect("static whitespace pattern"))
}

/// Normalize a raw title or search text for embedding.
///
/// Dots and underscores act as word separators in release names; after
/// separator folding the noise tokens are removed and whitespace is
/// collapsed. Case is preserved for everything that survives.
pub fn normalize_search_text(raw: &str) -> String {
    let separated = raw.replace(['.', '_', '[', ']', '(', ')'], " ");
    let stripped = noise_pattern().replace_all(&separated, " ");
    whitespace_pattern()
        .replace_all(stripped.trim(), " ")
        .to_string()
}

/// Deterministic hex hash of the normalized embedding input.
pub fn text_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Embedding version tag: model, dimension, and normalization revision.
///
/// The state store compares this tag verbatim, so vectors produced under
/// any other combination are never treated as interchangeable.
pub fn embedding_version(model: &str, dim: usize) -> String {
    format!("{}:{}:{}", model, dim, NORM_RULES_REV)
}

/// Version tag for the local fallback embedder.
pub fn local_embedding_version(model: &str, dim: usize) -> String {
    format!("{}+local", embedding_version(model, dim))
}

/// True when any character falls outside ASCII; drives the
/// cross-language secondary search.
pub fn is_non_ascii(text: &str) -> bool {
    !text.is_ascii()
}
