//! Local text processing for document ingestion: main-text extraction,
//! boilerplate cleaning, paragraph chunking, cheap chunk scoring and the
//! content hash used for deduplication.
//!
//! Paragraphs are separated by blank lines at every stage, so chunking can
//! cut on paragraph boundaries.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

static DROPPED_BLOCKS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ["script", "style", "nav", "footer", "header"]
        .iter()
        .map(|tag| Regex::new(&format!(r"(?is)<{tag}\b.*?</{tag}\s*>")).unwrap())
        .collect()
});

static BLOCK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*/?\s*(?:br|p|div|h[1-6]|li|ul|ol|tr|table|section|article|blockquote)\b[^>]*>")
        .unwrap()
});

static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

static INLINE_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\r\x0B\x0C]+").unwrap());

static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

static PARAGRAPH_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{2,}").unwrap());

/// Boilerplate markers and how much of the rest of their line goes with them.
static JUNK: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        (
            "menu|nav|footer|sidebar|header|cookie|newsletter|subscribe|advertisement|share this|related posts|te puede interesar|artículos relacionados|categorías|etiquetas|tags|comments|deja un comentario|leave a reply",
            500,
        ),
        (
            "follow us|síguenos|redes sociales|facebook|twitter|instagram|linkedin|youtube|pinterest|whatsapp",
            200,
        ),
        ("privacy policy|política de privacidad|terms of service|aviso legal|cookies?", 300),
        ("you will receive|suscríbete|subscribe|sign up|regístrate", 200),
    ]
    .iter()
    .map(|(words, tail)| Regex::new(&format!(r"(?i)\b(?:{words})\b[^\n]{{0,{tail}}}")).unwrap())
    .collect()
});

/// URLs, leaving a sentence-ending period in place.
static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S*[^\s.]").unwrap());

static NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)cookie|subscribe|privacy|facebook|twitter|instagram|related|newsletter").unwrap()
});

/// Lines this short are menu entries, captions or buttons.
const MIN_LINE_CHARS: usize = 40;

/// Cleaned text shorter than this is treated as empty.
const MIN_CLEAN_CHARS: usize = 200;

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Strip markup from an HTML page (plain text passes through). Script,
/// style, navigation, header and footer blocks are dropped with their
/// content; block-level tags become paragraph breaks.
pub fn extract_main_text(html: &str) -> String {
    let mut text = html.to_string();
    for block in DROPPED_BLOCKS.iter() {
        text = block.replace_all(&text, " ").into_owned();
    }
    let text = BLOCK_TAG.replace_all(&text, "\n\n");
    let text = ANY_TAG.replace_all(&text, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let lines: Vec<String> = text
        .lines()
        .map(|line| INLINE_SPACE.replace_all(line, " ").trim().to_string())
        .collect();
    BLANK_RUN
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

/// Extraction quality label from the word count of the main text.
pub fn extraction_quality(words: usize) -> &'static str {
    if words > 800 {
        "high"
    } else if words > 300 {
        "medium"
    } else {
        "low"
    }
}

/// Remove boilerplate, URLs and short lines. Returns an empty string when
/// less than a couple of hundred characters survive.
pub fn clean_scraped(text: &str) -> String {
    let mut cleaned = text.to_string();
    for pattern in JUNK.iter() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    let cleaned = URL.replace_all(&cleaned, "");
    let kept: Vec<&str> = cleaned
        .lines()
        .filter(|line| {
            let line = line.trim();
            line.is_empty() || line.chars().count() > MIN_LINE_CHARS
        })
        .collect();
    let joined = kept.join("\n");
    let cleaned = BLANK_RUN.replace_all(&joined, "\n\n");
    let cleaned = INLINE_SPACE.replace_all(&cleaned, " ");
    let cleaned = cleaned.trim();
    if cleaned.chars().count() < MIN_CLEAN_CHARS {
        return String::new();
    }
    cleaned.to_string()
}

/// Pack paragraphs into chunks. A paragraph that would push the open chunk
/// past `max_words` starts a new one; a chunk is closed as soon as it holds
/// `target_words`. A single paragraph longer than `max_words` stays whole.
pub fn cheap_chunk(text: &str, target_words: usize, max_words: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut open: Vec<&str> = Vec::new();
    let mut words = 0;

    for paragraph in PARAGRAPH_BREAK.split(text).map(str::trim).filter(|p| !p.is_empty()) {
        let count = word_count(paragraph);
        if words + count > max_words {
            close_chunk(&mut chunks, &mut open, &mut words);
        }
        open.push(paragraph);
        words += count;
        if words >= target_words {
            close_chunk(&mut chunks, &mut open, &mut words);
        }
    }
    close_chunk(&mut chunks, &mut open, &mut words);
    chunks
}

fn close_chunk(chunks: &mut Vec<String>, open: &mut Vec<&str>, words: &mut usize) {
    if !open.is_empty() {
        chunks.push(open.join("\n\n"));
        open.clear();
        *words = 0;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkVerdict {
    Keep,
    Repair,
    Drop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ChunkScore {
    pub score: i64,
    pub verdict: ChunkVerdict,
    pub words: usize,
    /// Share of words that are social or consent boilerplate
    pub noise_ratio: f64,
}

/// Score a chunk on length and boilerplate density, starting from 100.
pub fn score_chunk(content: &str) -> ChunkScore {
    let words = word_count(content);
    let noise_ratio = NOISE.find_iter(content).count() as f64 / words.max(1) as f64;

    let mut score = 100;
    if words < 80 {
        score -= 60;
    }
    if words > 650 {
        score -= 20;
    }
    if noise_ratio > 0.02 {
        score -= 25;
    }
    if noise_ratio > 0.06 {
        score -= 50;
    }

    let verdict = match score {
        s if s >= 75 => ChunkVerdict::Keep,
        s if s >= 55 => ChunkVerdict::Repair,
        _ => ChunkVerdict::Drop,
    };
    ChunkScore {
        score,
        verdict,
        words,
        noise_ratio: (noise_ratio * 10_000.0).round() / 10_000.0,
    }
}

/// Lowercase with whitespace runs collapsed, so trivially different copies
/// of a text hash the same.
pub fn normalize_for_hash(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Hex SHA-256 of the normalized text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_for_hash(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentence(n: usize) -> String {
        (0..n).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_extract_drops_scripts_and_chrome() {
        let html = r#"<html><head><style>p { color: red }</style></head>
            <body><header>Site title</header><nav><a href="/">Home</a></nav>
            <p>First   paragraph &amp; more.</p><script>alert("x")</script>
            <div>Second<br/>line</div><footer>(c) 2026</footer></body></html>"#;
        let text = extract_main_text(html);
        assert!(text.contains("First paragraph & more."));
        assert!(text.contains("Second\n\nline"));
        for gone in ["Site title", "Home", "alert", "color", "(c) 2026"] {
            assert!(!text.contains(gone), "{} survived", gone);
        }
        assert!(!text.contains("\n\n\n"));
    }

    #[test]
    fn test_extract_keeps_plain_text_paragraphs() {
        let text = extract_main_text("One line.\n\n\n\nTwo   line.\n");
        assert_eq!(text, "One line.\n\nTwo line.");
    }

    #[test]
    fn test_extraction_quality_bands() {
        assert_eq!(extraction_quality(801), "high");
        assert_eq!(extraction_quality(800), "medium");
        assert_eq!(extraction_quality(301), "medium");
        assert_eq!(extraction_quality(300), "low");
    }

    #[test]
    fn test_clean_removes_boilerplate_urls_and_short_lines() {
        let body = "Seasonal allergies push antihistamine sales up sharply every spring in the region.";
        let text = format!(
            "{body}\nMenu\nFollow us on Facebook for daily offers and more news from the team\n\n\
             Read the full report at https://example.org/report.pdf. {body}\n\n{body}\n{body}"
        );
        let cleaned = clean_scraped(&text);
        assert!(!cleaned.is_empty());
        assert!(!cleaned.contains("Facebook"));
        assert!(!cleaned.contains("https://"));
        assert!(cleaned.contains("report at . Seasonal"));
        assert!(!cleaned.lines().any(|l| l.trim() == "Menu"));
        assert!(cleaned.contains("\n\n"));
    }

    #[test]
    fn test_clean_returns_empty_for_short_text() {
        assert_eq!(
            clean_scraped("A line that is long enough to survive the line filter."),
            ""
        );
    }

    #[test]
    fn test_junk_words_need_word_boundaries() {
        let line = "The unavailable stock of the pharmacy chain caused long queues last winter.";
        let text = [line; 4].join("\n");
        assert!(clean_scraped(&text).contains("unavailable"));
    }

    #[test]
    fn test_cheap_chunk_packs_paragraphs() {
        let text = [sentence(100), sentence(100), sentence(50), sentence(300), sentence(20)].join("\n\n");
        let chunks = cheap_chunk(&text, 180, 320);
        let sizes: Vec<usize> = chunks.iter().map(|c| word_count(c)).collect();
        // 100+100 reaches the target; 50 cannot take 300 more; 300 alone
        // reaches it; the tail is flushed at the end.
        assert_eq!(sizes, vec![200, 50, 300, 20]);
    }

    #[test]
    fn test_cheap_chunk_keeps_oversized_paragraph_whole() {
        let chunks = cheap_chunk(&sentence(500), 180, 320);
        assert_eq!(chunks.len(), 1);
        assert!(cheap_chunk("  \n\n ", 180, 320).is_empty());
    }

    #[test]
    fn test_score_chunk_verdicts() {
        let clean = score_chunk(&sentence(200));
        assert_eq!((clean.score, clean.verdict), (100, ChunkVerdict::Keep));

        let short = score_chunk(&sentence(30));
        assert_eq!((short.score, short.verdict), (40, ChunkVerdict::Drop));

        // 3 noise hits in 100 words: ratio 0.03
        let noisy = format!("{} cookie privacy newsletter", sentence(97));
        let scored = score_chunk(&noisy);
        assert_eq!(scored.noise_ratio, 0.03);
        assert_eq!((scored.score, scored.verdict), (75, ChunkVerdict::Keep));

        let long = score_chunk(&format!("{} facebook twitter", sentence(698)));
        assert_eq!((long.score, long.verdict), (80, ChunkVerdict::Keep));

        let spam = score_chunk(&format!("{} {}", sentence(90), "subscribe ".repeat(10)));
        assert_eq!((spam.score, spam.verdict), (25, ChunkVerdict::Drop));
    }

    #[test]
    fn test_content_hash_ignores_case_and_spacing() {
        assert_eq!(content_hash("Hello  World\n"), content_hash("hello world"));
        assert_ne!(content_hash("hello world"), content_hash("hello there"));
        assert_eq!(content_hash("x").len(), 64);
    }
}
