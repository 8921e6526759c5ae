//! Splits an explanation into ordered, step-numbered content chunks.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Text,
    Equation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentChunk {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    #[serde(default)]
    pub step: u32,
}

impl ContentChunk {
    pub fn new(content: impl Into<String>, kind: ChunkKind, step: u32) -> Self {
        Self {
            content: content.into(),
            kind,
            step,
        }
    }
}

fn is_equation(paragraph: &str) -> bool {
    paragraph.contains('$') || paragraph.contains("\\(") || paragraph.contains("\\begin{")
}

/// Split on blank lines, one step per non-blank paragraph. Paragraph text is
/// kept as written; whitespace only decides what counts as blank.
///
/// With `skip_chunking` the whole text becomes a single step-1 text chunk.
pub fn process_text_into_chunks(text: &str, skip_chunking: bool) -> Vec<ContentChunk> {
    if skip_chunking {
        return vec![ContentChunk::new(text, ChunkKind::Text, 1)];
    }

    text.split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .enumerate()
        .map(|(i, paragraph)| {
            let kind = if is_equation(paragraph) {
                ChunkKind::Equation
            } else {
                ChunkKind::Text
            };
            ContentChunk::new(paragraph, kind, i as u32 + 1)
        })
        .collect()
}

/// Group chunks by step in ascending order. Step 0 is treated as step 1.
pub fn group_by_step(chunks: &[ContentChunk]) -> Vec<(u32, Vec<ContentChunk>)> {
    let mut steps: BTreeMap<u32, Vec<ContentChunk>> = BTreeMap::new();
    for chunk in chunks {
        steps.entry(chunk.step.max(1)).or_default().push(chunk.clone());
    }
    steps.into_iter().collect()
}

static MATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\$[^$]+\$|\\\(.*?\\\)|\\\[.*?\\\]|\\begin\{[^}]+\}.*?\\end\{[^}]+\}")
        .expect("invalid math regex")
});

static KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z][a-z]{2,}\b|\b[a-z]{3,}\b")
        .expect("invalid keyword regex")
});

static UNIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d+(\.\d+)?\s*[a-zA-Z]+\b")
        .expect("invalid unit regex")
});

/// Math expressions, then words, then quantities with units; first occurrence wins.
pub fn extract_key_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut terms = Vec::new();

    for re in [&*MATH_RE, &*KEYWORD_RE, &*UNIT_RE] {
        for m in re.find_iter(text) {
            let term = m.as_str();
            if seen.insert(term.to_string()) {
                terms.push(term.to_string());
            }
        }
    }

    terms
}
