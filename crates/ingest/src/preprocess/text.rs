use std::sync::LazyLock;

use regex::Regex;

use crate::chunk::{ChunkKind, Segment};
use crate::chunker::{Chunker, ChunkerConfig};

const PREVIEW_LINES: usize = 5;
const PREVIEW_CHARS: usize = 300;
const MAX_QA_CHUNKS: usize = 10;

static MARKDOWN_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,3})\s+(.+)$").expect("valid header regex"));

static DEFINITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Z][^.]*?)\s+is\s+(a|an|the)\s+([^.]+\.)").expect("valid definition regex")
});

pub fn preprocess_text(content: &str, filename: &str, config: ChunkerConfig) -> Vec<Segment> {
    let chunker = Chunker::new(config);
    let mut segments = vec![Segment::new(ChunkKind::Summary, summarize(content, filename))];

    let sections = extract_sections(content);
    if sections.is_empty() {
        segments.extend(
            chunker
                .chunk_text(content, Some(filename))
                .into_iter()
                .map(|text| Segment::new(ChunkKind::Body, text)),
        );
    } else {
        for (title, body) in sections {
            let context = format!("{} > {}", filename, title);
            for text in chunker.chunk_text(&body, Some(&context)) {
                let mut segment = Segment::new(ChunkKind::Section, text);
                segment.path = Some(title.clone());
                segments.push(segment);
            }
        }
    }

    segments.extend(
        extract_qa(content, filename)
            .into_iter()
            .map(|text| Segment::new(ChunkKind::Qa, text)),
    );

    segments
}

pub fn summarize(content: &str, filename: &str) -> String {
    let non_empty: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let preview: String = non_empty
        .iter()
        .take(PREVIEW_LINES)
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(PREVIEW_CHARS)
        .collect();
    let ellipsis = if preview.chars().count() >= PREVIEW_CHARS { "..." } else { "" };

    format!(
        "Document: {}\nSummary: This document contains {} words across {} lines.\nPreview: {}{}\n",
        filename,
        content.split_whitespace().count(),
        non_empty.len(),
        preview,
        ellipsis
    )
}

/// Split on Markdown headers (`#` to `###`) and short ALL-CAPS divider lines.
/// Returns `(title, body)` pairs; text before the first header is not a section.
pub fn extract_sections(content: &str) -> Vec<(String, String)> {
    let mut sections = Vec::new();
    let mut current: Option<String> = None;
    let mut body: Vec<&str> = Vec::new();

    for line in content.lines() {
        let title = MARKDOWN_HEADER
            .captures(line)
            .map(|caps| caps[2].trim().to_string())
            .or_else(|| is_caps_header(line).then(|| line.trim().to_string()));

        match title {
            Some(title) => {
                if let Some(prev) = current.take() {
                    push_section(&mut sections, prev, &body);
                }
                current = Some(title);
                body.clear();
            }
            None => body.push(line),
        }
    }

    if let Some(prev) = current {
        push_section(&mut sections, prev, &body);
    }

    sections
}

fn push_section(sections: &mut Vec<(String, String)>, title: String, body: &[&str]) {
    let text = body.join("\n");
    if !text.trim().is_empty() {
        sections.push((title, text));
    }
}

fn is_caps_header(line: &str) -> bool {
    let has_upper = line.chars().any(char::is_uppercase);
    let has_lower = line.chars().any(char::is_lowercase);

    has_upper && !has_lower && line.split_whitespace().count() >= 2 && line.chars().count() < 100
}

/// Heuristic "X is a/an/the Y." definitions rendered as question/answer chunks.
pub fn extract_qa(content: &str, filename: &str) -> Vec<String> {
    DEFINITION
        .captures_iter(content)
        .filter_map(|caps| {
            let subject = caps[1].trim();
            let definition = caps[0].trim();
            (subject.chars().count() > 3 && definition.chars().count() > 20).then(|| {
                format!("[{}] What is {}?\nAnswer: {}", filename, subject, definition)
            })
        })
        .take(MAX_QA_CHUNKS)
        .collect()
}
