use tracing::warn;

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Maximum chunk length in characters
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ChunkerConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self { chunk_size, overlap }
    }

    /// Force `0 <= overlap < chunk_size` so the cursor always moves.
    fn clamped(self) -> Self {
        let chunk_size = self.chunk_size.max(1);
        let overlap = self.overlap.min(chunk_size - 1);
        if chunk_size != self.chunk_size || overlap != self.overlap {
            warn!(
                requested_size = self.chunk_size,
                requested_overlap = self.overlap,
                chunk_size,
                overlap,
                "Clamped invalid chunker configuration"
            );
        }
        Self { chunk_size, overlap }
    }
}

/// Boundary-aware sliding-window splitter. Lengths are counted in chars.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config: config.clamped(),
        }
    }

    pub fn config(&self) -> ChunkerConfig {
        self.config
    }

    pub fn chunk_text(&self, text: &str, context: Option<&str>) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let ChunkerConfig { chunk_size, overlap } = self.config;

        if text.trim().is_empty() {
            return Vec::new();
        }
        if chars.len() <= chunk_size {
            return vec![with_context(text, context)];
        }

        let mut chunks = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let mut end = (start + chunk_size).min(chars.len());

            if end < chars.len() {
                if let Some(break_point) = find_break(&chars[start..end]) {
                    end = start + break_point + 1;
                }
            }

            let piece: String = chars[start..end].iter().collect();
            // Whitespace-only windows would otherwise become a bare prefix
            let piece = piece.trim();
            if !piece.is_empty() {
                chunks.push(with_context(piece, context));
            }

            if end >= chars.len() {
                break;
            }

            let next = end.saturating_sub(overlap);
            start = if next > start { next } else { end };
        }

        chunks
    }
}

fn with_context(text: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) => format!("[{}]\n{}", ctx, text),
        None => text.to_string(),
    }
}

/// Last natural boundary in the window: sentence end, then newline, then space.
/// A boundary at offset 0 would produce an empty chunk, so it does not count.
fn find_break(window: &[char]) -> Option<usize> {
    let sentence_end = window
        .windows(2)
        .rposition(|pair| pair[0] == '.' && pair[1] == ' ');

    sentence_end
        .filter(|&i| i > 0)
        .or_else(|| window.iter().rposition(|&c| c == '\n').filter(|&i| i > 0))
        .or_else(|| window.iter().rposition(|&c| c == ' ').filter(|&i| i > 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_words(count: usize) -> String {
        (0..count)
            .map(|i| format!("w{:04}", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunker = Chunker::new(ChunkerConfig::new(100, 10));

        assert_eq!(chunker.chunk_text("  short text ", None), vec!["  short text "]);
        assert_eq!(
            chunker.chunk_text("short text", Some("notes.md")),
            vec!["[notes.md]\nshort text"]
        );
    }

    #[test]
    fn test_prefers_sentence_end_over_later_space() {
        let chunker = Chunker::new(ChunkerConfig::new(20, 0));
        let chunks = chunker.chunk_text("Hello world. Second part here and more text", None);

        assert_eq!(chunks[0], "Hello world.");
    }

    #[test]
    fn test_newline_beats_space() {
        let chunker = Chunker::new(ChunkerConfig::new(12, 0));
        let chunks = chunker.chunk_text("abc\ndef ghi jkl mno", None);

        assert_eq!(chunks[0], "abc");
    }

    #[test]
    fn test_hard_cut_without_boundaries() {
        let chunker = Chunker::new(ChunkerConfig::new(500, 50));
        let text = "a".repeat(1200);
        let chunks = chunker.chunk_text(&text, None);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 500);
        assert_eq!(chunks[1].len(), 500);
        assert_eq!(chunks[2].len(), 300);
    }

    #[test]
    fn test_chunks_cover_text_in_order() {
        let text = numbered_words(400);
        let chunker = Chunker::new(ChunkerConfig::new(120, 30));
        let chunks = chunker.chunk_text(&text, None);

        assert!(chunks.len() > 1);
        assert!(text.starts_with(&chunks[0]));
        assert!(text.ends_with(chunks.last().unwrap().as_str()));

        let mut covered_to = 0;
        let mut last_pos = 0;
        for chunk in &chunks {
            assert!(!chunk.is_empty());
            assert!(chunk.chars().count() <= 120);
            let pos = text.find(chunk.as_str()).expect("chunk must be a slice of the text");
            assert!(pos >= last_pos, "chunks must advance");
            // Only whitespace may fall between the covered prefix and this chunk.
            assert!(text[covered_to.min(pos)..pos].trim().is_empty());
            covered_to = covered_to.max(pos + chunk.len());
            last_pos = pos;
        }
        assert_eq!(covered_to, text.len());
    }

    #[test]
    fn test_invalid_overlap_is_clamped_and_terminates() {
        let chunker = Chunker::new(ChunkerConfig::new(10, 10));
        assert_eq!(chunker.config().overlap, 9);

        let chunks = chunker.chunk_text(&"x y ".repeat(50), None);
        assert!(!chunks.is_empty());

        let zero = Chunker::new(ChunkerConfig::new(0, 5));
        assert_eq!(zero.config(), ChunkerConfig::new(1, 0));
        assert_eq!(zero.chunk_text("abc", None), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_context_prefix_on_every_chunk() {
        let chunker = Chunker::new(ChunkerConfig::new(50, 5));
        let chunks = chunker.chunk_text(&numbered_words(40), Some("doc.txt > Intro"));

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.starts_with("[doc.txt > Intro]\n")));
    }

    #[test]
    fn test_blank_windows_are_skipped() {
        let text = format!("{}{}{}", "a".repeat(10), " ".repeat(30), "b".repeat(10));
        let chunker = Chunker::new(ChunkerConfig::new(10, 0));
        let chunks = chunker.chunk_text(&text, Some("ctx"));

        assert_eq!(chunks, vec!["[ctx]\naaaaaaaaaa", "[ctx]\nbbbbbbbbbb"]);
        assert!(chunker.chunk_text("     ", Some("ctx")).is_empty());
    }

    #[test]
    fn test_counts_chars_not_bytes() {
        let chunker = Chunker::new(ChunkerConfig::new(4, 0));
        let chunks = chunker.chunk_text("äöüßéèàç", None);

        assert_eq!(chunks, vec!["äöüß", "éèàç"]);
    }
}
