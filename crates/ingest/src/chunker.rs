use tracing::warn;

use crate::chunk::{Chunk, SourceMetadata};

/// Sizes are measured in UTF-8 bytes; cuts always land on char boundaries.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub max_size: usize,
    pub overlap: usize,
    /// A break point earlier than this fraction of `max_size` is ignored
    pub min_break_ratio: f64,
}

impl ChunkerConfig {
    fn min_break(&self) -> usize {
        (self.max_size as f64 * self.min_break_ratio.clamp(0.0, 1.0)) as usize
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            overlap: 200,
            min_break_ratio: 0.3,
        }
    }
}

/// Break points, best first.
const BREAK_PATTERNS: &[&str] = &["\n\n", "\n## ", "\n# ", ". ", "! ", "? ", "\n"];

pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    /// An overlap that reaches the shortest possible chunk would stall the split,
    /// so it is cut to half the minimum break distance.
    pub fn new(mut config: ChunkerConfig) -> Self {
        config.max_size = config.max_size.max(1);
        let min_break = config.min_break();
        if config.overlap >= min_break.max(1) {
            let clamped = min_break / 2;
            warn!(
                overlap = config.overlap,
                clamped,
                max_size = config.max_size,
                "Chunk overlap too large for the chunk size, reducing it"
            );
            config.overlap = clamped;
        }
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    pub fn chunk_text(&self, text: &str, source: &str) -> Vec<Chunk> {
        self.split(text)
            .into_iter()
            .enumerate()
            .map(|(chunk_index, (offset, piece))| {
                Chunk::new(
                    piece,
                    SourceMetadata {
                        path: source.to_string(),
                        offset,
                        chunk_index,
                    },
                )
            })
            .collect()
    }

    /// Returns `(byte_offset, trimmed_text)` pairs.
    fn split(&self, text: &str) -> Vec<(usize, String)> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let max_size = self.config.max_size;
        if text.len() <= max_size {
            return vec![(0, text.trim().to_string())];
        }

        let min_break = self.config.min_break();
        let mut pieces = Vec::new();
        let mut start = 0;

        while start < text.len() {
            let mut end = floor_char_boundary(text, start + max_size);

            if end >= text.len() {
                push_trimmed(&mut pieces, start, &text[start..]);
                break;
            }

            if end <= start {
                // A single char wider than max_size
                end = ceil_char_boundary(text, start + 1);
            }

            let window = &text[start..end];
            let best_break = BREAK_PATTERNS
                .iter()
                .filter_map(|pattern| window.rfind(pattern))
                .find(|&bp| bp > min_break);

            if let Some(bp) = best_break {
                end = start + bp + 1;
            }

            push_trimmed(&mut pieces, start, &text[start..end]);

            // Step back by the overlap, but always make progress
            let next = floor_char_boundary(text, end.saturating_sub(self.config.overlap));
            start = next.max(ceil_char_boundary(text, start + 1));
        }

        pieces
    }
}

fn push_trimmed(pieces: &mut Vec<(usize, String)>, offset: usize, piece: &str) {
    let trimmed = piece.trim();
    if !trimmed.is_empty() {
        pieces.push((offset, trimmed.to_string()));
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut i = index;
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut i = index;
    while !text.is_char_boundary(i) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_chunker() -> Chunker {
        Chunker::new(ChunkerConfig {
            max_size: 100,
            overlap: 20,
            min_break_ratio: 0.3,
        })
    }

    #[test]
    fn test_basic_chunking() {
        let chunker = Chunker::new(ChunkerConfig::default());
        let text = "This is a test paragraph.\n\nThis is another paragraph.";
        let chunks = chunker.chunk_text(text, "test.md");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source.path, "test.md");
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_prefers_paragraph_boundaries() {
        let first = "a".repeat(60);
        let second = "b".repeat(80);
        let text = format!("{first}\n\n{second}");

        let chunks = small_chunker().chunk_text(&text, "note.md");

        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].text, first);
        assert!(chunks.iter().all(|c| c.text.len() <= 100));
    }

    #[test]
    fn test_falls_back_to_sentences_then_hard_cut() {
        let sentence = "Word word word word word. ";
        let text = sentence.repeat(12);
        let chunks = small_chunker().chunk_text(&text, "note.md");
        assert!(chunks[0].text.ends_with('.'));

        let solid = "x".repeat(250);
        let chunks = small_chunker().chunk_text(&solid, "note.md");
        assert_eq!(chunks[0].text.len(), 100);
        assert!(chunks.len() >= 3);
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let text = "x".repeat(250);
        let chunks = small_chunker().chunk_text(&text, "note.md");

        assert_eq!(chunks[1].source.offset, 80);
        assert_eq!(chunks[0].source.chunk_index, 0);
        assert_eq!(chunks[1].source.chunk_index, 1);
    }

    #[test]
    fn test_deterministic_and_unicode_safe() {
        let text = "Café ☕ résumé naïve. ".repeat(20);
        let a = small_chunker().chunk_text(&text, "u.md");
        let b = small_chunker().chunk_text(&text, "u.md");

        let ids_a: Vec<_> = a.iter().map(|c| c.id.clone()).collect();
        let ids_b: Vec<_> = b.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_oversized_overlap_still_advances() {
        let chunker = Chunker::new(ChunkerConfig {
            max_size: 100,
            overlap: 90,
            min_break_ratio: 0.3,
        });
        assert_eq!(chunker.config().overlap, 15);

        let text = "Aspirin relieves pain. ".repeat(150);
        let chunks = chunker.chunk_text(&text, "note.md");
        assert!(chunks.len() < text.len() / 15);
        for pair in chunks.windows(2) {
            assert!(pair[1].source.offset >= pair[0].source.offset + 15);
        }

        // Overlap below the break distance is left alone
        assert_eq!(small_chunker().config().overlap, 20);
    }

    #[test]
    fn test_whitespace_only_yields_nothing() {
        assert!(small_chunker().chunk_text("   \n\n  ", "empty.md").is_empty());
    }
}
