//! Paragraph-aware chunking for document ingestion. Paragraphs pack into
//! chunks up to the target size; an oversized paragraph splits into fixed
//! windows that overlap by `overlap_size` characters.

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    /// Position of the chunk within the document, 0-based.
    pub index: usize,
    /// SHA-256 of the chunk text, hex.
    pub hash: String,
}

pub struct ChunkerConfig {
    /// Target chunk size in characters.
    pub target_size: usize,
    /// Overlap carried between windows of an oversized paragraph.
    pub overlap_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_size: 1000,
            overlap_size: 100,
        }
    }
}

pub fn chunk_text(content: &str, config: &ChunkerConfig) -> Vec<TextChunk> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let target_size = config.target_size.max(1);
    let overlap_size = config.overlap_size.min(target_size.saturating_sub(1));

    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();
    for paragraph in trimmed.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if paragraph.chars().count() > target_size {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            pieces.extend(split_windows(paragraph, target_size, overlap_size));
            continue;
        }
        let candidate_len = current.chars().count() + paragraph.chars().count() + 2;
        if !current.is_empty() && candidate_len > target_size {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| TextChunk {
            hash: compute_hash(&text),
            text,
            index,
        })
        .collect()
}

fn split_windows(paragraph: &str, target_size: usize, overlap_size: usize) -> Vec<String> {
    let chars: Vec<char> = paragraph.chars().collect();
    let stride = target_size - overlap_size;
    let mut windows = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + target_size).min(chars.len());
        windows.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += stride;
    }
    windows
}

fn compute_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", &ChunkerConfig::default()).is_empty());
        assert!(chunk_text("   \n\n  ", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn short_document_is_one_chunk() {
        let chunks = chunk_text("The sky is blue.", &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "The sky is blue.");
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn paragraphs_pack_until_target() {
        let config = ChunkerConfig {
            target_size: 40,
            overlap_size: 5,
        };
        let content = "first paragraph here\n\nsecond one\n\nthird paragraph that is longer";
        let chunks = chunk_text(content, &config);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].text.contains("first paragraph"));
        // every chunk respects the target
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= config.target_size);
        }
    }

    #[test]
    fn oversized_paragraph_splits_with_overlap() {
        let config = ChunkerConfig {
            target_size: 50,
            overlap_size: 10,
        };
        let long: String = "abcdefghij".repeat(12); // 120 chars, no paragraph breaks
        let chunks = chunk_text(&long, &config);
        assert!(chunks.len() >= 3);
        // consecutive windows share the overlap
        let first = &chunks[0].text;
        let second = &chunks[1].text;
        let tail: String = first.chars().skip(first.chars().count() - 10).collect();
        assert!(second.starts_with(&tail));
    }

    #[test]
    fn chunk_hashes_are_content_addressed() {
        let chunks_a = chunk_text("same content", &ChunkerConfig::default());
        let chunks_b = chunk_text("same content", &ChunkerConfig::default());
        assert_eq!(chunks_a[0].hash, chunks_b[0].hash);

        let chunks_c = chunk_text("other content", &ChunkerConfig::default());
        assert_ne!(chunks_a[0].hash, chunks_c[0].hash);
    }

    #[test]
    fn indices_are_sequential() {
        let config = ChunkerConfig {
            target_size: 10,
            overlap_size: 2,
        };
        let chunks = chunk_text(&"word ".repeat(20), &config);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }
}
