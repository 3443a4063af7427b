//! Splits source text into overlapping chunks for embedding and search.
//! Sentence mode keeps sentences whole; fixed-width mode slides a window and prefers
//! punctuation, then whitespace, as the cut point.
//!
//! All sizes are counted in chars, never bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Metadata;

/// Default maximum characters per chunk. Keeps chunks small enough for embedding models.
pub const DEFAULT_CHUNK_SIZE: usize = 512;
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;
pub const DEFAULT_MIN_CHUNK_SIZE: usize = 50;

/// How far back from the window end a sentence terminator may be found.
const SENTENCE_BREAK_WINDOW: usize = 100;
/// How far back from the window end whitespace may be found.
const WORD_BREAK_WINDOW: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target maximum characters per chunk.
    pub chunk_size: usize,
    /// Characters of trailing context carried into the next chunk.
    pub chunk_overlap: usize,
    /// Keep sentences whole instead of cutting at a fixed width.
    pub preserve_sentences: bool,
    /// Trimmed chunks shorter than this are dropped.
    pub min_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            preserve_sentences: true,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), ChunkingError> {
        if self.chunk_size == 0 {
            return Err(ChunkingError::ZeroChunkSize);
        }
        Ok(())
    }
}

/// A chunk of source text with its position in the chunk sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    /// Index of this chunk within the sequence (0, 1, 2, …).
    pub index: usize,
    pub total: usize,
    /// Characters shared with the previous chunk (0 for the first).
    pub overlap: usize,
    /// Caller-supplied metadata describing the source.
    pub context: Metadata,
}

impl Chunk {
    /// Length in chars.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Per-chunk metadata merged with the caller's context. Context keys win on conflict.
    pub fn metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("chunk_id".into(), Value::from(self.index));
        meta.insert("chunk_size".into(), Value::from(self.len()));
        meta.insert("total_chunks".into(), Value::from(self.total));
        meta.insert("overlap_size".into(), Value::from(self.overlap));
        meta.extend(self.context.clone());
        meta
    }
}

/// Output of one chunking run: the chunks plus the settings that produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkSet {
    pub chunks: Vec<Chunk>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub preserve_sentences: bool,
}

impl ChunkSet {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn texts(&self) -> Vec<String> {
        self.chunks.iter().map(|c| c.text.clone()).collect()
    }

    /// Aggregate metadata for downstream stages, including each chunk's metadata
    /// under `chunk_metadata`.
    pub fn metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("chunk_count".into(), Value::from(self.chunks.len()));
        meta.insert("chunk_size".into(), Value::from(self.chunk_size));
        meta.insert("chunk_overlap".into(), Value::from(self.chunk_overlap));
        meta.insert("preserve_sentences".into(), Value::from(self.preserve_sentences));
        meta.insert(
            "chunk_metadata".into(),
            Value::Array(self.chunks.iter().map(|c| Value::Object(c.metadata())).collect()),
        );
        meta
    }
}

/// Splits text into chunks according to a [`ChunkingConfig`].
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, ChunkingError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk `text`, attaching `context` to every chunk. Blank input gives an empty set.
    pub fn process(&self, text: &str, context: &Metadata) -> ChunkSet {
        let pieces = if text.trim().is_empty() {
            Vec::new()
        } else if self.config.preserve_sentences {
            self.split_by_sentences(text)
        } else {
            self.split_by_width(text)
        };

        let total = pieces.len();
        let chunks = pieces
            .into_iter()
            .enumerate()
            .map(|(index, piece)| Chunk {
                text: piece.text,
                index,
                total,
                overlap: if index == 0 { 0 } else { piece.overlap },
                context: context.clone(),
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            chunks = chunks.len(),
            chunk_size = self.config.chunk_size,
            preserve_sentences = self.config.preserve_sentences,
            "chunked text"
        );

        ChunkSet {
            chunks,
            chunk_size: self.config.chunk_size,
            chunk_overlap: self.config.chunk_overlap,
            preserve_sentences: self.config.preserve_sentences,
        }
    }

    fn split_by_sentences(&self, text: &str) -> Vec<Piece> {
        let ChunkingConfig {
            chunk_size,
            chunk_overlap,
            min_chunk_size,
            ..
        } = self.config;

        let mut pieces = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;
        let mut current_overlap = 0usize;

        for sentence in split_sentences(text.trim()) {
            let sentence_len = sentence.chars().count();
            if !current.is_empty() && current_len + sentence_len + 1 > chunk_size {
                let trimmed = current.trim();
                if trimmed.chars().count() >= min_chunk_size {
                    pieces.push(Piece {
                        text: trimmed.to_string(),
                        overlap: current_overlap,
                    });
                }

                let seed = if chunk_overlap > 0 && !pieces.is_empty() {
                    overlap_tail(&current, chunk_overlap)
                } else {
                    ""
                };
                if seed.is_empty() {
                    current = sentence.to_string();
                    current_overlap = 0;
                } else {
                    current_overlap = seed.chars().count();
                    current = format!("{seed} {sentence}");
                }
                current_len = current.chars().count();
            } else {
                if !current.is_empty() {
                    current.push(' ');
                    current_len += 1;
                }
                current.push_str(sentence);
                current_len += sentence_len;
            }
        }

        // The final buffer is kept below the minimum when it is all there is.
        let tail = current.trim();
        if !tail.is_empty() && (tail.chars().count() >= min_chunk_size || pieces.is_empty()) {
            pieces.push(Piece {
                text: tail.to_string(),
                overlap: current_overlap,
            });
        }
        pieces
    }

    fn split_by_width(&self, text: &str) -> Vec<Piece> {
        let ChunkingConfig {
            chunk_size,
            chunk_overlap,
            min_chunk_size,
            ..
        } = self.config;

        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= chunk_size {
            return vec![Piece {
                text: text.trim().to_string(),
                overlap: 0,
            }];
        }

        let mut pieces = Vec::new();
        let mut short_candidate = None;
        let mut start = 0usize;
        let mut prev_end: Option<usize> = None;

        while start < chars.len() {
            let end = (start + chunk_size).min(chars.len());
            let cut = if end == chars.len() {
                end
            } else {
                start + find_break_point(&chars[start..end]).unwrap_or(end - start)
            };

            let raw: String = chars[start..cut].iter().collect();
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                let piece = Piece {
                    text: trimmed.to_string(),
                    overlap: prev_end.map_or(0, |p| p.saturating_sub(start)),
                };
                if trimmed.chars().count() >= min_chunk_size {
                    pieces.push(piece);
                } else {
                    short_candidate = Some(piece);
                }
            }

            if cut >= chars.len() {
                break;
            }
            prev_end = Some(cut);
            start = cut.saturating_sub(chunk_overlap).max(start + 1);
        }

        if pieces.is_empty() {
            pieces.extend(short_candidate);
        }
        pieces
    }
}

struct Piece {
    text: String,
    overlap: usize,
}

/// Splits at `.`, `!` or `?` followed by whitespace. Punctuation stays with its
/// sentence; the whitespace run between sentences is dropped.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut prev = None;
    let mut iter = text.char_indices().peekable();

    while let Some((i, c)) = iter.next() {
        if c.is_whitespace() && matches!(prev, Some('.' | '!' | '?')) {
            sentences.push(&text[start..i]);
            let mut next = text.len();
            while let Some(&(j, w)) = iter.peek() {
                if !w.is_whitespace() {
                    next = j;
                    break;
                }
                iter.next();
            }
            start = next;
            prev = None;
            continue;
        }
        prev = Some(c);
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

/// Last `overlap` chars of `text`, advanced past the first space so the seed starts
/// on a word.
fn overlap_tail(text: &str, overlap: usize) -> &str {
    let len = text.chars().count();
    if len <= overlap {
        return text.trim();
    }
    let cut = text
        .char_indices()
        .nth(len - overlap)
        .map_or(text.len(), |(i, _)| i);
    let tail = &text[cut..];
    match tail.find(' ') {
        Some(pos) if pos > 0 => tail[pos + 1..].trim(),
        _ => tail.trim(),
    }
}

/// Cut offset inside `window`: just after the last sentence terminator in the final
/// 100 chars, else at the last whitespace in the final 50, else `None`.
fn find_break_point(window: &[char]) -> Option<usize> {
    let len = window.len();
    let sentence_floor = len.saturating_sub(SENTENCE_BREAK_WINDOW);
    if let Some(i) = (sentence_floor + 1..len)
        .rev()
        .find(|&i| matches!(window[i], '.' | '!' | '?'))
    {
        return Some(i + 1);
    }
    let word_floor = len.saturating_sub(WORD_BREAK_WINDOW);
    (word_floor + 1..len).rev().find(|&i| window[i].is_whitespace())
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkingError {
    #[error("chunk_size must be greater than zero")]
    ZeroChunkSize,
}
