//! Recursive, token-bounded text splitter.
//!
//! Splits a markdown document into overlapping [`TextChunk`]s whose length,
//! as measured by a [`TokenCounter`], stays within `chunk_size`.
//!
//! # Algorithm
//!
//! 1. Pick the coarsest separator (e.g. `"\n\n"`) that occurs in the text.
//! 2. Split on it, keeping each separator at the start of the piece that
//!    follows it, so pieces are exact, contiguous slices of the source.
//! 3. Pieces shorter than `chunk_size` are merged left to right; whenever
//!    the next piece would push the merged span over `chunk_size`, the span
//!    is emitted and trailing pieces worth at most `chunk_overlap` tokens
//!    are carried into the next chunk.
//! 4. Oversized pieces are split again with the next (finer) separator. A
//!    piece that no remaining separator can break is emitted as-is.
//!
//! Every chunk records the byte span it covers in the source, so stitching
//! spans while skipping the overlap reproduces the input exactly.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::models::LineRange;

/// Approximate chars-per-token ratio used when no tokenizer is configured.
const CHARS_PER_TOKEN: usize = 4;

/// Maps text to its length in model tokens.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Estimates tokens as `ceil(chars / 4)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxTokenCounter;

impl TokenCounter for ApproxTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }
}

/// Counts tokens with a Hugging Face `tokenizer.json`.
#[cfg(feature = "hf-tokenizer")]
pub struct HfTokenCounter {
    tokenizer: tokenizers::Tokenizer,
}

#[cfg(feature = "hf-tokenizer")]
impl HfTokenCounter {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            anyhow::anyhow!("Failed to load tokenizer {}: {}", path.display(), e)
        })?;
        Ok(Self { tokenizer })
    }
}

#[cfg(feature = "hf-tokenizer")]
impl TokenCounter for HfTokenCounter {
    fn count(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.len(),
            Err(_) => ApproxTokenCounter.count(text),
        }
    }
}

/// Splitter settings. Lengths are in token units of the configured counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitterConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Preferred split boundaries, coarsest first. `""` splits between characters.
    pub separators: Vec<String>,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 128,
            separators: default_separators(),
        }
    }
}

pub fn default_separators() -> Vec<String> {
    ["\n\n", "\n", " ", ".", ","]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl SplitterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be > 0");
        }
        if self.chunk_overlap >= self.chunk_size {
            bail!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap,
                self.chunk_size
            );
        }
        if self.separators.is_empty() {
            bail!("at least one separator is required");
        }
        Ok(())
    }
}

/// A chunk of source text with its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk {
    /// Chunk content with surrounding whitespace trimmed.
    pub text: String,
    /// Byte range of the source covered by this chunk, untrimmed.
    #[serde(skip)]
    pub span: Range<usize>,
    /// Lines of the source that `text` occupies.
    pub lines: LineRange,
}

/// Recursive splitter bound to a token counter.
#[derive(Clone)]
pub struct RecursiveSplitter {
    config: SplitterConfig,
    counter: Arc<dyn TokenCounter>,
}

impl RecursiveSplitter {
    pub fn new(config: SplitterConfig, counter: Arc<dyn TokenCounter>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, counter })
    }

    pub fn config(&self) -> &SplitterConfig {
        &self.config
    }

    /// Split `text` into chunks in document order. Blank input yields none.
    ///
    /// Spans holding only whitespace produce no chunk, so the chunks cover
    /// the source up to those gaps. Use [`spans`](Self::spans) for the
    /// complete positional split.
    pub fn split(&self, text: &str) -> Vec<TextChunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        self.spans(text)
            .into_iter()
            .filter_map(|span| make_chunk(text, span))
            .collect()
    }

    /// Every byte range the split produces, in order, including ranges that
    /// are only whitespace. Consecutive ranges overlap or touch, and together
    /// they cover `text` exactly.
    pub fn spans(&self, text: &str) -> Vec<Range<usize>> {
        let mut spans = Vec::new();
        if !text.is_empty() {
            self.split_span(text, 0..text.len(), &self.config.separators, &mut spans);
        }
        spans
    }

    fn measure(&self, source: &str, span: &Range<usize>) -> usize {
        self.counter.count(&source[span.clone()])
    }

    fn split_span(
        &self,
        source: &str,
        span: Range<usize>,
        separators: &[String],
        out: &mut Vec<Range<usize>>,
    ) {
        let slice = &source[span.clone()];

        let (separator, finer) = match separators
            .iter()
            .position(|s| s.is_empty() || slice.contains(s.as_str()))
        {
            Some(i) if separators[i].is_empty() => ("", &separators[..0]),
            Some(i) => (separators[i].as_str(), &separators[i + 1..]),
            None => match separators.last() {
                Some(last) => (last.as_str(), &separators[..0]),
                None => {
                    out.push(span);
                    return;
                }
            },
        };

        let mut good: Vec<Range<usize>> = Vec::new();
        for piece in split_keeping_separator(span.start, slice, separator) {
            if self.measure(source, &piece) < self.config.chunk_size {
                good.push(piece);
                continue;
            }
            if !good.is_empty() {
                self.merge(source, &good, out);
                good.clear();
            }
            if finer.is_empty() {
                // Atomic unit: nothing left to split on.
                out.push(piece);
            } else {
                self.split_span(source, piece, finer, out);
            }
        }
        if !good.is_empty() {
            self.merge(source, &good, out);
        }
    }

    /// Merge contiguous pieces into spans of at most `chunk_size`, carrying
    /// up to `chunk_overlap` trailing tokens into each following span.
    fn merge(&self, source: &str, pieces: &[Range<usize>], out: &mut Vec<Range<usize>>) {
        let size = self.config.chunk_size;
        let overlap = self.config.chunk_overlap;
        let mut window: VecDeque<Range<usize>> = VecDeque::new();

        for piece in pieces {
            if let (Some(front), Some(back)) = (window.front(), window.back()) {
                if self.measure(source, &(front.start..piece.end)) > size {
                    let tail_end = back.end;
                    out.push(front.start..tail_end);

                    while let Some(front) = window.front() {
                        let kept = self.measure(source, &(front.start..tail_end));
                        let with_next = self.measure(source, &(front.start..piece.end));
                        if kept > overlap || with_next > size {
                            window.pop_front();
                        } else {
                            break;
                        }
                    }
                }
            }
            window.push_back(piece.clone());
        }

        if let (Some(front), Some(back)) = (window.front(), window.back()) {
            out.push(front.start..back.end);
        }
    }
}

/// Split `slice` (located at `offset` in the source) before every occurrence
/// of `separator`. Pieces are returned as absolute byte ranges.
fn split_keeping_separator(offset: usize, slice: &str, separator: &str) -> Vec<Range<usize>> {
    if separator.is_empty() {
        return slice
            .char_indices()
            .map(|(i, c)| offset + i..offset + i + c.len_utf8())
            .collect();
    }

    let mut pieces = Vec::new();
    let mut piece_start = 0;
    for (idx, _) in slice.match_indices(separator) {
        if idx > piece_start {
            pieces.push(offset + piece_start..offset + idx);
        }
        piece_start = idx;
    }
    if piece_start < slice.len() {
        pieces.push(offset + piece_start..offset + slice.len());
    }
    pieces
}

fn make_chunk(source: &str, span: Range<usize>) -> Option<TextChunk> {
    let raw = &source[span.clone()];
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    let text_start = span.start + (raw.len() - raw.trim_start().len());
    let from = 1 + source[..text_start].matches('\n').count();
    let to = from + text.matches('\n').count();

    Some(TextChunk {
        text: text.to_string(),
        span,
        lines: LineRange { from, to },
    })
}
