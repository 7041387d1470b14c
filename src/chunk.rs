//! Paragraph-boundary message chunker.
//!
//! Splits a [`Message`]'s content into [`Chunk`]s that respect a
//! configurable `max_tokens` limit. Splitting occurs on paragraph
//! boundaries (`\n\n`) to preserve semantic coherence within each chunk;
//! oversized paragraphs are hard-split at the last newline or space that
//! fits.
//!
//! Chunk ids are derived from the source message id and a digest of the
//! chunk text (see [`hasher::chunk_id`](crate::hasher::chunk_id)), so the
//! same message always yields the same chunk ids across runs.

use std::collections::HashSet;

use crate::hasher::chunk_id;
use crate::models::{Chunk, Message};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split a message into chunks on paragraph boundaries, respecting
/// `max_tokens`. Returns chunks with contiguous indices starting at 0.
/// Empty or whitespace-only content yields no chunks.
pub fn chunk_message(message: &Message, max_tokens: usize) -> Vec<Chunk> {
    let pieces = split_text(&message.content, max_tokens);

    let mut seen = HashSet::new();
    let mut chunks = Vec::with_capacity(pieces.len());
    for piece in pieces {
        let id = chunk_id(&message.id, &piece);
        // Repeated paragraphs inside one message collapse to one chunk.
        if !seen.insert(id.clone()) {
            continue;
        }
        chunks.push(Chunk {
            id,
            conversation_id: message.conversation_id.clone(),
            source_message_id: message.id.clone(),
            index: chunks.len() as u32,
            text: piece,
            cluster_id: None,
            annotation: None,
            embedding_ref: None,
        });
    }
    chunks
}

/// Split text into trimmed pieces of at most `max_tokens * 4` bytes.
pub fn split_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let text = text.replace("\r\n", "\n");

    let mut pieces = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            hard_split(trimmed, max_chars, &mut pieces);
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    pieces
}

fn hard_split(paragraph: &str, max_chars: usize, pieces: &mut Vec<String>) {
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        let split_at = floor_char_boundary(remaining, max_chars);
        let actual_split = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .map(|pos| pos + 1)
                .filter(|pos| *pos > 0)
                .unwrap_or(split_at)
        } else {
            split_at
        };
        // A single char wider than the limit still has to make progress.
        let actual_split = if actual_split == 0 {
            remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len())
        } else {
            actual_split
        };

        let piece = remaining[..actual_split].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        remaining = &remaining[actual_split..];
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
