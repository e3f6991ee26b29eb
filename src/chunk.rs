//! Recursive character text splitter.
//!
//! Splits extracted PDF text into [`Chunk`]s of at most `chunk_size`
//! characters. The text is cut at the coarsest separator that occurs
//! (paragraph, then line, then word); pieces that are still too long are
//! split again with the next separator, and as a last resort at fixed
//! character offsets. Adjacent chunks share up to `chunk_overlap` characters
//! so that a sentence spanning a boundary is retrievable from either side.
//!
//! Each chunk gets a fresh UUID plus a SHA-256 hash of its text.

use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::models::Chunk;

const SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

/// Split text into chunks of at most `chunk_size` characters.
/// Returns chunks with contiguous indices starting at 0; blank text yields none.
pub fn chunk_text(pdf_id: &str, text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let chunk_overlap = chunk_overlap.min(chunk_size - 1);

    split_text(text, &SEPARATORS, chunk_size, chunk_overlap)
        .into_iter()
        .enumerate()
        .map(|(i, piece)| make_chunk(pdf_id, i as i64, &piece))
        .collect()
}

fn split_text(text: &str, separators: &[&str], size: usize, overlap: usize) -> Vec<String> {
    let Some(pos) = separators.iter().position(|s| text.contains(s)) else {
        return hard_split(text, size, overlap);
    };
    let sep = separators[pos];
    let finer = &separators[pos + 1..];

    let mut out = Vec::new();
    let mut fitting: Vec<&str> = Vec::new();

    for piece in text.split(sep).filter(|p| !p.trim().is_empty()) {
        if char_len(piece) <= size {
            fitting.push(piece);
            continue;
        }
        if !fitting.is_empty() {
            out.extend(merge_pieces(&fitting, sep, size, overlap));
            fitting.clear();
        }
        out.extend(split_text(piece, finer, size, overlap));
    }

    if !fitting.is_empty() {
        out.extend(merge_pieces(&fitting, sep, size, overlap));
    }
    out
}

/// Greedily packs pieces into chunks, carrying a tail of up to `overlap`
/// characters into the next chunk.
fn merge_pieces(pieces: &[&str], sep: &str, size: usize, overlap: usize) -> Vec<String> {
    let sep_len = char_len(sep);
    let mut docs = Vec::new();
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for &piece in pieces {
        let len = char_len(piece);
        let joined = if window.is_empty() { 0 } else { sep_len };

        if total + joined + len > size && !window.is_empty() {
            push_joined(&mut docs, &window, sep);
            while !window.is_empty() && (total > overlap || total + sep_len + len > size) {
                if let Some(first) = window.pop_front() {
                    total -= char_len(first);
                    if !window.is_empty() {
                        total -= sep_len;
                    }
                }
            }
        }

        if !window.is_empty() {
            total += sep_len;
        }
        total += len;
        window.push_back(piece);
    }

    push_joined(&mut docs, &window, sep);
    docs
}

fn push_joined(docs: &mut Vec<String>, window: &VecDeque<&str>, sep: &str) {
    let joined = window.iter().copied().collect::<Vec<_>>().join(sep);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}

/// Fixed-width split on character boundaries for text with no separators.
fn hard_split(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let step = size - overlap;
    let mut out = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        if !piece.trim().is_empty() {
            out.push(piece.trim().to_string());
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    out
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn make_chunk(pdf_id: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        pdf_id: pdf_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
