//! Unigram segmentation: the split maximizing the total piece score.
//!
//! The lattice is solved backwards: `best[i]` is the best score of the
//! suffix starting at char `i`, considering pieces no longer than the
//! longest vocabulary entry. At each position longer pieces are tried
//! first and only a strictly better score replaces them, so among equal
//! scores the segmentation whose leftmost differing piece is longest wins.

use tracing::debug;

use super::bpe::SPACE_MARKER;
use super::vocab::{TokenType, Vocab};

/// Score given to a char no piece covers.
const UNKNOWN_PENALTY: f32 = 10.0;

fn matchable(kind: TokenType) -> bool {
    matches!(
        kind,
        TokenType::Normal | TokenType::UserDefined | TokenType::Undefined
    )
}

/// Segments `text` into ids; uncovered chars become `unk` (runs collapse to one).
pub(crate) fn encode(vocab: &Vocab, text: &str, unk: u32, ids: &mut Vec<u32>) {
    let text = text.replace(' ', &SPACE_MARKER.to_string());
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let n = chars.len();
    if n == 0 {
        return;
    }
    let byte_at = |k: usize| chars.get(k).map_or(text.len(), |&(b, _)| b);

    let min_score = vocab
        .tokens()
        .iter()
        .filter(|t| matchable(t.kind))
        .map(|t| t.score)
        .fold(0.0f32, f32::min);
    let unknown_score = min_score - UNKNOWN_PENALTY;
    let max_len = vocab.max_piece_chars().max(1);

    // (score of suffix, piece length in chars, id or None for unknown)
    let mut best: Vec<(f32, usize, Option<u32>)> = vec![(f32::NEG_INFINITY, 0, None); n + 1];
    best[n] = (0.0, 0, None);

    for i in (0..n).rev() {
        for len in (1..=max_len.min(n - i)).rev() {
            let piece = &text[byte_at(i)..byte_at(i + len)];
            let Some(id) = vocab.piece_to_id(piece) else {
                continue;
            };
            let Some(token) = vocab.get(id) else {
                continue;
            };
            if !matchable(token.kind) {
                continue;
            }
            let score = token.score + best[i + len].0;
            if score > best[i].0 {
                best[i] = (score, len, Some(id));
            }
        }
        if best[i].1 == 0 {
            best[i] = (unknown_score + best[i + 1].0, 1, None);
        }
    }

    let mut i = 0;
    let mut prev_unknown = false;
    while i < n {
        let (_, len, id) = best[i];
        match id {
            Some(id) => {
                ids.push(id);
                prev_unknown = false;
            }
            None => {
                if !prev_unknown {
                    debug!(ch = %chars[i].1, "no unigram piece, using unknown id");
                    ids.push(unk);
                }
                prev_unknown = true;
            }
        }
        i += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::vocab::TokenScore;

    fn scored(list: &[(&str, f32)]) -> Vocab {
        let mut tokens = vec![TokenScore::new("<unk>", 0.0, TokenType::Unknown)];
        tokens.extend(
            list.iter()
                .map(|&(p, s)| TokenScore::new(p, s, TokenType::Normal)),
        );
        Vocab::new(tokens)
    }

    fn run(vocab: &Vocab, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        encode(vocab, text, 0, &mut ids);
        ids
    }

    #[test]
    fn test_whole_word_wins() {
        let vocab = scored(&[("h", 1.0), ("e", 1.0), ("l", 1.0), ("o", 1.0), ("hello", 5.0)]);
        assert_eq!(run(&vocab, "hello"), vec![5]);
    }

    #[test]
    fn test_higher_total_wins() {
        let vocab = scored(&[("ab", -5.0), ("a", -1.0), ("b", -1.0)]);
        assert_eq!(run(&vocab, "ab"), vec![2, 3]);
    }

    #[test]
    fn test_tie_prefers_longest_leftmost() {
        // "abc" as "ab"+"c" or "a"+"bc": both total -2.
        let vocab = scored(&[("ab", -1.0), ("c", -1.0), ("a", -1.0), ("bc", -1.0)]);
        assert_eq!(run(&vocab, "abc"), vec![1, 2]);
    }

    #[test]
    fn test_unknown_runs_collapse() {
        let vocab = scored(&[("a", -1.0)]);
        assert_eq!(run(&vocab, "a??a"), vec![1, 0, 1]);
    }

    #[test]
    fn test_spaces_use_marker() {
        let vocab = scored(&[("\u{2581}hi", -1.0), ("\u{2581}", -2.0), ("h", -2.0), ("i", -2.0)]);
        assert_eq!(run(&vocab, " hi"), vec![1]);
    }
}
