//! Byte-pair encoding strategies.
//!
//! - **v1**: SentencePiece style. Spaces become `▁`, symbols start as single
//!   chars, merges follow the rank table (or vocabulary scores when the
//!   vocabulary ships without merges), and unmapped symbols fall back to
//!   `<0xXX>` byte tokens.
//! - **v2**: GPT-2 byte level. Text is pre-split into words, every byte is a
//!   symbol (through the printable byte alphabet) and merges follow ranks.
//! - **v3**: byte level with a digit-grouping pre-split. Symbols start as whole
//!   UTF-8 scalars when the vocabulary knows them, and unmapped symbols fall
//!   back to their individual bytes.

use std::collections::HashMap;
use std::sync::OnceLock;

use tracing::debug;

use super::vocab::Vocab;

/// SentencePiece space marker.
pub const SPACE_MARKER: char = '\u{2581}';

/// Printable stand-in for each byte in byte-level vocabularies.
pub fn byte_to_unicode() -> &'static [char; 256] {
    static TABLE: OnceLock<[char; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let printable = |b: u8| matches!(b, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF);
        let mut table = ['\0'; 256];
        let mut next = 256u32;
        for b in 0..=255u8 {
            table[b as usize] = if printable(b) {
                char::from(b)
            } else {
                let c = char::from_u32(next).unwrap_or('\u{FFFD}');
                next += 1;
                c
            };
        }
        table
    })
}

/// Inverse of [`byte_to_unicode`].
pub fn unicode_to_byte(c: char) -> Option<u8> {
    static TABLE: OnceLock<HashMap<char, u8>> = OnceLock::new();
    TABLE
        .get_or_init(|| {
            byte_to_unicode()
                .iter()
                .enumerate()
                .map(|(b, &c)| (c, b as u8))
                .collect()
        })
        .get(&c)
        .copied()
}

fn map_bytes(s: &str) -> String {
    let table = byte_to_unicode();
    s.bytes().map(|b| table[b as usize]).collect()
}

/// Merges adjacent symbols until no pair has a rank, lowest rank first.
///
/// Ties go to the leftmost pair. `on_merge` sees every merge in order.
pub fn apply_merges<F>(vocab: &Vocab, symbols: &mut Vec<String>, mut on_merge: F)
where
    F: FnMut(&str, &str),
{
    loop {
        let best = symbols
            .windows(2)
            .enumerate()
            .filter_map(|(i, pair)| vocab.find_bpe_rank(&pair[0], &pair[1]).map(|r| (r, i)))
            .min();
        let Some((_, i)) = best else {
            break;
        };
        let right = symbols.remove(i + 1);
        on_merge(&symbols[i], &right);
        symbols[i].push_str(&right);
    }
}

/// Merges the adjacent pair whose concatenation has the highest vocabulary
/// score until no concatenation is in the vocabulary.
fn apply_score_merges(vocab: &Vocab, symbols: &mut Vec<String>) {
    loop {
        let mut best: Option<(f32, usize)> = None;
        for (i, pair) in symbols.windows(2).enumerate() {
            let merged = format!("{}{}", pair[0], pair[1]);
            let Some(score) = vocab
                .piece_to_id(&merged)
                .and_then(|id| vocab.get(id))
                .map(|t| t.score)
            else {
                continue;
            };
            if best.map_or(true, |(s, _)| score > s) {
                best = Some((score, i));
            }
        }
        let Some((_, i)) = best else {
            break;
        };
        let right = symbols.remove(i + 1);
        symbols[i].push_str(&right);
    }
}

/// SentencePiece-style BPE.
pub(crate) fn encode_v1(vocab: &Vocab, text: &str, unk: u32, ids: &mut Vec<u32>) {
    let text = text.replace(' ', &SPACE_MARKER.to_string());
    let mut symbols: Vec<String> = text.chars().map(String::from).collect();

    if vocab.has_merges() {
        apply_merges(vocab, &mut symbols, |_, _| {});
    } else {
        apply_score_merges(vocab, &mut symbols);
    }

    for symbol in &symbols {
        if let Some(id) = vocab.piece_to_id(symbol) {
            ids.push(id);
            continue;
        }
        let byte_ids: Option<Vec<u32>> = symbol
            .bytes()
            .map(|b| vocab.piece_to_id(&format!("<0x{b:02X}>")))
            .collect();
        match byte_ids {
            Some(byte_ids) => ids.extend(byte_ids),
            None => {
                debug!(symbol = %symbol, "no byte fallback, using unknown id");
                ids.push(unk);
            }
        }
    }
}

/// GPT-2 byte-level BPE.
pub(crate) fn encode_v2(vocab: &Vocab, text: &str, unk: u32, ids: &mut Vec<u32>) {
    for word in pretokenize_gpt2(text) {
        let mut symbols: Vec<String> = map_bytes(word).chars().map(String::from).collect();
        apply_merges(vocab, &mut symbols, |_, _| {});
        for symbol in &symbols {
            match vocab.piece_to_id(symbol) {
                Some(id) => ids.push(id),
                None => {
                    debug!(symbol = %symbol, "unmapped symbol, using unknown id");
                    ids.push(unk);
                }
            }
        }
    }
}

/// Byte-level BPE with scalar-grouped symbols and per-byte fallback.
pub(crate) fn encode_v3(vocab: &Vocab, text: &str, unk: u32, ids: &mut Vec<u32>) {
    for word in pretokenize_digits(text) {
        let mut symbols = Vec::new();
        for c in word.chars() {
            let mut buf = [0u8; 4];
            let mapped = map_bytes(c.encode_utf8(&mut buf));
            if c.len_utf8() == 1 || vocab.piece_to_id(&mapped).is_some() {
                symbols.push(mapped);
            } else {
                symbols.extend(mapped.chars().map(String::from));
            }
        }
        apply_merges(vocab, &mut symbols, |_, _| {});
        for symbol in &symbols {
            if let Some(id) = vocab.piece_to_id(symbol) {
                ids.push(id);
                continue;
            }
            for c in symbol.chars() {
                match vocab.piece_to_id(c.encode_utf8(&mut [0u8; 4])) {
                    Some(id) => ids.push(id),
                    None => {
                        debug!(symbol = %symbol, "unmapped byte, using unknown id");
                        ids.push(unk);
                    }
                }
            }
        }
    }
}

/// Bytes of a byte-level piece.
pub(crate) fn decode_byte_level(piece: &str, out: &mut Vec<u8>) {
    for c in piece.chars() {
        match unicode_to_byte(c) {
            Some(b) => out.push(b),
            None => out.extend_from_slice(c.encode_utf8(&mut [0u8; 4]).as_bytes()),
        }
    }
}

/// Parses a `<0xXX>` byte piece.
pub(crate) fn parse_byte_piece(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

fn is_letter(c: char) -> bool {
    c.is_alphabetic()
}

fn is_number(c: char) -> bool {
    c.is_numeric()
}

fn is_other(c: char) -> bool {
    !c.is_whitespace() && !is_letter(c) && !is_number(c)
}

const CONTRACTIONS: [&str; 7] = ["'s", "'t", "'re", "'ve", "'m", "'ll", "'d"];

fn contraction_len(rest: &str, ignore_case: bool) -> Option<usize> {
    CONTRACTIONS.iter().find_map(|c| {
        let head = rest.get(..c.len())?;
        let hit = if ignore_case {
            head.eq_ignore_ascii_case(c)
        } else {
            head == *c
        };
        hit.then_some(c.len())
    })
}

/// End (byte index) of a whitespace run starting at `start`.
///
/// When the run is longer than one char and more text follows, its last
/// char is left for the next word.
fn whitespace_end(chars: &[(usize, char)], start: usize, text_len: usize) -> usize {
    let mut k = start;
    while k < chars.len() && chars[k].1.is_whitespace() {
        k += 1;
    }
    if k < chars.len() && k - start > 1 {
        k -= 1;
    }
    chars.get(k).map_or(text_len, |&(b, _)| b)
}

/// Consumes chars matching `pred` from `k`, at most `limit`.
fn run_end<P: Fn(char) -> bool>(chars: &[(usize, char)], mut k: usize, limit: usize, pred: P) -> usize {
    let start = k;
    while k < chars.len() && k - start < limit && pred(chars[k].1) {
        k += 1;
    }
    k
}

fn char_index_at(chars: &[(usize, char)], byte: usize) -> usize {
    chars.partition_point(|&(b, _)| b < byte)
}

/// GPT-2 word split: contractions, ` ?letters`, ` ?numbers`, ` ?other`, whitespace.
pub fn pretokenize_gpt2(text: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let byte_at = |k: usize| chars.get(k).map_or(text.len(), |&(b, _)| b);
    let mut words = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let start = chars[i].0;
        let c = chars[i].1;

        if let Some(len) = contraction_len(&text[start..], false) {
            words.push(&text[start..start + len]);
            i = char_index_at(&chars, start + len);
            continue;
        }

        let mut j = i;
        if c == ' ' && chars.get(i + 1).is_some_and(|&(_, n)| !n.is_whitespace()) {
            j += 1;
        }
        let d = chars[j].1;
        let end = if is_letter(d) {
            run_end(&chars, j, usize::MAX, is_letter)
        } else if is_number(d) {
            run_end(&chars, j, usize::MAX, is_number)
        } else if is_other(d) {
            run_end(&chars, j, usize::MAX, is_other)
        } else {
            let end_byte = whitespace_end(&chars, i, text.len());
            words.push(&text[start..end_byte]);
            i = char_index_at(&chars, end_byte);
            continue;
        };
        words.push(&text[start..byte_at(end)]);
        i = end;
    }
    words
}

/// Digit-grouping word split: contractions (any case), one optional
/// non-letter prefix before letters, numbers in groups of up to three,
/// ` ?other` with trailing newlines, newline runs, whitespace.
pub fn pretokenize_digits(text: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let byte_at = |k: usize| chars.get(k).map_or(text.len(), |&(b, _)| b);
    let is_newline = |c: char| c == '\r' || c == '\n';
    let mut words = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let start = chars[i].0;
        let c = chars[i].1;
        let next = chars.get(i + 1).map(|&(_, n)| n);

        if let Some(len) = contraction_len(&text[start..], true) {
            words.push(&text[start..start + len]);
            i = char_index_at(&chars, start + len);
            continue;
        }

        let end = if is_letter(c) {
            run_end(&chars, i, usize::MAX, is_letter)
        } else if !is_newline(c) && !is_number(c) && next.is_some_and(is_letter) {
            run_end(&chars, i + 1, usize::MAX, is_letter)
        } else if is_number(c) {
            run_end(&chars, i, 3, is_number)
        } else if is_other(c) || (c == ' ' && next.is_some_and(is_other)) {
            let first = if c == ' ' { i + 1 } else { i };
            let k = run_end(&chars, first, usize::MAX, is_other);
            run_end(&chars, k, usize::MAX, is_newline)
        } else {
            let mut k = i;
            let mut last_newline = None;
            while k < chars.len() && chars[k].1.is_whitespace() {
                if is_newline(chars[k].1) {
                    last_newline = Some(k);
                }
                k += 1;
            }
            match last_newline {
                Some(n) => n + 1,
                None => {
                    let end_byte = whitespace_end(&chars, i, text.len());
                    char_index_at(&chars, end_byte)
                }
            }
        };
        words.push(&text[start..byte_at(end)]);
        i = end;
    }
    words
}
