//! String <-> id processor over one of the segmentation strategies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::bpe::{self, SPACE_MARKER};
use super::preprocess::{self, Preprocessor};
use super::unigram;
use super::vocab::{TokenType, Vocab};
use crate::error::{Error, Result};

/// Segmentation strategy of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// SentencePiece-style BPE with byte fallback.
    BpeV1,
    /// GPT-2 byte-level BPE.
    BpeV2,
    /// Byte-level BPE with digit grouping and scalar-grouped symbols.
    BpeV3,
    /// Unigram language model.
    Unigram,
}

impl Strategy {
    /// Tag used in the weight file.
    pub fn tag(&self) -> u32 {
        match self {
            Self::BpeV1 => 0,
            Self::BpeV2 => 1,
            Self::BpeV3 => 2,
            Self::Unigram => 3,
        }
    }

    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Self::BpeV1),
            1 => Ok(Self::BpeV2),
            2 => Ok(Self::BpeV3),
            3 => Ok(Self::Unigram),
            other => Err(Error::Tokenization(format!("unknown tokenizer strategy {other}"))),
        }
    }

    fn is_byte_level(&self) -> bool {
        matches!(self, Self::BpeV2 | Self::BpeV3)
    }
}

/// One contiguous piece of input after splitting out added tokens.
enum Segment<'a> {
    Text(&'a str),
    Added(u32),
}

/// Tokenizer processor: vocabulary plus encoding/decoding rules.
#[derive(Debug, Clone)]
pub struct Processor {
    strategy: Strategy,
    vocab: Vocab,
    unk_id: u32,
    unk_piece: String,
    return_special_tokens: bool,
    preprocessors: Vec<Preprocessor>,
    overrides: HashMap<u32, String>,
    /// Added tokens, longest first.
    added_tokens: Vec<(String, u32)>,
}

impl Processor {
    /// Creates a processor; the unknown id defaults to the first `Unknown` entry (or 0).
    pub fn new(strategy: Strategy, vocab: Vocab) -> Self {
        let unk_id = vocab
            .tokens()
            .iter()
            .position(|t| t.kind == TokenType::Unknown)
            .unwrap_or(0) as u32;
        Self {
            strategy,
            vocab,
            unk_id,
            unk_piece: "<?>".to_string(),
            return_special_tokens: false,
            preprocessors: Vec::new(),
            overrides: HashMap::new(),
            added_tokens: Vec::new(),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    /// Number of pieces.
    pub fn piece_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn piece_to_id(&self, piece: &str) -> Option<u32> {
        self.added_tokens
            .iter()
            .find(|(tok, _)| tok == piece)
            .map(|&(_, id)| id)
            .or_else(|| self.vocab.piece_to_id(piece))
    }

    /// Piece text of `id`; unknown ids map to the unknown piece.
    pub fn id_to_piece(&self, id: u32) -> String {
        match self.vocab.get(id) {
            Some(token) if self.strategy.is_byte_level() => {
                let mut bytes = Vec::new();
                bpe::decode_byte_level(&token.piece, &mut bytes);
                String::from_utf8_lossy(&bytes).into_owned()
            }
            Some(token) => token.piece.clone(),
            None => self.unk_piece.clone(),
        }
    }

    pub fn unk_id(&self) -> u32 {
        self.unk_id
    }

    pub fn set_unk_id(&mut self, id: u32) {
        self.unk_id = id;
    }

    /// Text emitted when decoding an id outside the vocabulary.
    pub fn set_unk_piece(&mut self, piece: impl Into<String>) {
        self.unk_piece = piece.into();
    }

    /// Whether control tokens appear in decoded text.
    pub fn enable_return_special_tokens(&mut self, enable: bool) {
        self.return_special_tokens = enable;
    }

    pub fn register_preprocessor(&mut self, preprocessor: Preprocessor) {
        self.preprocessors.push(preprocessor);
    }

    pub fn preprocessors(&self) -> &[Preprocessor] {
        &self.preprocessors
    }

    /// Replaces the decoded text of `id`.
    pub fn override_token_decoding(&mut self, id: u32, text: impl Into<String>) {
        self.overrides.insert(id, text.into());
    }

    /// Registers an exact string matched before segmentation.
    pub fn add_added_token(&mut self, token: impl Into<String>, id: u32) {
        let token = token.into();
        if token.is_empty() {
            return;
        }
        self.added_tokens.retain(|(t, _)| *t != token);
        self.added_tokens.push((token, id));
        self.added_tokens
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
    }

    /// Applies the registered preprocessors in order.
    pub fn normalize(&self, text: &str) -> String {
        preprocess::apply_all(&self.preprocessors, text)
    }

    /// Encodes `text` into ids.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let text = self.normalize(text);
        let mut ids = Vec::new();
        for segment in self.split_added(&text) {
            match segment {
                Segment::Added(id) => ids.push(id),
                Segment::Text(s) => self.encode_segment(s, &mut ids),
            }
        }
        ids
    }

    /// Encodes `text` and returns the pieces instead of ids.
    pub fn encode_pieces(&self, text: &str) -> Vec<String> {
        self.encode(text)
            .into_iter()
            .map(|id| match self.vocab.get(id) {
                Some(t) => t.piece.clone(),
                None => self
                    .added_tokens
                    .iter()
                    .find(|(_, a)| *a == id)
                    .map_or_else(|| self.unk_piece.clone(), |(t, _)| t.clone()),
            })
            .collect()
    }

    fn encode_segment(&self, text: &str, ids: &mut Vec<u32>) {
        if text.is_empty() {
            return;
        }
        match self.strategy {
            Strategy::BpeV1 => bpe::encode_v1(&self.vocab, text, self.unk_id, ids),
            Strategy::BpeV2 => bpe::encode_v2(&self.vocab, text, self.unk_id, ids),
            Strategy::BpeV3 => bpe::encode_v3(&self.vocab, text, self.unk_id, ids),
            Strategy::Unigram => unigram::encode(&self.vocab, text, self.unk_id, ids),
        }
    }

    /// Splits out added tokens, longest match first at each position.
    fn split_added<'a>(&self, text: &'a str) -> Vec<Segment<'a>> {
        if self.added_tokens.is_empty() {
            return vec![Segment::Text(text)];
        }
        let mut segments = Vec::new();
        let mut plain_start = 0;
        let mut i = 0;
        while i < text.len() {
            let rest = &text[i..];
            match self.added_tokens.iter().find(|(tok, _)| rest.starts_with(tok.as_str())) {
                Some((tok, id)) => {
                    if plain_start < i {
                        segments.push(Segment::Text(&text[plain_start..i]));
                    }
                    segments.push(Segment::Added(*id));
                    i += tok.len();
                    plain_start = i;
                }
                None => {
                    i += rest.chars().next().map_or(1, char::len_utf8);
                }
            }
        }
        if plain_start < text.len() {
            segments.push(Segment::Text(&text[plain_start..]));
        }
        segments
    }

    /// Raw bytes for `ids`; may end inside a multi-byte scalar.
    pub fn decode_bytes(&self, ids: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        for &id in ids {
            if let Some(text) = self.overrides.get(&id) {
                out.extend_from_slice(text.as_bytes());
                continue;
            }
            if let Some((tok, _)) = self.added_tokens.iter().find(|(_, a)| *a == id) {
                if self.vocab.get(id).is_none() {
                    out.extend_from_slice(tok.as_bytes());
                    continue;
                }
            }
            let Some(token) = self.vocab.get(id) else {
                debug!(id, "decoding id outside the vocabulary");
                out.extend_from_slice(self.unk_piece.as_bytes());
                continue;
            };
            match token.kind {
                TokenType::Control if !self.return_special_tokens => {}
                TokenType::Byte => match bpe::parse_byte_piece(&token.piece) {
                    Some(b) => out.push(b),
                    None => out.extend_from_slice(token.piece.as_bytes()),
                },
                _ if self.strategy.is_byte_level() => bpe::decode_byte_level(&token.piece, &mut out),
                _ => {
                    let text = token.piece.replace(SPACE_MARKER, " ");
                    out.extend_from_slice(text.as_bytes());
                }
            }
        }
        if self.preprocessors.contains(&Preprocessor::AddLeadingSpace) && out.first() == Some(&b' ') {
            out.remove(0);
        }
        out
    }

    /// Decodes `ids` into text, replacing invalid UTF-8.
    pub fn decode(&self, ids: &[u32]) -> String {
        String::from_utf8_lossy(&self.decode_bytes(ids)).into_owned()
    }
}
