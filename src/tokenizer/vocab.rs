//! Vocabulary: dense id range with scores, token types and BPE merge ranks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of a vocabulary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum TokenType {
    #[default]
    Undefined = 0,
    Normal = 1,
    Unknown = 2,
    Control = 3,
    UserDefined = 4,
    Unused = 5,
    Byte = 6,
}

impl TryFrom<u8> for TokenType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Undefined,
            1 => Self::Normal,
            2 => Self::Unknown,
            3 => Self::Control,
            4 => Self::UserDefined,
            5 => Self::Unused,
            6 => Self::Byte,
            other => {
                return Err(Error::Tokenization(format!("unknown token type {other}")));
            }
        })
    }
}

/// One vocabulary entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenScore {
    /// Token text.
    pub piece: String,
    /// Log-probability (Unigram) or merge priority (score-based BPE).
    pub score: f32,
    /// Token type.
    pub kind: TokenType,
}

impl TokenScore {
    pub fn new(piece: impl Into<String>, score: f32, kind: TokenType) -> Self {
        Self {
            piece: piece.into(),
            score,
            kind,
        }
    }

    /// A normal token with score 0.
    pub fn normal(piece: impl Into<String>) -> Self {
        Self::new(piece, 0.0, TokenType::Normal)
    }
}

/// Bidirectional token map, immutable after load.
#[derive(Debug, Clone, Default)]
pub struct Vocab {
    token_to_id: HashMap<String, u32>,
    id_to_token: Vec<TokenScore>,
    bpe_ranks: HashMap<(String, String), usize>,
    /// Longest piece, in chars.
    max_piece_chars: usize,
}

impl Vocab {
    /// Builds the maps; duplicate pieces keep their first id.
    pub fn new(tokens: Vec<TokenScore>) -> Self {
        let mut token_to_id = HashMap::with_capacity(tokens.len());
        let mut max_piece_chars = 0;
        for (id, token) in tokens.iter().enumerate() {
            token_to_id.entry(token.piece.clone()).or_insert(id as u32);
            max_piece_chars = max_piece_chars.max(token.piece.chars().count());
        }
        Self {
            token_to_id,
            id_to_token: tokens,
            bpe_ranks: HashMap::new(),
            max_piece_chars,
        }
    }

    /// Attaches merge rules; the position in `merges` is the rank.
    pub fn with_merges<I>(mut self, merges: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (rank, pair) in merges.into_iter().enumerate() {
            self.bpe_ranks.entry(pair).or_insert(rank);
        }
        self
    }

    /// Parses merge lines of the form `"left right"`.
    pub fn parse_merge(line: &str) -> Result<(String, String)> {
        line.split_once(' ')
            .map(|(l, r)| (l.to_string(), r.to_string()))
            .ok_or_else(|| Error::Tokenization(format!("malformed merge rule {line:?}")))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    /// Entry for `id`.
    pub fn get(&self, id: u32) -> Option<&TokenScore> {
        self.id_to_token.get(id as usize)
    }

    /// Id of an exact piece.
    pub fn piece_to_id(&self, piece: &str) -> Option<u32> {
        self.token_to_id.get(piece).copied()
    }

    /// Rank of merging `left` and `right`; lower merges first.
    pub fn find_bpe_rank(&self, left: &str, right: &str) -> Option<usize> {
        // Tuple keys need owned strings for lookup.
        self.bpe_ranks
            .get(&(left.to_string(), right.to_string()))
            .copied()
    }

    /// Whether any merge rules are loaded.
    pub fn has_merges(&self) -> bool {
        !self.bpe_ranks.is_empty()
    }

    /// Merge rules in rank order.
    pub fn merges(&self) -> Vec<(String, String)> {
        let mut merges: Vec<_> = self.bpe_ranks.iter().collect();
        merges.sort_by_key(|(_, rank)| **rank);
        merges.into_iter().map(|(pair, _)| pair.clone()).collect()
    }

    /// Entries in id order.
    pub fn tokens(&self) -> &[TokenScore] {
        &self.id_to_token
    }

    /// Longest piece length in chars.
    pub fn max_piece_chars(&self) -> usize {
        self.max_piece_chars
    }

    pub fn is_token_of_type(&self, id: u32, kind: TokenType) -> bool {
        self.get(id).is_some_and(|t| t.kind == kind)
    }

    pub fn is_normal_token(&self, id: u32) -> bool {
        self.is_token_of_type(id, TokenType::Normal)
    }

    pub fn is_control_token(&self, id: u32) -> bool {
        self.is_token_of_type(id, TokenType::Control)
    }
}
