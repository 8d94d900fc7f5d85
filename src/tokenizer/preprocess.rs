//! Text preprocessors applied before encoding, in registration order.

use serde::{Deserialize, Serialize};

/// A text normalization step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preprocessor {
    /// Trim whitespace on both ends.
    Trim,
    /// Trim trailing whitespace only.
    TrimEnd,
    /// Collapse runs of spaces into one.
    DeleteMultiSpaces,
    /// Replace each newline (`\r\n`, `\n`, `\r`) with a space.
    NewlineToSpaces,
    /// Prefix a single space.
    AddLeadingSpace,
}

impl Preprocessor {
    pub fn transform(&self, text: &str) -> String {
        match self {
            Self::Trim => text.trim().to_string(),
            Self::TrimEnd => text.trim_end().to_string(),
            Self::DeleteMultiSpaces => {
                let mut out = String::with_capacity(text.len());
                let mut prev_space = false;
                for c in text.chars() {
                    if c == ' ' {
                        if !prev_space {
                            out.push(c);
                        }
                        prev_space = true;
                    } else {
                        out.push(c);
                        prev_space = false;
                    }
                }
                out
            }
            Self::NewlineToSpaces => text.replace("\r\n", " ").replace(['\n', '\r'], " "),
            Self::AddLeadingSpace => format!(" {text}"),
        }
    }
}

/// Applies `preprocessors` in order.
pub fn apply_all(preprocessors: &[Preprocessor], text: &str) -> String {
    preprocessors
        .iter()
        .fold(text.to_string(), |acc, p| p.transform(&acc))
}
