//! Chat-level tokenizer: processor + template + special ids + history bookkeeping.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::processor::Processor;
use super::template::{ChatTemplate, EncodeContext};
use super::vocab::TokenType;
use crate::config::ModelConfig;
use crate::error::{Error, Result};

/// Special ids a template and the decode loop need, passed by value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: Option<u32>,
    pub pad: Option<u32>,
    /// End-of-turn id when it differs from eos.
    pub terminate: Option<u32>,
    /// Role ids (Baichuan style).
    pub user: Option<u32>,
    pub assistant: Option<u32>,
    /// Role header delimiters (Llama3 style).
    pub start_header: Option<u32>,
    pub end_header: Option<u32>,
}

impl SpecialTokens {
    /// Ids from the model config plus role ids found in the vocabulary.
    pub fn resolve(config: &ModelConfig, processor: &Processor) -> Self {
        let find = |piece: &str| processor.piece_to_id(piece);
        let mut special = Self {
            bos: config.bos_token_id,
            eos: config.eos_token_id,
            pad: config.pad_token_id,
            ..Self::default()
        };
        match config.chat_template {
            ChatTemplate::Llama3 => {
                special.start_header = find("<|start_header_id|>");
                special.end_header = find("<|end_header_id|>");
                special.terminate = find("<|eot_id|>");
            }
            ChatTemplate::Baichuan => {
                special.user = find("<reserved_106>");
                special.assistant = find("<reserved_107>");
            }
            _ => {}
        }
        special
    }

    fn ids(&self) -> impl Iterator<Item = u32> {
        [
            self.bos,
            self.eos,
            self.pad,
            self.terminate,
            self.user,
            self.assistant,
            self.start_header,
            self.end_header,
        ]
        .into_iter()
        .flatten()
    }
}

/// Tokenizer used by the pipeline.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    processor: Processor,
    template: ChatTemplate,
    special: SpecialTokens,
    system_prompt: String,
    /// Index of the first history message included by the last full encode.
    history_offset: usize,
}

impl Tokenizer {
    /// Wraps a processor; user-defined pieces become added tokens.
    pub fn new(mut processor: Processor, template: ChatTemplate, special: SpecialTokens) -> Self {
        let user_defined: Vec<(String, u32)> = processor
            .vocab()
            .tokens()
            .iter()
            .enumerate()
            .filter(|(_, t)| t.kind == TokenType::UserDefined)
            .map(|(id, t)| (t.piece.clone(), id as u32))
            .collect();
        for (piece, id) in user_defined {
            processor.add_added_token(piece, id);
        }
        Self {
            processor,
            template,
            special,
            system_prompt: String::new(),
            history_offset: 0,
        }
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut Processor {
        &mut self.processor
    }

    pub fn template(&self) -> ChatTemplate {
        self.template
    }

    pub fn special(&self) -> SpecialTokens {
        self.special
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn history_offset(&self) -> usize {
        self.history_offset
    }

    pub fn set_history_offset(&mut self, offset: usize) {
        self.history_offset = offset;
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        self.processor.encode(text)
    }

    pub fn decode(&self, ids: &[u32]) -> String {
        self.processor.decode(ids)
    }

    /// End-of-turn id, falling back to eos.
    pub fn terminate_token_id(&self) -> Option<u32> {
        self.special.terminate.or(self.special.eos)
    }

    /// Whether `id` is a template/control id that is never shown to the user.
    pub fn is_special_id(&self, id: u32) -> bool {
        self.special.ids().any(|s| s == id) || self.processor.vocab().is_control_token(id)
    }

    fn context(&self) -> EncodeContext<'_> {
        EncodeContext {
            processor: &self.processor,
            special: self.special,
            system_prompt: &self.system_prompt,
        }
    }

    /// Ids emitted before the first round: the part a shift keeps.
    pub fn encode_prefix(&self) -> Vec<u32> {
        let mut ids = Vec::new();
        (self.template.encoder().prefix)(&self.context(), &mut ids);
        ids
    }

    /// Index of the first message to include so the encoded history stays
    /// under `max_length` ids; always even (a user turn).
    pub fn get_history_start(&self, history: &[String], max_length: usize) -> usize {
        let Some(last) = history.len().checked_sub(1) else {
            return 0;
        };
        let mut total = self.encode(&history[last]).len();
        let mut start = last as isize - 1;
        while start >= 1 {
            let s = start as usize;
            total += self.encode(&history[s]).len();
            total += self.encode(&history[s - 1]).len();
            if total >= max_length {
                break;
            }
            start -= 2;
        }
        (start + 1) as usize
    }

    /// Encodes a chat history `[user, ai, user, ai, ..., user]`.
    ///
    /// A full encode drops the oldest rounds until the history fits
    /// `max_length / 2` and records the first included message in
    /// `history_offset`. An incremental encode only emits the last user turn,
    /// numbered relative to that offset.
    pub fn encode_history(
        &mut self,
        history: &[String],
        max_length: usize,
        incremental: bool,
    ) -> Result<Vec<u32>> {
        if history.len() % 2 != 1 {
            return Err(Error::Config(format!(
                "history must end with a user message, got {} messages",
                history.len()
            )));
        }
        let encoder = self.template.encoder();
        let mut ids = Vec::new();

        if !incremental {
            let start = self.get_history_start(history, max_length / 2);
            if start > 0 {
                warn!(dropped = start, "history truncated to fit the context");
            }
            self.history_offset = start;
        }
        let ctx = self.context();
        let offset = self.history_offset.min(history.len() - 1);

        if !incremental {
            (encoder.prefix)(&ctx, &mut ids);
            for (i, pair) in history[offset..history.len() - 1].chunks(2).enumerate() {
                (encoder.user)(&ctx, i, &pair[0], &mut ids);
                (encoder.ai)(&ctx, i, &pair[1], &mut ids);
            }
        }

        let round = (history.len() - 1 - offset) / 2;
        if incremental && round == 0 {
            (encoder.prefix)(&ctx, &mut ids);
        }
        (encoder.user)(&ctx, round, &history[history.len() - 1], &mut ids);
        Ok(ids)
    }
}
