//! Chat templates as a pure function table.
//!
//! Each [`ChatTemplate`] maps to a static [`HistoryEncoder`] of plain
//! function pointers. Encoders receive everything they need through
//! [`EncodeContext`]; none of them holds state.

use serde::{Deserialize, Serialize};

use super::chat::SpecialTokens;
use super::processor::Processor;

/// Chat formatting family of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplate {
    /// System prompt, then raw turns.
    #[default]
    Plain,
    /// `<<SYS>>` block and `[INST] ... [/INST]` turns.
    Llama2,
    /// Role headers terminated by `<|eot_id|>`.
    Llama3,
    /// `[INST] ... [/INST]` turns.
    Mistral,
    /// Reserved user/assistant role ids.
    Baichuan,
    /// `USER: ... ASSISTANT:` turns.
    WizardLm,
    /// `<<SYS>>` block once, then `[INST] ... [/INST]` turns.
    Neo,
    /// System prompt repeated before each request.
    CodeGeeX2,
}

impl ChatTemplate {
    /// The encoder table for this template.
    pub fn encoder(self) -> &'static HistoryEncoder {
        match self {
            Self::Plain => &PLAIN,
            Self::Llama2 => &LLAMA2,
            Self::Llama3 => &LLAMA3,
            Self::Mistral => &MISTRAL,
            Self::Baichuan => &BAICHUAN,
            Self::WizardLm => &WIZARD_LM,
            Self::Neo => &NEO,
            Self::CodeGeeX2 => &CODEGEEX2,
        }
    }
}

/// What an encoder may read while appending ids.
#[derive(Clone, Copy)]
pub struct EncodeContext<'a> {
    pub processor: &'a Processor,
    pub special: SpecialTokens,
    pub system_prompt: &'a str,
}

impl EncodeContext<'_> {
    fn text(&self, text: &str, ids: &mut Vec<u32>) {
        ids.extend(self.processor.encode(text));
    }

    fn id(&self, id: Option<u32>, ids: &mut Vec<u32>) {
        ids.extend(id);
    }
}

type PrefixFn = fn(&EncodeContext<'_>, &mut Vec<u32>);
type TurnFn = fn(&EncodeContext<'_>, usize, &str, &mut Vec<u32>);

/// Function table for one template.
pub struct HistoryEncoder {
    /// Ids placed once before the first included round (bos, system prompt).
    pub prefix: PrefixFn,
    /// A user turn, up to the point where the assistant starts answering.
    pub user: TurnFn,
    /// A completed assistant turn, including its terminator.
    pub ai: TurnFn,
}

fn no_prefix(_: &EncodeContext<'_>, _: &mut Vec<u32>) {}

fn ai_with_eos(ctx: &EncodeContext<'_>, _round: usize, ai: &str, ids: &mut Vec<u32>) {
    ctx.text(ai, ids);
    ctx.id(ctx.special.eos, ids);
}

static PLAIN: HistoryEncoder = HistoryEncoder {
    prefix: |ctx, ids| {
        ctx.id(ctx.special.bos, ids);
        if !ctx.system_prompt.is_empty() {
            ctx.text(&format!("{}\n", ctx.system_prompt), ids);
        }
    },
    user: |ctx, _, user, ids| ctx.text(user, ids),
    ai: ai_with_eos,
};

static LLAMA2: HistoryEncoder = HistoryEncoder {
    prefix: |ctx, ids| {
        ctx.id(ctx.special.bos, ids);
        ctx.text(&format!("<<SYS>>\n{}\n<</SYS>>\n\n", ctx.system_prompt), ids);
    },
    user: |ctx, round, user, ids| {
        if round > 0 {
            ctx.id(ctx.special.bos, ids);
        }
        ctx.text(&format!("[INST] {user}[/INST] "), ids);
    },
    ai: ai_with_eos,
};

fn llama3_header(ctx: &EncodeContext<'_>, role: &str, ids: &mut Vec<u32>) {
    ctx.id(ctx.special.start_header, ids);
    ctx.text(role, ids);
    ctx.id(ctx.special.end_header, ids);
    ctx.text("\n\n", ids);
}

fn llama3_content(ctx: &EncodeContext<'_>, text: &str, ids: &mut Vec<u32>) {
    ctx.text(text, ids);
    ctx.id(ctx.special.terminate, ids);
}

static LLAMA3: HistoryEncoder = HistoryEncoder {
    prefix: |ctx, ids| {
        ctx.id(ctx.special.bos, ids);
        if !ctx.system_prompt.is_empty() {
            llama3_header(ctx, "system", ids);
            llama3_content(ctx, ctx.system_prompt, ids);
        }
    },
    user: |ctx, _, user, ids| {
        llama3_header(ctx, "user", ids);
        llama3_content(ctx, user, ids);
        llama3_header(ctx, "assistant", ids);
    },
    ai: |ctx, _, ai, ids| llama3_content(ctx, ai, ids),
};

static MISTRAL: HistoryEncoder = HistoryEncoder {
    prefix: no_prefix,
    user: |ctx, _, user, ids| {
        ctx.id(ctx.special.bos, ids);
        ctx.text(&format!("[INST] {user} [/INST]"), ids);
    },
    ai: ai_with_eos,
};

static BAICHUAN: HistoryEncoder = HistoryEncoder {
    prefix: |ctx, ids| {
        if !ctx.system_prompt.is_empty() {
            ctx.text(ctx.system_prompt, ids);
        }
    },
    user: |ctx, _, user, ids| {
        ctx.id(ctx.special.user, ids);
        ctx.text(user, ids);
        ctx.id(ctx.special.assistant, ids);
    },
    ai: |ctx, _, ai, ids| ctx.text(ai, ids),
};

static WIZARD_LM: HistoryEncoder = HistoryEncoder {
    prefix: |ctx, ids| {
        if !ctx.system_prompt.is_empty() {
            ctx.text(&format!("{} ", ctx.system_prompt), ids);
        }
    },
    user: |ctx, _, user, ids| ctx.text(&format!("USER: {user} ASSISTANT:"), ids),
    ai: ai_with_eos,
};

static NEO: HistoryEncoder = HistoryEncoder {
    prefix: |ctx, ids| {
        ctx.id(ctx.special.bos, ids);
        if !ctx.system_prompt.is_empty() {
            ctx.text(&format!("<<SYS>>\n{}\n<</SYS>>\n\n", ctx.system_prompt), ids);
        }
    },
    user: |ctx, _, user, ids| ctx.text(&format!("[INST] {user} [/INST] "), ids),
    ai: ai_with_eos,
};

static CODEGEEX2: HistoryEncoder = HistoryEncoder {
    prefix: no_prefix,
    user: |ctx, _, user, ids| ctx.text(&format!("{}\n{user}\n", ctx.system_prompt), ids),
    ai: |ctx, _, ai, ids| ctx.text(&format!("{ai}\n"), ids),
};
