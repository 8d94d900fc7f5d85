//! Chat pipeline.
//!
//! The pipeline owns the model and tokenizer and drives one conversation:
//!
//! ```text
//!   Idle ──chat()──► Prefilling ──► Decoding ──► Done
//!                                      │          ▲
//!                                      └─abort──► Aborting
//! ```
//!
//! Prefill encodes the history (only the newest user turn when the cache
//! already holds the earlier ones) and runs it as one batch. Decoding then
//! samples one id per step, streams it and feeds it back. Before any forward
//! pass that would overflow `max_context_length`, the extension policy makes
//! room: **Shift** evicts the oldest positions after a kept prefix, **Restart**
//! clears the cache and replays the prefix (or a loaded session checkpoint)
//! followed by the most recent tokens.
//!
//! `n_past` counts cached positions. `n_past_offset` counts positions evicted
//! by shifting, so the logical position of the next token is
//! `n_past + n_past_offset`.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use super::cancel::CancellationToken;
use super::sampler::Sampler;
use super::streamer::{Streamer, TextStreamer};
use crate::attention::PositionContext;
use crate::config::{ExtendingMethod, GenerationConfig, SamplingConfig};
use crate::core::{LayerState, SessionState};
use crate::error::{Error, Result};
use crate::model::{load_model, Transformer};
use crate::tokenizer::{Processor, SpecialTokens, Tokenizer};

/// Where the pipeline is in a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Prefilling,
    Decoding,
    Aborting,
    Done,
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A stop id (end-of-turn or eos) was sampled.
    Stop,
    /// `max_length` ids were generated.
    Length,
    /// The cancellation token fired.
    Aborted,
}

/// Result of one chat call.
#[derive(Debug, Clone)]
pub struct ChatOutput {
    /// Decoded reply, special ids excluded.
    pub text: String,
    /// Generated ids, stop id excluded.
    pub ids: Vec<u32>,
    pub finish_reason: FinishReason,
}

/// Counters accumulated over the pipeline's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub shifts: usize,
    pub restarts: usize,
}

/// Timeline restored from a session file, replayed by [`Pipeline::restart`].
#[derive(Debug, Clone)]
struct Checkpoint {
    tokens: Vec<u32>,
    history_offset: usize,
}

/// Single-conversation generation pipeline.
#[derive(Debug)]
pub struct Pipeline {
    model: Transformer,
    tokenizer: Tokenizer,
    extending: ExtendingMethod,
    /// Shift keep-prefix override; defaults to the template prefix length.
    shift_keep: Option<usize>,
    state: PipelineState,
    n_past: usize,
    n_past_offset: usize,
    /// Ids currently cached, in cache order (`len == n_past`).
    timeline: Vec<u32>,
    checkpoint: Option<Checkpoint>,
    /// Sampler seed used when the call does not set one.
    seed: Option<u64>,
    stats: PipelineStats,
    invalidated: bool,
    pool: Option<(usize, rayon::ThreadPool)>,
}

impl Pipeline {
    /// Wraps a loaded model and its vocabulary.
    pub fn new(model: Transformer, processor: Processor) -> Result<Self> {
        let config = model.config();
        if !config.cache_layout.is_cached() {
            return Err(Error::Config(
                "chat generation needs a causal model with a KV cache".into(),
            ));
        }
        let special = SpecialTokens::resolve(config, &processor);
        let tokenizer = Tokenizer::new(processor, config.chat_template, special);

        Ok(Self {
            model,
            tokenizer,
            extending: ExtendingMethod::default(),
            shift_keep: None,
            state: PipelineState::Idle,
            n_past: 0,
            n_past_offset: 0,
            timeline: Vec::new(),
            checkpoint: None,
            seed: None,
            stats: PipelineStats::default(),
            invalidated: false,
            pool: None,
        })
    }

    /// Loads a weight file and builds the pipeline on the CPU.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let loaded = load_model(path, DType::F32, &Device::Cpu)?;
        Self::new(loaded.model, loaded.processor)
    }

    /// Replaces model and vocabulary with the contents of another weight file.
    ///
    /// A corrupted file leaves the pipeline unusable: every later call fails
    /// with [`Error::PipelineInvalidated`].
    pub fn reload_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_usable()?;
        let device = self.model.device().clone();
        let dtype = self.model.dtype();
        match load_model(path, dtype, &device) {
            Ok(loaded) => {
                let system_prompt = self.tokenizer.system_prompt().to_string();
                let mut next = Self::new(loaded.model, loaded.processor)?;
                next.tokenizer.set_system_prompt(system_prompt);
                next.extending = self.extending;
                next.shift_keep = self.shift_keep;
                next.seed = self.seed;
                *self = next;
                Ok(())
            }
            Err(e) => {
                if e.is_corruption() {
                    warn!(error = %e, "weight reload failed, pipeline invalidated");
                    self.invalidated = true;
                }
                Err(e)
            }
        }
    }

    pub fn model(&self) -> &Transformer {
        &self.model
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn tokenizer_mut(&mut self) -> &mut Tokenizer {
        &mut self.tokenizer
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn n_past(&self) -> usize {
        self.n_past
    }

    pub fn n_past_offset(&self) -> usize {
        self.n_past_offset
    }

    /// Ids currently held by the cache.
    pub fn cached_tokens(&self) -> &[u32] {
        &self.timeline
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn extending_method(&self) -> ExtendingMethod {
        self.extending
    }

    pub fn set_extending_method(&mut self, method: ExtendingMethod) {
        self.extending = method;
    }

    /// Overrides how many leading positions a shift preserves.
    pub fn set_shift_keep(&mut self, keep: Option<usize>) {
        self.shift_keep = keep;
    }

    /// Sets the system prompt and clears the conversation.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.tokenizer.set_system_prompt(prompt);
        self.checkpoint = None;
        self.clear_cache();
    }

    /// Seeds sampling for calls whose config has no seed.
    pub fn seed(&mut self, seed: u64) {
        self.seed = Some(seed);
    }

    /// A [`TextStreamer`] decoding with this pipeline's vocabulary.
    pub fn text_streamer<F: FnMut(&str)>(&self, sink: F) -> TextStreamer<F> {
        TextStreamer::new(self.tokenizer.processor().clone(), sink)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.invalidated {
            Err(Error::PipelineInvalidated)
        } else {
            Ok(())
        }
    }

    fn clear_cache(&mut self) {
        self.model.reset_cache();
        self.n_past = 0;
        self.n_past_offset = 0;
        self.timeline.clear();
    }

    /// Discards the conversation state. With a loaded session checkpoint, the
    /// checkpointed timeline is replayed so the next call continues from it.
    pub fn restart(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.clear_cache();
        self.state = PipelineState::Idle;
        match self.checkpoint.clone() {
            Some(checkpoint) => {
                self.tokenizer.set_history_offset(checkpoint.history_offset);
                if !checkpoint.tokens.is_empty() {
                    self.forward(&checkpoint.tokens)?;
                }
                info!(replayed = checkpoint.tokens.len(), "restarted from checkpoint");
            }
            None => {
                self.tokenizer.set_history_offset(0);
                info!("restarted");
            }
        }
        Ok(())
    }

    fn prepare_pool(&mut self, num_threads: usize) -> Result<()> {
        if num_threads == 0 {
            self.pool = None;
            return Ok(());
        }
        if matches!(&self.pool, Some((n, _)) if *n == num_threads) {
            return Ok(());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| Error::Config(format!("cannot build a {num_threads}-thread pool: {e}")))?;
        self.pool = Some((num_threads, pool));
        Ok(())
    }

    /// Runs `tokens` through the model at the current position and records them.
    fn forward(&mut self, tokens: &[u32]) -> Result<Tensor> {
        let pos = PositionContext::new(self.n_past, self.n_past_offset);
        let model = &mut self.model;
        let logits = match &self.pool {
            Some((_, pool)) => pool.install(|| model.forward(tokens, pos))?,
            None => model.forward(tokens, pos)?,
        };
        self.n_past += tokens.len();
        self.timeline.extend_from_slice(tokens);
        Ok(logits)
    }

    fn keep_len(&self) -> usize {
        let keep = match self.shift_keep {
            Some(keep) => keep,
            None => self.tokenizer.encode_prefix().len(),
        };
        keep.min(self.n_past)
    }

    /// Evicts `excess` positions after the first `keep`.
    fn shift(&mut self, keep: usize, excess: usize) -> Result<()> {
        self.model.shift_memory(keep, excess)?;
        self.n_past -= excess;
        self.n_past_offset += excess;
        self.timeline.drain(keep..keep + excess);
        self.stats.shifts += 1;
        debug!(
            keep,
            excess,
            n_past = self.n_past,
            n_past_offset = self.n_past_offset,
            "context shifted"
        );
        Ok(())
    }

    /// Makes room for `incoming` tokens by shifting.
    fn shift_for(&mut self, incoming: usize, max_ctx: usize) -> Result<()> {
        let keep = self.keep_len();
        let excess = self.n_past + incoming - max_ctx;
        if keep + excess > self.n_past {
            return Err(Error::Config(format!(
                "cannot fit {incoming} tokens: {keep} kept + {incoming} exceed the context of {max_ctx}"
            )));
        }
        self.shift(keep, excess)
    }

    /// Clears the cache and replays the prefix (or checkpoint) plus the most
    /// recent tokens, leaving room for `incoming`.
    fn restart_for(&mut self, incoming: usize, max_ctx: usize) -> Result<()> {
        let head = match &self.checkpoint {
            Some(checkpoint) => checkpoint.tokens.clone(),
            None => self.tokenizer.encode_prefix(),
        };
        if head.len() + incoming > max_ctx {
            return Err(Error::Config(format!(
                "replay prefix of {} tokens leaves no room in a context of {max_ctx}",
                head.len()
            )));
        }
        let body_start = if self.timeline.starts_with(&head) {
            head.len()
        } else {
            0
        };
        let body = &self.timeline[body_start..];
        let tail_len = body
            .len()
            .min(max_ctx / 2)
            .min(max_ctx - head.len() - incoming);
        let mut replay = head;
        replay.extend_from_slice(&body[body.len() - tail_len..]);

        self.clear_cache();
        if !replay.is_empty() {
            self.forward(&replay)?;
        }
        self.stats.restarts += 1;
        info!(replayed = replay.len(), "context restarted");
        Ok(())
    }

    /// Applies the extension policy if `incoming` tokens would overflow.
    fn make_room(&mut self, incoming: usize, max_ctx: usize) -> Result<()> {
        if self.n_past + incoming <= max_ctx {
            return Ok(());
        }
        match self.extending {
            ExtendingMethod::Shift => self.shift_for(incoming, max_ctx),
            ExtendingMethod::Restart => self.restart_for(incoming, max_ctx),
        }
    }

    /// Runs one chat turn over `history` (`[user, ai, user, ..., user]`).
    ///
    /// Generated ids are streamed as they are sampled; `streamer.end()` is
    /// called exactly once, whatever the outcome. A failed call clears the
    /// conversation so the next call starts from a full encode.
    pub fn chat(
        &mut self,
        history: &[String],
        gen_config: &GenerationConfig,
        streamer: &mut dyn Streamer,
        cancel: &CancellationToken,
    ) -> Result<ChatOutput> {
        let result = self.run_chat(history, gen_config, streamer, cancel);
        streamer.end();
        self.state = PipelineState::Done;

        if let Err(e) = &result {
            if e.is_corruption() {
                self.invalidated = true;
            } else {
                warn!(error = %e, "chat failed, clearing the conversation");
                self.clear_cache();
            }
        }
        result
    }

    fn run_chat(
        &mut self,
        history: &[String],
        gen_config: &GenerationConfig,
        streamer: &mut dyn Streamer,
        cancel: &CancellationToken,
    ) -> Result<ChatOutput> {
        self.ensure_usable()?;
        gen_config.validate(self.model.config())?;
        self.prepare_pool(gen_config.num_threads)?;
        let max_ctx = gen_config.max_context_length;

        // Prefill
        self.state = PipelineState::Prefilling;
        let incremental = self.n_past > 0;
        let mut input = self
            .tokenizer
            .encode_history(history, max_ctx, incremental)?;
        if self.n_past + input.len() > max_ctx {
            match self.extending {
                ExtendingMethod::Shift => self.shift_for(input.len(), max_ctx)?,
                ExtendingMethod::Restart => {
                    self.clear_cache();
                    self.stats.restarts += 1;
                    input = self.tokenizer.encode_history(history, max_ctx, false)?;
                    info!(prompt = input.len(), "prompt restarted the context");
                }
            }
        }
        if input.is_empty() {
            return Err(Error::Config("prompt encodes to no tokens".into()));
        }
        if self.n_past + input.len() > max_ctx {
            return Err(Error::Config(format!(
                "prompt of {} tokens does not fit a context of {max_ctx}",
                input.len()
            )));
        }
        self.stats.prompt_tokens += input.len();
        let mut logits = self.forward(&input)?;
        debug!(prompt = input.len(), n_past = self.n_past, "prefill done");

        // Decode
        self.state = PipelineState::Decoding;
        let sampling = SamplingConfig {
            seed: gen_config.sampling.seed.or(self.seed),
            ..gen_config.sampling.clone()
        };
        let mut sampler = Sampler::new(&sampling);
        let stop_ids = [self.tokenizer.terminate_token_id(), self.tokenizer.special().eos];
        let mut ids = Vec::new();

        let finish_reason = loop {
            if cancel.is_cancelled() {
                self.state = PipelineState::Aborting;
                break FinishReason::Aborted;
            }
            let next = sampler.sample(&logits)?;
            if stop_ids.contains(&Some(next)) {
                break FinishReason::Stop;
            }
            ids.push(next);
            self.stats.generated_tokens += 1;
            if !self.tokenizer.is_special_id(next) {
                streamer.put(&[next]);
            }
            if ids.len() >= gen_config.max_length {
                break FinishReason::Length;
            }
            self.make_room(1, max_ctx)?;
            logits = self.forward(&[next])?;
        };

        let visible: Vec<u32> = ids
            .iter()
            .copied()
            .filter(|&id| !self.tokenizer.is_special_id(id))
            .collect();
        info!(
            generated = ids.len(),
            n_past = self.n_past,
            reason = ?finish_reason,
            "chat finished"
        );
        Ok(ChatOutput {
            text: self.tokenizer.decode(&visible),
            ids,
            finish_reason,
        })
    }

    /// Writes the cache, token timeline and counters to `path`.
    pub fn save_session(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_usable()?;
        let mut layers = Vec::with_capacity(self.model.num_layers());
        for block in self.model.layers_mut() {
            let layer = match block.self_attn_mut().core_mut().cache_mut() {
                Some(cache) => {
                    cache.apply_pending_shift()?;
                    Some(LayerState {
                        keys: cache.keys()?,
                        values: cache.values()?,
                        positions: cache.positions().to_vec(),
                    })
                }
                None => None,
            };
            layers.push(layer);
        }
        let state = SessionState {
            layers,
            tokens: self.timeline.clone(),
            n_past: self.n_past,
            n_past_offset: self.n_past_offset,
            history_offset: self.tokenizer.history_offset(),
        };
        state.save(path, self.model.device())
    }

    /// Restores a session written by [`Pipeline::save_session`] and keeps its
    /// timeline as the checkpoint [`Pipeline::restart`] replays.
    pub fn load_session(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_usable()?;
        let device = self.model.device().clone();
        let state = SessionState::load(path, self.model.num_layers(), &device)?;

        let capacity = self.model.config().max_length;
        if state.tokens.len() != state.n_past || state.n_past > capacity {
            return Err(Error::Session(format!(
                "session holds {} tokens for n_past {} (capacity {capacity})",
                state.tokens.len(),
                state.n_past
            )));
        }

        self.clear_cache();
        if let Err(e) = restore_layers(&mut self.model, state.layers, state.n_past) {
            self.clear_cache();
            return Err(e);
        }

        self.n_past = state.n_past;
        self.n_past_offset = state.n_past_offset;
        self.timeline = state.tokens.clone();
        self.tokenizer.set_history_offset(state.history_offset);
        self.checkpoint = Some(Checkpoint {
            tokens: state.tokens,
            history_offset: state.history_offset,
        });
        self.state = PipelineState::Idle;
        Ok(())
    }
}

fn restore_layers(model: &mut Transformer, layers: Vec<Option<LayerState>>, n_past: usize) -> Result<()> {
    for (i, (block, layer)) in model.layers_mut().iter_mut().zip(layers).enumerate() {
        let Some(cache) = block.self_attn_mut().core_mut().cache_mut() else {
            continue;
        };
        match layer {
            Some(layer) if layer.positions.len() == n_past => {
                cache.restore(&layer.keys, &layer.values, layer.positions)?;
            }
            None if n_past == 0 => cache.reset(),
            _ => {
                return Err(Error::Session(format!("layer {i} does not hold {n_past} rows")));
            }
        }
    }
    Ok(())
}
