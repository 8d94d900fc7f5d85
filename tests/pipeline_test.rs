//! Integration tests for Pipeline.

use std::cell::Cell;
use std::rc::Rc;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use nano_chat::engine::PipelineState;
use nano_chat::model::random_weights;
use nano_chat::tokenizer::bpe::byte_to_unicode;
use nano_chat::tokenizer::{Strategy, TokenScore, TokenType, Vocab};
use nano_chat::{
    CancellationToken, ChatTemplate, Error, ExtendingMethod, FinishReason, GenerationConfig,
    ModelConfig, NullStreamer, Pipeline, Processor, SamplingConfig, Streamer, Transformer,
};

fn test_device() -> Device {
    Device::Cpu
}

fn tiny_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 130,
        hidden_size: 32,
        intermediate_size: 64,
        num_hidden_layers: 2,
        num_attention_heads: 4,
        num_key_value_heads: 2,
        max_length: 64,
        chat_template: ChatTemplate::Plain,
        bos_token_id: Some(128),
        eos_token_id: Some(129),
        ..ModelConfig::default()
    }
}

/// No bos/eos and no control pieces: generation only stops on length or abort.
fn open_ended_config() -> ModelConfig {
    ModelConfig {
        bos_token_id: None,
        eos_token_id: None,
        ..tiny_config()
    }
}

/// Byte-level vocabulary of 130 pieces (id = byte for ASCII).
fn processor(with_controls: bool) -> Processor {
    let table = byte_to_unicode();
    let mut tokens: Vec<TokenScore> = (0u8..130)
        .map(|b| TokenScore::normal(table[b as usize].to_string()))
        .collect();
    tokens[0] = TokenScore::new("<unk>", 0.0, TokenType::Unknown);
    if with_controls {
        tokens[128] = TokenScore::new("<s>", 0.0, TokenType::Control);
        tokens[129] = TokenScore::new("</s>", 0.0, TokenType::Control);
    }
    Processor::new(Strategy::BpeV2, Vocab::new(tokens))
}

fn pipeline(config: &ModelConfig) -> Pipeline {
    let model = Transformer::new_random(config, &test_device()).unwrap();
    Pipeline::new(model, processor(config.eos_token_id.is_some())).unwrap()
}

/// Two pipelines over the same weights.
fn twin_pipelines(config: &ModelConfig) -> (Pipeline, Pipeline) {
    let device = test_device();
    let weights = random_weights(config, &device).unwrap();
    let build = |weights| {
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = Transformer::new(config, vb).unwrap();
        Pipeline::new(model, processor(config.eos_token_id.is_some())).unwrap()
    };
    (build(weights.clone()), build(weights))
}

fn history(msgs: &[&str]) -> Vec<String> {
    msgs.iter().map(|s| s.to_string()).collect()
}

fn seeded(max_length: usize, max_context_length: usize, seed: u64) -> GenerationConfig {
    GenerationConfig {
        max_length,
        max_context_length,
        sampling: SamplingConfig {
            do_sample: true,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            seed: Some(seed),
        },
        num_threads: 0,
    }
}

/// Counts calls; optionally cancels after a number of `put`s.
#[derive(Default)]
struct CountingStreamer {
    puts: Rc<Cell<usize>>,
    ends: Rc<Cell<usize>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl Streamer for CountingStreamer {
    fn put(&mut self, _ids: &[u32]) {
        self.puts.set(self.puts.get() + 1);
        if let Some((limit, token)) = &self.cancel_after {
            if self.puts.get() >= *limit {
                token.cancel();
            }
        }
    }

    fn end(&mut self) {
        self.ends.set(self.ends.get() + 1);
    }
}

#[test]
fn test_shift_scenario_at_full_context() {
    let config = ModelConfig {
        hidden_size: 16,
        intermediate_size: 32,
        num_hidden_layers: 1,
        num_attention_heads: 2,
        num_key_value_heads: 1,
        max_length: 2048,
        ..tiny_config()
    };
    let mut p = pipeline(&config);
    p.set_extending_method(ExtendingMethod::Shift);
    p.set_shift_keep(Some(4));
    let gen = GenerationConfig::greedy(1, 2048);
    let cancel = CancellationToken::new();

    // bos + 2039 single-byte ids
    let first = "a".repeat(2039);
    p.chat(&[first.clone()], &gen, &mut NullStreamer, &cancel).unwrap();
    assert_eq!(p.n_past(), 2040);

    // 16 incoming ids: 2040 + 16 - 2048 = 8 positions evicted after the first 4,
    // the least that keeps the context within 2048
    let msgs = vec![first, "x".to_string(), "b".repeat(16)];
    p.chat(&msgs, &gen, &mut NullStreamer, &cancel).unwrap();

    assert_eq!(p.n_past(), 2048);
    assert_eq!(p.n_past_offset(), 8);
    assert_eq!(p.stats().shifts, 1);
    assert_eq!(&p.cached_tokens()[..4], &[128, 97, 97, 97]);
    assert!(p.cached_tokens()[2032..].iter().all(|&t| t == 98));
}

#[test]
fn test_shift_during_decode_keeps_system_prompt() {
    let mut p = pipeline(&open_ended_config());
    p.set_extending_method(ExtendingMethod::Shift);
    p.set_system_prompt("sys");
    let gen = GenerationConfig::greedy(40, 16);

    let out = p
        .chat(&history(&["hello"]), &gen, &mut NullStreamer, &CancellationToken::new())
        .unwrap();

    assert_eq!(out.finish_reason, FinishReason::Length);
    assert_eq!(out.ids.len(), 40);
    // 4 prefix ("sys\n") + 5 prompt + 39 fed-back ids
    assert_eq!(p.n_past() + p.n_past_offset(), 48);
    assert!(p.n_past() <= 16);
    assert_eq!(&p.cached_tokens()[..4], &[b's' as u32, b'y' as u32, b's' as u32, 10]);
    assert!(p.stats().shifts > 0);
}

#[test]
fn test_restart_during_decode_stays_in_context() {
    let mut p = pipeline(&open_ended_config());
    p.set_extending_method(ExtendingMethod::Restart);
    let gen = GenerationConfig::greedy(40, 16);

    let out = p
        .chat(&history(&["hello"]), &gen, &mut NullStreamer, &CancellationToken::new())
        .unwrap();

    assert_eq!(out.ids.len(), 40);
    assert!(p.stats().restarts > 0);
    assert!(p.n_past() <= 16);
    assert_eq!(p.n_past_offset(), 0);
    assert_eq!(p.n_past(), p.cached_tokens().len());
}

#[test]
fn test_restart_on_prompt_overflow_re_encodes_history() {
    let mut p = pipeline(&tiny_config());
    let gen = GenerationConfig::greedy(1, 24);
    let cancel = CancellationToken::new();

    p.chat(&history(&["0123456789"]), &gen, &mut NullStreamer, &cancel).unwrap();
    assert_eq!(p.n_past(), 11);

    // 11 cached + 14 incoming overflow a context of 24
    let msgs = history(&["0123456789", "ok", "abcdefghijklmn"]);
    p.chat(&msgs, &gen, &mut NullStreamer, &cancel).unwrap();

    assert_eq!(p.stats().restarts, 1);
    // The oldest round no longer fits half the context: bos + newest turn.
    assert_eq!(p.tokenizer().history_offset(), 2);
    assert_eq!(p.n_past(), 15);
    assert_eq!(p.cached_tokens()[0], 128);
}

#[test]
fn test_restart_is_deterministic_with_seed() {
    let mut p = pipeline(&tiny_config());
    let gen = seeded(8, 64, 1234);
    let h = history(&["tell me"]);

    let first = p.chat(&h, &gen, &mut NullStreamer, &CancellationToken::new()).unwrap();
    let n_past = p.n_past();
    p.restart().unwrap();
    assert_eq!(p.n_past(), 0);
    assert_eq!(p.state(), PipelineState::Idle);

    let second = p.chat(&h, &gen, &mut NullStreamer, &CancellationToken::new()).unwrap();
    assert_eq!(first.ids, second.ids);
    assert_eq!(first.text, second.text);
    assert_eq!(p.n_past(), n_past);
}

#[test]
fn test_pipeline_seed_used_without_call_seed() {
    let (mut a, mut b) = twin_pipelines(&tiny_config());
    a.seed(99);
    b.seed(99);
    let gen = GenerationConfig {
        sampling: SamplingConfig {
            seed: None,
            ..seeded(6, 64, 0).sampling
        },
        ..seeded(6, 64, 0)
    };
    let h = history(&["same"]);

    let x = a.chat(&h, &gen, &mut NullStreamer, &CancellationToken::new()).unwrap();
    let y = b.chat(&h, &gen, &mut NullStreamer, &CancellationToken::new()).unwrap();
    assert_eq!(x.ids, y.ids);
}

#[test]
fn test_cancel_before_first_token() {
    let mut p = pipeline(&tiny_config());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut streamer = CountingStreamer::default();
    let ends = streamer.ends.clone();

    let out = p
        .chat(&history(&["hi"]), &GenerationConfig::greedy(8, 64), &mut streamer, &cancel)
        .unwrap();

    assert_eq!(out.finish_reason, FinishReason::Aborted);
    assert!(out.ids.is_empty());
    assert_eq!(ends.get(), 1);
    // The prompt stays cached for the next turn.
    assert_eq!(p.n_past(), 3);
}

#[test]
fn test_cancel_mid_generation() {
    let mut p = pipeline(&open_ended_config());
    let cancel = CancellationToken::new();
    let mut streamer = CountingStreamer {
        cancel_after: Some((2, cancel.clone())),
        ..CountingStreamer::default()
    };
    let puts = streamer.puts.clone();
    let ends = streamer.ends.clone();

    let out = p
        .chat(&history(&["hi"]), &GenerationConfig::greedy(32, 64), &mut streamer, &cancel)
        .unwrap();

    assert_eq!(out.finish_reason, FinishReason::Aborted);
    assert_eq!(out.ids.len(), 2);
    assert_eq!(puts.get(), 2);
    assert_eq!(ends.get(), 1);
}

#[test]
fn test_end_called_once_on_error() {
    let mut p = pipeline(&tiny_config());
    let mut streamer = CountingStreamer::default();
    let ends = streamer.ends.clone();

    let err = p
        .chat(
            &history(&["a", "b"]),
            &GenerationConfig::greedy(4, 64),
            &mut streamer,
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(ends.get(), 1);
    assert!(!p.is_invalidated());
}

#[test]
fn test_generation_config_validated() {
    let mut p = pipeline(&tiny_config());
    let cancel = CancellationToken::new();
    let too_long = GenerationConfig::greedy(4, 65);
    assert!(matches!(
        p.chat(&history(&["hi"]), &too_long, &mut NullStreamer, &cancel),
        Err(Error::Config(_))
    ));
    let zero = GenerationConfig::greedy(4, 0);
    assert!(matches!(
        p.chat(&history(&["hi"]), &zero, &mut NullStreamer, &cancel),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_zero_max_length_generates_nothing() {
    let mut p = pipeline(&open_ended_config());
    let mut streamer = CountingStreamer::default();
    let puts = streamer.puts.clone();
    let ends = streamer.ends.clone();

    let err = p
        .chat(
            &history(&["hi"]),
            &GenerationConfig::greedy(0, 64),
            &mut streamer,
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(puts.get(), 0);
    assert_eq!(ends.get(), 1);
    assert_eq!(p.n_past(), 0);
}

#[test]
fn test_streamed_text_matches_output() {
    let mut p = pipeline(&open_ended_config());
    let mut streamed = String::new();
    let out = {
        let mut streamer = p.text_streamer(|s: &str| streamed.push_str(s));
        p.chat(
            &history(&["hi"]),
            &GenerationConfig::greedy(12, 64),
            &mut streamer,
            &CancellationToken::new(),
        )
        .unwrap()
    };
    assert_eq!(streamed, out.text);
}

#[test]
fn test_session_round_trip_and_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.session");
    let config = tiny_config();
    let (mut a, mut b) = twin_pipelines(&config);
    let gen = GenerationConfig::greedy(4, 64);
    let cancel = CancellationToken::new();

    let first = a.chat(&history(&["hello"]), &gen, &mut NullStreamer, &cancel).unwrap();
    a.save_session(&path).unwrap();
    let saved_tokens = a.cached_tokens().to_vec();

    b.load_session(&path).unwrap();
    assert_eq!(b.n_past(), a.n_past());
    assert_eq!(b.n_past_offset(), a.n_past_offset());
    assert_eq!(b.cached_tokens(), saved_tokens.as_slice());

    let next = history(&["hello", &first.text, "again"]);
    let x = a.chat(&next, &gen, &mut NullStreamer, &cancel).unwrap();
    let y = b.chat(&next, &gen, &mut NullStreamer, &cancel).unwrap();
    assert_eq!(x.ids, y.ids);

    // Restart replays the loaded session rather than clearing it.
    b.restart().unwrap();
    assert_eq!(b.cached_tokens(), saved_tokens.as_slice());
    assert_eq!(b.n_past(), saved_tokens.len());
}

#[test]
fn test_session_after_shift_restores_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shifted.session");
    let (mut a, mut b) = twin_pipelines(&open_ended_config());
    a.set_extending_method(ExtendingMethod::Shift);
    let cancel = CancellationToken::new();

    a.chat(&history(&["hello"]), &GenerationConfig::greedy(20, 16), &mut NullStreamer, &cancel)
        .unwrap();
    assert!(a.n_past_offset() > 0);
    a.save_session(&path).unwrap();
    b.load_session(&path).unwrap();
    assert_eq!(b.n_past_offset(), a.n_past_offset());

    let next = history(&["hello", "x", "go"]);
    let gen = GenerationConfig::greedy(3, 32);
    let x = a.chat(&next, &gen, &mut NullStreamer, &cancel).unwrap();
    let y = b.chat(&next, &gen, &mut NullStreamer, &cancel).unwrap();
    assert_eq!(x.ids, y.ids);
}

#[test]
fn test_session_from_other_model_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("two_layers.session");
    let mut a = pipeline(&tiny_config());
    a.chat(
        &history(&["hi"]),
        &GenerationConfig::greedy(2, 64),
        &mut NullStreamer,
        &CancellationToken::new(),
    )
    .unwrap();
    a.save_session(&path).unwrap();

    let mut one_layer = pipeline(&ModelConfig {
        num_hidden_layers: 1,
        ..tiny_config()
    });
    let err = one_layer.load_session(&path).unwrap_err();
    assert!(matches!(err, Error::Session(_)));
    assert_eq!(one_layer.n_past(), 0);
}

#[test]
fn test_encoder_model_rejected() {
    let config = ModelConfig {
        causal: false,
        cache_layout: nano_chat::config::CacheLayout::Cacheless,
        ..tiny_config()
    };
    let model = Transformer::new_random(&config, &test_device()).unwrap();
    assert!(matches!(
        Pipeline::new(model, processor(true)),
        Err(Error::Config(_))
    ));
}
