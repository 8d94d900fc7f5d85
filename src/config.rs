//! Configuration types for nano-chat.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tokenizer::ChatTemplate;

/// Normalization used by the transformer blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    /// RMSNorm (weight only).
    RmsNorm,
    /// LayerNorm (weight and bias).
    LayerNorm,
}

/// Activation function of the feed-forward network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Silu,
    Gelu,
    Relu,
}

/// Shape of the feed-forward network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MlpKind {
    /// `down(act(gate(x)) * up(x))`.
    Gated,
    /// `fc1(act(fc0(x)))`.
    Plain,
}

/// Rescaling applied to rotary inverse frequencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RopeScaling {
    /// Plain RoPE.
    #[default]
    None,
    /// Dynamic NTK: the base grows once the sequence exceeds the trained length.
    NtkDynamic { trained_length: usize },
    /// Mixed NTK: per-frequency damping `exp(a * (i + 1)^power)` with `a = ln(factor) / (dim/2)^power`.
    NtkMixed { factor: f64, power: f64 },
    /// SU scaling: the long factor table applies when the configured
    /// `max_length` exceeds the trained length, the short one otherwise.
    /// `scaling_factor` multiplies the cos/sin tables.
    Su {
        original_max_position_embeddings: usize,
        #[serde(default = "default_su_scaling_factor")]
        scaling_factor: f64,
        short_factor: Vec<f32>,
        long_factor: Vec<f32>,
    },
}

fn default_su_scaling_factor() -> f64 {
    1.0
}

/// Positional encoding scheme of the attention layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PositionalConfig {
    /// Rotary embeddings applied to Q and K.
    Rotary {
        theta: f64,
        #[serde(default)]
        scaling: RopeScaling,
    },
    /// Linear distance bias added to the raw scores.
    Alibi { max_bias: f64 },
    /// Learned absolute table added to the input embeddings.
    LearnedAbsolute { max_positions: usize, pad_index: usize },
    /// No positional information.
    None,
}

impl Default for PositionalConfig {
    fn default() -> Self {
        Self::Rotary {
            theta: 10000.0,
            scaling: RopeScaling::None,
        }
    }
}

/// How an attention layer keeps keys and values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheLayout {
    /// Persistent cache sized by `max_length`.
    #[default]
    Full,
    /// Persistent cache; keys older than `window` positions are masked.
    SlidingWindow { window: usize },
    /// No cache; attention only over the current input (encoders).
    Cacheless,
}

impl CacheLayout {
    /// Whether the layout keeps a persistent cache.
    pub fn is_cached(&self) -> bool {
        !matches!(self, Self::Cacheless)
    }
}

/// Model configuration, embedded as JSON in the weight file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (MLP).
    pub intermediate_size: usize,
    /// Number of transformer layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of key-value heads (for GQA/MQA).
    pub num_key_value_heads: usize,
    /// Dimension per head; defaults to `hidden_size / num_attention_heads`.
    #[serde(default)]
    pub head_dim: Option<usize>,
    /// Cache capacity in positions.
    pub max_length: usize,
    /// Normalization kind.
    #[serde(default = "default_norm")]
    pub norm: NormKind,
    /// Normalization epsilon.
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    /// Feed-forward shape.
    #[serde(default = "default_mlp")]
    pub mlp: MlpKind,
    /// Feed-forward activation.
    #[serde(default = "default_activation")]
    pub activation: Activation,
    /// Whether q/k/v projections carry a bias.
    #[serde(default)]
    pub qkv_bias: bool,
    /// Whether the output projection carries a bias.
    #[serde(default)]
    pub o_bias: bool,
    /// Whether the LM head reuses the embedding matrix.
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Positional encoding.
    #[serde(default)]
    pub positional: PositionalConfig,
    /// Trained length for `log(pos)/log(trained)` query scaling.
    #[serde(default)]
    pub logn_trained_length: Option<usize>,
    /// Causal (decoder) or bidirectional (encoder) attention.
    #[serde(default = "default_causal")]
    pub causal: bool,
    /// Cache layout.
    #[serde(default)]
    pub cache_layout: CacheLayout,
    /// Fixed attention scale; defaults to `1/sqrt(head_dim)`.
    #[serde(default)]
    pub attn_scale: Option<f64>,
    /// Chat template tag.
    #[serde(default)]
    pub chat_template: ChatTemplate,
    /// Beginning-of-sequence token.
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    /// End-of-sequence token.
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    /// Padding token.
    #[serde(default)]
    pub pad_token_id: Option<u32>,
}

fn default_norm() -> NormKind {
    NormKind::RmsNorm
}

fn default_norm_eps() -> f64 {
    1e-5
}

fn default_mlp() -> MlpKind {
    MlpKind::Gated
}

fn default_activation() -> Activation {
    Activation::Silu
}

fn default_causal() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        // TinyLlama-1.1B defaults
        Self {
            vocab_size: 32000,
            hidden_size: 2048,
            intermediate_size: 5632,
            num_hidden_layers: 22,
            num_attention_heads: 32,
            num_key_value_heads: 4,
            head_dim: None,
            max_length: 2048,
            norm: NormKind::RmsNorm,
            norm_eps: 1e-5,
            mlp: MlpKind::Gated,
            activation: Activation::Silu,
            qkv_bias: false,
            o_bias: false,
            tie_word_embeddings: false,
            positional: PositionalConfig::default(),
            logn_trained_length: None,
            causal: true,
            cache_layout: CacheLayout::Full,
            attn_scale: None,
            chat_template: ChatTemplate::Llama2,
            bos_token_id: Some(1),
            eos_token_id: Some(2),
            pad_token_id: None,
        }
    }
}

impl ModelConfig {
    /// Dimension per head.
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    /// Number of query heads per KV head group (for GQA).
    pub fn num_kv_groups(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    /// Attention score scale.
    pub fn attn_scale(&self) -> f64 {
        self.attn_scale
            .unwrap_or_else(|| 1.0 / (self.head_dim() as f64).sqrt())
    }

    /// Rejects unsupported parameter combinations.
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.num_key_value_heads == 0 {
            return Err(Error::Config("head counts must be positive".into()));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(Error::Config(format!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({})",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.max_length == 0 {
            return Err(Error::Config("max_length must be positive".into()));
        }
        let head_dim = self.head_dim();
        match &self.positional {
            PositionalConfig::Rotary { scaling, .. } => {
                if head_dim % 2 != 0 {
                    return Err(Error::Config(format!(
                        "rotary embeddings need an even head_dim, got {head_dim}"
                    )));
                }
                if let RopeScaling::Su {
                    short_factor,
                    long_factor,
                    ..
                } = scaling
                {
                    if short_factor.len() != head_dim / 2 || long_factor.len() != head_dim / 2 {
                        return Err(Error::Config(format!(
                            "SU factor tables must have {} entries",
                            head_dim / 2
                        )));
                    }
                }
            }
            PositionalConfig::LearnedAbsolute {
                max_positions,
                pad_index,
            } => {
                if pad_index + self.max_length > *max_positions {
                    return Err(Error::Config(format!(
                        "learned position table ({max_positions}) shorter than max_length ({}) + pad_index ({pad_index})",
                        self.max_length
                    )));
                }
            }
            PositionalConfig::Alibi { .. } | PositionalConfig::None => {}
        }
        if self.cache_layout.is_cached() != self.causal {
            return Err(Error::Config(
                "causal attention requires a cache and bidirectional attention must be cacheless"
                    .into(),
            ));
        }
        if let CacheLayout::SlidingWindow { window } = self.cache_layout {
            if window == 0 {
                return Err(Error::Config("sliding window must be positive".into()));
            }
        }
        Ok(())
    }
}

/// Sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Sample from the distribution; `false` means arg-max.
    pub do_sample: bool,
    /// Temperature for sampling (1.0 = no change).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Fixed RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            do_sample: true,
            temperature: 0.7,
            top_k: 20,
            top_p: 0.7,
            seed: None,
        }
    }
}

/// Per-call generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of generated tokens.
    pub max_length: usize,
    /// Context length the extension policy keeps the cache within.
    pub max_context_length: usize,
    /// Sampling parameters.
    pub sampling: SamplingConfig,
    /// Threads handed to the tensor backend.
    pub num_threads: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 2048,
            max_context_length: 512,
            sampling: SamplingConfig::default(),
            num_threads: 0,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding with the given limits.
    pub fn greedy(max_length: usize, max_context_length: usize) -> Self {
        Self {
            max_length,
            max_context_length,
            sampling: SamplingConfig {
                do_sample: false,
                ..SamplingConfig::default()
            },
            num_threads: 1,
        }
    }

    /// Checks the limits against the model's cache capacity.
    pub fn validate(&self, model: &ModelConfig) -> Result<()> {
        if self.max_length == 0 {
            return Err(Error::Config("max_length must be positive".into()));
        }
        if self.max_context_length == 0 {
            return Err(Error::Config("max_context_length must be positive".into()));
        }
        if model.cache_layout.is_cached() && self.max_context_length > model.max_length {
            return Err(Error::Config(format!(
                "max_context_length ({}) exceeds the cache capacity ({})",
                self.max_context_length, model.max_length
            )));
        }
        Ok(())
    }
}

/// What the pipeline does when the context would overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtendingMethod {
    /// Evict the oldest positions after a kept prefix.
    Shift,
    /// Discard the cache and replay from the system prompt or checkpoint.
    #[default]
    Restart,
}

impl std::str::FromStr for ExtendingMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shift" => Ok(Self::Shift),
            "restart" => Ok(Self::Restart),
            other => Err(Error::Config(format!("unknown extending method: {other}"))),
        }
    }
}
