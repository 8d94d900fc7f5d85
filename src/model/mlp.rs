//! Feed-forward networks.
//!
//! Two shapes, selected by [`MlpKind`]:
//!
//! - **Gated** (SwiGLU when the activation is SiLU):
//!   `down_proj(act(gate_proj(x)) * up_proj(x))`.
//!   Reference: <https://arxiv.org/abs/2002.05202>
//! - **Plain**: `fc1(act(fc0(x)))`, as in GPT-NeoX/Roberta style blocks.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use crate::config::{Activation, MlpKind};

/// SiLU (Sigmoid Linear Unit) activation function.
///
/// Also known as Swish: `silu(x) = x * sigmoid(x)`
fn silu(x: &Tensor) -> Result<Tensor> {
    x.mul(&candle_nn::ops::sigmoid(x)?)
}

fn activate(activation: Activation, x: &Tensor) -> Result<Tensor> {
    match activation {
        Activation::Silu => silu(x),
        Activation::Gelu => x.gelu(),
        Activation::Relu => x.relu(),
    }
}

#[derive(Debug, Clone)]
enum Projections {
    Gated {
        gate_proj: Linear,
        up_proj: Linear,
        down_proj: Linear,
    },
    Plain {
        fc0: Linear,
        fc1: Linear,
    },
}

/// Feed-forward block of a transformer layer.
#[derive(Debug, Clone)]
pub struct Mlp {
    projections: Projections,
    activation: Activation,
    hidden_size: usize,
    intermediate_size: usize,
}

impl Mlp {
    /// Loads the projections of the given kind from a VarBuilder.
    ///
    /// # Arguments
    ///
    /// * `kind` - Gated (`gate_proj`/`up_proj`/`down_proj`) or plain (`fc0`/`fc1`)
    /// * `activation` - Activation applied to the gate (or first projection)
    /// * `hidden_size` - Input/output dimension
    /// * `intermediate_size` - Intermediate (expanded) dimension
    /// * `vb` - VarBuilder for loading weights
    pub fn new(
        kind: MlpKind,
        activation: Activation,
        hidden_size: usize,
        intermediate_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let projections = match kind {
            MlpKind::Gated => Projections::Gated {
                gate_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?,
                up_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?,
                down_proj: linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?,
            },
            MlpKind::Plain => Projections::Plain {
                fc0: candle_nn::linear(hidden_size, intermediate_size, vb.pp("fc0"))?,
                fc1: candle_nn::linear(intermediate_size, hidden_size, vb.pp("fc1"))?,
            },
        };

        Ok(Self {
            projections,
            activation,
            hidden_size,
            intermediate_size,
        })
    }

    /// Returns the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Returns the intermediate size.
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }

    /// Forward pass: `[..., hidden_size]` -> `[..., hidden_size]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.projections {
            Projections::Gated {
                gate_proj,
                up_proj,
                down_proj,
            } => {
                let gate = activate(self.activation, &gate_proj.forward(x)?)?;
                let up = up_proj.forward(x)?;
                down_proj.forward(&gate.mul(&up)?)
            }
            Projections::Plain { fc0, fc1 } => {
                let hidden = activate(self.activation, &fc0.forward(x)?)?;
                fc1.forward(&hidden)
            }
        }
    }
}

/// Tensor names and shapes an MLP of `kind` reads under `prefix`.
pub(crate) fn mlp_params(
    kind: MlpKind,
    prefix: &str,
    hidden_size: usize,
    intermediate_size: usize,
) -> Vec<(String, Vec<usize>)> {
    match kind {
        MlpKind::Gated => vec![
            (format!("{prefix}.gate_proj.weight"), vec![intermediate_size, hidden_size]),
            (format!("{prefix}.up_proj.weight"), vec![intermediate_size, hidden_size]),
            (format!("{prefix}.down_proj.weight"), vec![hidden_size, intermediate_size]),
        ],
        MlpKind::Plain => vec![
            (format!("{prefix}.fc0.weight"), vec![intermediate_size, hidden_size]),
            (format!("{prefix}.fc0.bias"), vec![intermediate_size]),
            (format!("{prefix}.fc1.weight"), vec![hidden_size, intermediate_size]),
            (format!("{prefix}.fc1.bias"), vec![hidden_size]),
        ],
    }
}
