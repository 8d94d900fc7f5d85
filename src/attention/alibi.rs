//! ALiBi: attention with linear biases.
//!
//! Instead of rotating Q/K, each head adds `slope * (key_pos - query_pos)`
//! to its raw scores, so distant keys are penalized linearly.
//!
//! Reference: <https://arxiv.org/abs/2108.12409>

/// Per-head slopes for ALiBi.
#[derive(Debug, Clone)]
pub struct AlibiBias {
    slopes: Vec<f32>,
}

impl AlibiBias {
    /// Geometric slopes for `num_heads` heads.
    ///
    /// For a power-of-two head count the slopes are `2^(-max_bias * (h+1) / n)`.
    /// Otherwise the first `2^floor(log2(n))` heads use that sequence and the
    /// rest interleave a half-step sequence.
    pub fn new(num_heads: usize, max_bias: f64) -> Self {
        let n_floor = 1usize << (usize::BITS - 1 - num_heads.max(1).leading_zeros());
        let m0 = 2f64.powf(-max_bias / n_floor as f64);
        let m1 = 2f64.powf(-(max_bias / 2.0) / n_floor as f64);

        let slopes = (0..num_heads)
            .map(|h| {
                if h < n_floor {
                    m0.powi(h as i32 + 1) as f32
                } else {
                    m1.powi(2 * (h - n_floor) as i32 + 1) as f32
                }
            })
            .collect();
        Self { slopes }
    }

    /// Slope of each head.
    pub fn slopes(&self) -> &[f32] {
        &self.slopes
    }

    /// Bias for one head at a query/key distance.
    pub fn bias(&self, head: usize, query_pos: usize, key_pos: usize) -> f32 {
        self.slopes[head] * (key_pos as f32 - query_pos as f32)
    }
}
