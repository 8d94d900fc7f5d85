//! Integration tests for the positional strategies.

use candle_core::{Device, Tensor};
use nano_chat::attention::{AlibiBias, LognScaling, RotaryEmbedding};
use nano_chat::RopeScaling;

fn test_device() -> Device {
    Device::Cpu
}

/// `q . k` after rotating q to `pos_q` and k to `pos_k`.
fn rotated_score(rope: &RotaryEmbedding, q: &Tensor, k: &Tensor, pos_q: usize, pos_k: usize) -> f32 {
    let (q_rot, _) = rope.apply(q, q, &[pos_q]).unwrap();
    let (_, k_rot) = rope.apply(k, k, &[pos_k]).unwrap();
    (q_rot * k_rot)
        .unwrap()
        .sum_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

#[test]
fn test_rope_score_depends_on_distance_only() {
    let device = test_device();
    let rope = RotaryEmbedding::new(8, 10000.0, RopeScaling::None);
    let q = Tensor::randn(0.0f32, 1.0, (1, 1, 8), &device).unwrap();
    let k = Tensor::randn(0.0f32, 1.0, (1, 1, 8), &device).unwrap();

    let near = rotated_score(&rope, &q, &k, 7, 3);
    let shifted = rotated_score(&rope, &q, &k, 107, 103);
    assert!((near - shifted).abs() < 1e-3);
}

#[test]
fn test_mixed_ntk_damps_low_frequencies() {
    let plain = RotaryEmbedding::new(8, 10000.0, RopeScaling::None).inv_freq(1);
    let mixed = RotaryEmbedding::new(
        8,
        10000.0,
        RopeScaling::NtkMixed {
            factor: 4.0,
            power: 1.0,
        },
    )
    .inv_freq(1);

    for (p, m) in plain.iter().zip(&mixed) {
        assert!(m < p);
    }
    // The last frequency is divided by the full factor.
    assert!((plain[3] / mixed[3] - 4.0).abs() < 1e-9);
}

#[test]
fn test_su_table_chosen_from_configured_length() {
    let scaling = RopeScaling::Su {
        original_max_position_embeddings: 8,
        scaling_factor: 1.0,
        short_factor: vec![1.0, 2.0],
        long_factor: vec![4.0, 8.0],
    };
    let base = RotaryEmbedding::new(4, 10000.0, RopeScaling::None).inv_freq(1);
    let short = RotaryEmbedding::new(4, 10000.0, scaling.clone()).with_max_length(8);
    let long = RotaryEmbedding::new(4, 10000.0, scaling).with_max_length(4096);

    // Positions past the trained length keep the short table.
    assert!((short.inv_freq(100)[1] - base[1] / 2.0).abs() < 1e-12);
    // A long context uses the long table from the first position.
    assert!((long.inv_freq(1)[1] - base[1] / 8.0).abs() < 1e-12);
}

#[test]
fn test_dynamic_ntk_keeps_trained_range() {
    let base = RotaryEmbedding::new(8, 10000.0, RopeScaling::None).inv_freq(1);
    let rope = RotaryEmbedding::new(8, 10000.0, RopeScaling::NtkDynamic { trained_length: 16 });
    assert_eq!(rope.inv_freq(16), base);
    assert!(rope.inv_freq(64)[3] < base[3]);
}

#[test]
fn test_alibi_bias_is_linear_in_distance() {
    let alibi = AlibiBias::new(4, 8.0);
    let slope = alibi.slopes()[0];
    assert_eq!(alibi.bias(0, 10, 10), 0.0);
    assert!((alibi.bias(0, 10, 7) + 3.0 * slope).abs() < 1e-6);
    assert!((alibi.bias(0, 20, 17) - alibi.bias(0, 10, 7)).abs() < 1e-6);
}

#[test]
fn test_logn_scales_only_past_trained_length() {
    let device = test_device();
    let logn = LognScaling::new(4);
    let q = Tensor::ones((2, 1, 2), candle_core::DType::F32, &device).unwrap();

    let scaled: Vec<f32> = logn
        .apply(&q, &[3, 16])
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(&scaled[..2], &[1.0, 1.0]);
    assert!((scaled[2] - 2.0).abs() < 1e-6);
}
