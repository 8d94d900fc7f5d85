//! Integration tests for LayerKVCache.

use candle_core::{DType, Device, Tensor};
use nano_chat::core::kv_cache::{KVCacheConfig, LayerKVCache};
use nano_chat::Error;

fn test_device() -> Device {
    Device::Cpu
}

fn test_config() -> KVCacheConfig {
    KVCacheConfig::new(
        16, // capacity
        2,  // num_kv_heads
        8,  // head_dim
    )
}

/// One row per position, filled with `pos * 10 + head`.
fn rows(positions: &[usize]) -> Tensor {
    let data: Vec<f32> = positions
        .iter()
        .flat_map(|&p| (0..2).flat_map(move |h| std::iter::repeat((p * 10 + h) as f32).take(8)))
        .collect();
    Tensor::from_vec(data, (positions.len(), 2, 8), &test_device()).unwrap()
}

fn head0(t: &Tensor) -> Vec<f32> {
    t.narrow(1, 0, 1)
        .unwrap()
        .narrow(2, 0, 1)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap()
}

#[test]
fn test_kv_cache_config() {
    let config = test_config();
    assert_eq!(config.capacity, 16);
    assert_eq!(config.num_kv_heads, 2);
    assert_eq!(config.head_dim, 8);

    // 16 * 2 * 8 * 4 bytes per buffer
    assert_eq!(config.buffer_size_bytes(), 1024);
    assert_eq!(config.with_dtype(DType::F16).buffer_size_bytes(), 512);
}

#[test]
fn test_layer_kv_cache_creation() {
    let cache = LayerKVCache::new(&test_config(), &test_device()).unwrap();
    assert_eq!(cache.capacity(), 16);
    assert_eq!(cache.len(), 0);
    assert!(cache.pending().is_none());
}

#[test]
fn test_append_in_chunks_matches_single_append() {
    let pos: Vec<usize> = (0..6).collect();

    let mut whole = LayerKVCache::new(&test_config(), &test_device()).unwrap();
    whole.append(0, &rows(&pos), &rows(&pos), &pos).unwrap();

    let mut chunked = LayerKVCache::new(&test_config(), &test_device()).unwrap();
    chunked.append(0, &rows(&pos[..2]), &rows(&pos[..2]), &pos[..2]).unwrap();
    chunked.append(2, &rows(&pos[2..5]), &rows(&pos[2..5]), &pos[2..5]).unwrap();
    chunked.append(5, &rows(&pos[5..]), &rows(&pos[5..]), &pos[5..]).unwrap();

    let a: Vec<f32> = whole.keys().unwrap().flatten_all().unwrap().to_vec1().unwrap();
    let b: Vec<f32> = chunked.keys().unwrap().flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(a, b);
    assert_eq!(whole.positions(), chunked.positions());
}

#[test]
fn test_fill_to_capacity_then_overflow() {
    let mut cache = LayerKVCache::new(&test_config(), &test_device()).unwrap();
    let pos: Vec<usize> = (0..16).collect();
    cache.append(0, &rows(&pos), &rows(&pos), &pos).unwrap();
    assert_eq!(cache.len(), 16);

    let err = cache.append(16, &rows(&[16]), &rows(&[16]), &[16]).unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)));
    assert_eq!(cache.len(), 16);
}

#[test]
fn test_shift_makes_room_at_capacity() {
    let mut cache = LayerKVCache::new(&test_config(), &test_device()).unwrap();
    let pos: Vec<usize> = (0..16).collect();
    cache.append(0, &rows(&pos), &rows(&pos), &pos).unwrap();

    cache.schedule_shift(4, 8).unwrap();
    let (k, _) = cache.append(8, &rows(&[16, 17]), &rows(&[16, 17]), &[16, 17]).unwrap();

    assert_eq!(cache.len(), 10);
    assert_eq!(cache.positions(), &[0, 1, 2, 3, 12, 13, 14, 15, 16, 17]);
    assert_eq!(
        head0(&k),
        vec![0.0, 10.0, 20.0, 30.0, 120.0, 130.0, 140.0, 150.0, 160.0, 170.0]
    );
}

#[test]
fn test_shift_preserves_both_heads() {
    let mut cache = LayerKVCache::new(&test_config(), &test_device()).unwrap();
    let pos: Vec<usize> = (0..5).collect();
    cache.append(0, &rows(&pos), &rows(&pos), &pos).unwrap();
    cache.schedule_shift(1, 2).unwrap();
    cache.apply_pending_shift().unwrap();

    let values = cache.values().unwrap();
    let head1: Vec<f32> = values
        .narrow(1, 1, 1)
        .unwrap()
        .narrow(2, 0, 1)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(head1, vec![1.0, 31.0, 41.0]);
}

#[test]
fn test_distances_among_retained_rows_unchanged() {
    let mut cache = LayerKVCache::new(&test_config(), &test_device()).unwrap();
    let pos: Vec<usize> = (0..10).collect();
    cache.append(0, &rows(&pos), &rows(&pos), &pos).unwrap();
    cache.schedule_shift(3, 4).unwrap();
    cache.apply_pending_shift().unwrap();

    let kept = cache.positions().to_vec();
    assert_eq!(kept, vec![0, 1, 2, 7, 8, 9]);
    // Rows keep their logical positions; new writes continue after them.
    cache.append(6, &rows(&[10]), &rows(&[10]), &[10]).unwrap();
    assert_eq!(cache.positions()[6] - cache.positions()[3], 3);
}

#[test]
fn test_zero_shift_is_noop() {
    let mut cache = LayerKVCache::new(&test_config(), &test_device()).unwrap();
    let pos = [0, 1, 2];
    cache.append(0, &rows(&pos), &rows(&pos), &pos).unwrap();
    cache.schedule_shift(1, 0).unwrap();
    assert!(cache.pending().is_none());
    assert_eq!(cache.len(), 3);
}

#[test]
fn test_reset_reuses_buffers() {
    let mut cache = LayerKVCache::new(&test_config(), &test_device()).unwrap();
    let pos = [0, 1, 2];
    cache.append(0, &rows(&pos), &rows(&pos), &pos).unwrap();
    cache.schedule_shift(0, 1).unwrap();
    cache.reset();

    assert!(cache.is_empty());
    assert!(cache.pending().is_none());
    let (k, _) = cache.append(0, &rows(&[5]), &rows(&[5]), &[5]).unwrap();
    assert_eq!(head0(&k), vec![50.0]);
}
