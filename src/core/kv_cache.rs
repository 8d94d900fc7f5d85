//! Fixed-capacity KV cache owned by one attention layer.
//!
//! Each layer keeps two contiguous buffers of shape
//! `[capacity, num_kv_heads, head_dim]`. Rows `[0, len)` are live; rows are
//! written in place with `slice_set`, never reallocated.
//!
//! ## Shifting
//!
//! Evicting positions is a two-phase operation. [`LayerKVCache::schedule_shift`]
//! only records a [`ShiftPending`] descriptor. The next call to
//! [`LayerKVCache::append`] compacts the buffers first (the retained tail is
//! copied down to start right after the kept prefix) and only then writes the
//! new rows, so write offsets are always in post-shift coordinates.

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::error::{Error, Result};

/// Configuration for a layer's KV cache.
#[derive(Debug, Clone)]
pub struct KVCacheConfig {
    /// Number of positions the cache can hold.
    pub capacity: usize,
    /// Number of KV heads (for GQA, typically fewer than Q heads).
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Data type for cache tensors.
    pub dtype: DType,
}

impl KVCacheConfig {
    /// Create a new KV cache configuration.
    pub fn new(capacity: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            capacity,
            num_kv_heads,
            head_dim,
            dtype: DType::F32,
        }
    }

    /// Set the data type.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Size in bytes of one buffer (K or V).
    pub fn buffer_size_bytes(&self) -> usize {
        self.capacity * self.num_kv_heads * self.head_dim * self.dtype.size_in_bytes()
    }
}

/// A scheduled eviction, applied at the start of the next forward pass.
///
/// Rows `[keep, keep + shift)` of a cache holding `prior_total` rows are
/// discarded; rows `[keep + shift, prior_total)` move down to `keep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftPending {
    /// Rows preserved at the cache origin.
    pub keep: usize,
    /// Rows evicted after the kept prefix.
    pub shift: usize,
    /// Live rows when the shift was scheduled.
    pub prior_total: usize,
}

/// KV cache for a single attention layer.
#[derive(Debug)]
pub struct LayerKVCache {
    /// Key buffer: [capacity, num_kv_heads, head_dim]
    key_cache: Tensor,
    /// Value buffer: [capacity, num_kv_heads, head_dim]
    value_cache: Tensor,
    /// Logical (absolute) position of each live row.
    positions: Vec<usize>,
    /// Eviction waiting for the next forward pass.
    pending: Option<ShiftPending>,
    config: KVCacheConfig,
}

impl LayerKVCache {
    /// Create an empty cache.
    pub fn new(config: &KVCacheConfig, device: &Device) -> Result<Self> {
        let shape = (config.capacity, config.num_kv_heads, config.head_dim);
        let key_cache = Tensor::zeros(shape, config.dtype, device)?;
        let value_cache = Tensor::zeros(shape, config.dtype, device)?;

        Ok(Self {
            key_cache,
            value_cache,
            positions: Vec::with_capacity(config.capacity),
            pending: None,
            config: config.clone(),
        })
    }

    /// Number of live rows.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the cache holds no rows.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Maximum number of rows.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Logical position of each live row.
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// The eviction waiting for the next forward pass, if any.
    pub fn pending(&self) -> Option<ShiftPending> {
        self.pending
    }

    /// Live length once the pending shift (if any) has been applied.
    pub fn effective_len(&self) -> usize {
        match self.pending {
            Some(p) => p.prior_total - p.shift,
            None => self.len(),
        }
    }

    /// Live key rows `[len, num_kv_heads, head_dim]`.
    pub fn keys(&self) -> Result<Tensor> {
        Ok(self.key_cache.narrow(0, 0, self.len())?)
    }

    /// Live value rows `[len, num_kv_heads, head_dim]`.
    pub fn values(&self) -> Result<Tensor> {
        Ok(self.value_cache.narrow(0, 0, self.len())?)
    }

    /// Records an eviction to be applied before the next write.
    pub fn schedule_shift(&mut self, keep: usize, shift: usize) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::InvariantViolation(
                "a shift is already pending on this layer".into(),
            ));
        }
        let prior_total = self.len();
        if keep + shift > prior_total {
            return Err(Error::InvariantViolation(format!(
                "cannot shift {shift} rows after keeping {keep} from a cache of {prior_total}"
            )));
        }
        if shift > 0 {
            self.pending = Some(ShiftPending {
                keep,
                shift,
                prior_total,
            });
        }
        Ok(())
    }

    /// Compacts the buffers according to the pending shift and clears it.
    pub fn apply_pending_shift(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let ShiftPending {
            keep,
            shift,
            prior_total,
        } = pending;

        let tail = prior_total - keep - shift;
        if tail > 0 {
            // Copy out first: source and destination share storage.
            let k_tail = self.key_cache.narrow(0, keep + shift, tail)?.copy()?;
            let v_tail = self.value_cache.narrow(0, keep + shift, tail)?.copy()?;
            self.key_cache.slice_set(&k_tail, 0, keep)?;
            self.value_cache.slice_set(&v_tail, 0, keep)?;
        }
        self.positions.drain(keep..keep + shift);

        debug!(keep, shift, prior_total, len = self.len(), "applied kv shift");
        Ok(())
    }

    /// Writes `k`/`v` rows at `n_past` and returns the live keys and values.
    ///
    /// # Arguments
    ///
    /// * `n_past` - Caller's count of cached positions (post-shift)
    /// * `k` - New keys `[qlen, num_kv_heads, head_dim]`
    /// * `v` - New values `[qlen, num_kv_heads, head_dim]`
    /// * `positions` - Logical position of each new row
    pub fn append(
        &mut self,
        n_past: usize,
        k: &Tensor,
        v: &Tensor,
        positions: &[usize],
    ) -> Result<(Tensor, Tensor)> {
        self.apply_pending_shift()?;

        let qlen = k.dim(0)?;
        if n_past != self.len() {
            return Err(Error::InvariantViolation(format!(
                "n_past ({n_past}) does not match cached rows ({})",
                self.len()
            )));
        }
        if n_past + qlen > self.config.capacity {
            return Err(Error::InvariantViolation(format!(
                "cache overflow: {n_past} + {qlen} > capacity {}",
                self.config.capacity
            )));
        }
        if positions.len() != qlen {
            return Err(Error::InvariantViolation(format!(
                "{} positions given for {qlen} rows",
                positions.len()
            )));
        }

        let k = k.to_dtype(self.config.dtype)?.contiguous()?;
        let v = v.to_dtype(self.config.dtype)?.contiguous()?;
        self.key_cache.slice_set(&k, 0, n_past)?;
        self.value_cache.slice_set(&v, 0, n_past)?;
        self.positions.extend_from_slice(positions);

        Ok((self.keys()?, self.values()?))
    }

    /// Logically clears the cache; rows are overwritten by later writes.
    pub fn reset(&mut self) {
        self.positions.clear();
        self.pending = None;
    }

    /// Replaces the live rows with previously saved ones.
    pub fn restore(&mut self, keys: &Tensor, values: &Tensor, positions: Vec<usize>) -> Result<()> {
        let rows = keys.dim(0)?;
        let expected = (self.config.num_kv_heads, self.config.head_dim);
        if keys.dims() != values.dims()
            || keys.dims() != [rows, expected.0, expected.1].as_slice()
            || positions.len() != rows
            || rows > self.config.capacity
        {
            return Err(Error::Session(format!(
                "cache rows {:?} do not fit a layer of shape [{}, {}, {}]",
                keys.dims(),
                self.config.capacity,
                expected.0,
                expected.1
            )));
        }
        self.reset();
        if rows > 0 {
            let keys = keys.to_dtype(self.config.dtype)?.contiguous()?;
            let values = values.to_dtype(self.config.dtype)?.contiguous()?;
            self.key_cache.slice_set(&keys, 0, 0)?;
            self.value_cache.slice_set(&values, 0, 0)?;
        }
        self.positions = positions;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> KVCacheConfig {
        KVCacheConfig::new(
            8, // capacity
            2, // num_kv_heads
            4, // head_dim
        )
    }

    /// Rows whose every element equals the row's logical position.
    fn rows(positions: &[usize]) -> Tensor {
        let data: Vec<f32> = positions
            .iter()
            .flat_map(|&p| std::iter::repeat(p as f32).take(8))
            .collect();
        Tensor::from_vec(data, (positions.len(), 2, 4), &Device::Cpu).unwrap()
    }

    fn first_column(t: &Tensor) -> Vec<f32> {
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
        // 8 * 2 * 4 * 4 bytes
        assert_eq!(config.buffer_size_bytes(), 256);
    }

    #[test]
    fn test_append_and_views() {
        let mut cache = LayerKVCache::new(&test_config(), &Device::Cpu).unwrap();
        assert!(cache.is_empty());

        let pos = [0, 1, 2];
        let (k, v) = cache.append(0, &rows(&pos), &rows(&pos), &pos).unwrap();
        assert_eq!(k.dims(), &[3, 2, 4]);
        assert_eq!(v.dims(), &[3, 2, 4]);

        let (k, _) = cache.append(3, &rows(&[3]), &rows(&[3]), &[3]).unwrap();
        assert_eq!(first_column(&k), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(cache.positions(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_overflow_is_invariant_violation() {
        let mut cache = LayerKVCache::new(&test_config(), &Device::Cpu).unwrap();
        let pos: Vec<usize> = (0..6).collect();
        cache.append(0, &rows(&pos), &rows(&pos), &pos).unwrap();

        let more = [6, 7, 8];
        let err = cache.append(6, &rows(&more), &rows(&more), &more).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(cache.len(), 6);
    }

    #[test]
    fn test_n_past_mismatch() {
        let mut cache = LayerKVCache::new(&test_config(), &Device::Cpu).unwrap();
        let err = cache.append(2, &rows(&[2]), &rows(&[2]), &[2]).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_shift_applied_before_write() {
        let mut cache = LayerKVCache::new(&test_config(), &Device::Cpu).unwrap();
        let pos: Vec<usize> = (0..8).collect();
        cache.append(0, &rows(&pos), &rows(&pos), &pos).unwrap();

        cache.schedule_shift(2, 3).unwrap();
        assert_eq!(cache.len(), 8);
        assert_eq!(cache.effective_len(), 5);

        let (k, v) = cache.append(5, &rows(&[8, 9]), &rows(&[8, 9]), &[8, 9]).unwrap();
        assert!(cache.pending().is_none());
        assert_eq!(first_column(&k), vec![0.0, 1.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(first_column(&v), first_column(&k));
        assert_eq!(cache.positions(), &[0, 1, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_shift_validation() {
        let mut cache = LayerKVCache::new(&test_config(), &Device::Cpu).unwrap();
        let pos: Vec<usize> = (0..4).collect();
        cache.append(0, &rows(&pos), &rows(&pos), &pos).unwrap();

        assert!(cache.schedule_shift(2, 3).is_err());
        cache.schedule_shift(1, 1).unwrap();
        assert!(cache.schedule_shift(1, 1).is_err());
    }

    #[test]
    fn test_reset_and_restore() {
        let mut cache = LayerKVCache::new(&test_config(), &Device::Cpu).unwrap();
        let pos = [0, 1, 2];
        cache.append(0, &rows(&pos), &rows(&pos), &pos).unwrap();
        let saved_k = cache.keys().unwrap().copy().unwrap();
        let saved_v = cache.values().unwrap().copy().unwrap();

        cache.reset();
        assert!(cache.is_empty());

        cache.restore(&saved_k, &saved_v, pos.to_vec()).unwrap();
        assert_eq!(first_column(&cache.keys().unwrap()), vec![0.0, 1.0, 2.0]);

        let wrong = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            cache.restore(&wrong, &wrong, vec![0, 1]),
            Err(Error::Session(_))
        ));
    }
}
