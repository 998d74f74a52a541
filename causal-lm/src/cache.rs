use crate::CacheConfig;
use tensor::{udim, Tensor};

/// 每层的 kv 缓存，形状为 `batch x capacity x num_kv_heads x head_dim`。
#[derive(Clone, Debug)]
struct LayerCache {
    k: Tensor<f32>,
    v: Tensor<f32>,
}

/// 一层新产生的 kv，形状为 `batch x n x num_kv_heads x head_dim`。
#[derive(Clone, Debug)]
pub struct LayerWrite {
    /// 新的 key。
    pub k: Tensor<f32>,
    /// 新的 value。
    pub v: Tensor<f32>,
}

/// 固定容量的环形 kv 缓存，所有层共享一个写入游标。
///
/// 绝对位置 `pos` 保存在槽 `pos % capacity`，游标超过容量后最旧的位置被覆盖，
/// 因此任意时刻驻留的位置是 `[window_start(), time_step())`。
#[derive(Clone, Debug)]
pub struct KVCache {
    config: CacheConfig,
    batch: usize,
    layers: Vec<LayerCache>,
    time_step: usize,
}

/// 缓存写入错误。出错时缓存不会被修改。
#[derive(thiserror::Error, Clone, PartialEq, Eq, Debug)]
pub enum CacheError {
    /// 写入的层数与缓存不符。
    #[error("cache has {expected} layers but {actual} were written")]
    LayerCount {
        /// 缓存层数。
        expected: usize,
        /// 写入的层数。
        actual: usize,
    },
    /// 某层写入的形状不符。
    #[error("layer {layer} write has shape {actual:?}, expected {expected:?}")]
    Shape {
        /// 层序号。
        layer: usize,
        /// 期望的形状。
        expected: Vec<udim>,
        /// 实际的形状。
        actual: Vec<udim>,
    },
    /// 没有写入任何位置。
    #[error("cache write must cover at least one position")]
    Empty,
}

impl KVCache {
    /// 分配全零缓存，游标置 0。
    pub fn allocate(config: CacheConfig, batch: usize) -> Self {
        let shape = [
            batch as udim,
            config.capacity() as udim,
            config.num_kv_heads() as udim,
            config.head_dim() as udim,
        ];
        let layers = (0..config.num_layers())
            .map(|_| LayerCache {
                k: Tensor::zeros(&shape),
                v: Tensor::zeros(&shape),
            })
            .collect::<Vec<_>>();
        if let Some(LayerCache { k, .. }) = layers.first() {
            debug!(
                "allocate kv cache {shape:?} {} x {} layers, {} bytes",
                k.data_type(),
                layers.len(),
                layers.len() * 2 * k.bytes_len(),
            );
        }
        Self {
            config,
            batch,
            layers,
            time_step: 0,
        }
    }

    /// 清空内容并将游标归零，保留已分配的内存。
    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.k.as_mut_slice().fill(0.);
            layer.v.as_mut_slice().fill(0.);
        }
        self.time_step = 0;
    }

    /// 缓存配置。
    #[inline]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 批大小。
    #[inline]
    pub const fn batch_size(&self) -> usize {
        self.batch
    }

    /// 容量。
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.config.capacity()
    }

    /// 下一个写入的绝对位置。
    #[inline]
    pub const fn time_step(&self) -> usize {
        self.time_step
    }

    /// 仍然驻留在缓存中的最早绝对位置。
    #[inline]
    pub const fn window_start(&self) -> usize {
        self.time_step.saturating_sub(self.capacity())
    }

    /// 长度为 `seq_len` 的注意力窗口在当前游标处覆盖的第一个绝对位置。
    ///
    /// 窗口的最后一个位置是 `time_step`，即正在解码的位置。
    #[inline]
    pub const fn span_start(&self, seq_len: usize) -> usize {
        (self.time_step + 1).saturating_sub(seq_len)
    }

    /// 绝对位置对应的槽。
    #[inline]
    pub const fn slot(&self, pos: usize) -> usize {
        pos % self.capacity()
    }

    /// 为所有层写入 `n` 个新位置，然后将游标推进 `n`。
    ///
    /// 写入前检查全部层的形状，任何一层不符都不会修改缓存。
    pub fn write(&mut self, writes: &[LayerWrite]) -> Result<(), CacheError> {
        if writes.len() != self.layers.len() {
            return Err(CacheError::LayerCount {
                expected: self.layers.len(),
                actual: writes.len(),
            });
        }
        let n = writes[0].k.shape().get(1).copied().unwrap_or(0);
        if n == 0 {
            return Err(CacheError::Empty);
        }
        let expected = [
            self.batch as udim,
            n,
            self.config.num_kv_heads() as udim,
            self.config.head_dim() as udim,
        ];
        for (layer, write) in writes.iter().enumerate() {
            for t in [&write.k, &write.v] {
                if t.shape() != expected {
                    return Err(CacheError::Shape {
                        layer,
                        expected: expected.to_vec(),
                        actual: t.shape().to_vec(),
                    });
                }
            }
        }

        let n = n as usize;
        let cap = self.capacity();
        let row = self.config.num_kv_heads() * self.config.head_dim();
        for (cache, write) in self.layers.iter_mut().zip(writes) {
            for (dst, src) in [(&mut cache.k, &write.k), (&mut cache.v, &write.v)] {
                let dst = dst.as_mut_slice();
                let src = src.as_slice();
                for b in 0..self.batch {
                    for i in 0..n {
                        let slot = (self.time_step + i) % cap;
                        dst[(b * cap + slot) * row..][..row]
                            .copy_from_slice(&src[(b * n + i) * row..][..row]);
                    }
                }
            }
        }
        self.time_step += n;
        Ok(())
    }

    /// 读取 `layer` 层第 `batch` 个序列在绝对位置 `pos` 的 key 头。
    #[inline]
    pub fn key(&self, layer: usize, batch: usize, pos: usize, head: usize) -> &[f32] {
        let offset = self.offset(batch, pos, head);
        &self.layers[layer].k.as_slice()[offset..][..self.config.head_dim()]
    }

    /// 读取 `layer` 层第 `batch` 个序列在绝对位置 `pos` 的 value 头。
    #[inline]
    pub fn value(&self, layer: usize, batch: usize, pos: usize, head: usize) -> &[f32] {
        let offset = self.offset(batch, pos, head);
        &self.layers[layer].v.as_slice()[offset..][..self.config.head_dim()]
    }

    fn offset(&self, batch: usize, pos: usize, head: usize) -> usize {
        assert!(
            (self.window_start()..self.time_step).contains(&pos),
            "position {pos} is not resident in [{}, {})",
            self.window_start(),
            self.time_step,
        );
        let nkvh = self.config.num_kv_heads();
        ((batch * self.capacity() + self.slot(pos)) * nkvh + head) * self.config.head_dim()
    }
}
