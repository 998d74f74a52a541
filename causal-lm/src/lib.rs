//! 提供因果语言模型的特性定义，以及模型在解码中共享的 kv 缓存和参数树。

#![deny(warnings, missing_docs)]

#[macro_use]
extern crate log;

mod cache;
mod config;
mod params;

pub use cache::{CacheError, KVCache, LayerWrite};
pub use config::{CacheConfig, ConfigError};
pub use params::{ParamNode, ParameterTree, StructuralMismatch, StructureDiff};

use common::{upos, utok};
use tensor::Tensor;

/// 一次计算使用的参数。
#[derive(Clone, Copy, Debug)]
pub struct Parameters<'a> {
    /// 完整的模型参数。
    pub base: &'a ParameterTree,
    /// 可选的低秩适配器参数。
    pub adapter: Option<&'a ParameterTree>,
}

/// 对整个（左填充的）提示词的一次计算。
pub struct Prefill<'a> {
    /// 词 id，`batch x len`。
    pub tokens: &'a Tensor<utok>,
    /// 每个词的位置，`batch x len`。
    pub positions: &'a Tensor<upos>,
    /// 因果掩码，`batch x len x target_len`，第 `j` 列对应绝对位置 `j`。
    pub mask: &'a Tensor<bool>,
}

/// 每个序列解码一个新词。
pub struct DecodeStep<'a> {
    /// 词 id，`batch x 1`。
    pub tokens: &'a Tensor<utok>,
    /// 每个词的位置，`batch x 1`。
    pub positions: &'a Tensor<upos>,
    /// 增量掩码，`batch x 1 x seq_len`。
    ///
    /// 第 `k` 列对应绝对位置 `cache.span_start(seq_len) + k`，新词位于 `cache.time_step()`。
    pub mask: &'a Tensor<bool>,
    /// 已写入之前所有位置的缓存。
    pub cache: &'a KVCache,
}

/// 一次计算的结果。
pub struct Forward {
    /// `batch x n x vocab_size`。
    pub logits: Tensor<f32>,
    /// 每层新产生的 kv，由调用者写入缓存。
    pub writes: Vec<LayerWrite>,
}

/// 因果语言模型。
pub trait CausalLM {
    /// 计算中可能的错误。
    type Error: std::error::Error + Send + Sync + 'static;
    /// 词表大小。
    fn vocab_size(&self) -> usize;
    /// 层数。
    fn num_layers(&self) -> usize;
    /// kv 头数。
    fn num_kv_heads(&self) -> usize;
    /// 头维度。
    fn head_dim(&self) -> usize;
    /// 对提示词执行计算，返回所有位置的 logits。
    fn prefill(&self, params: Parameters, query: Prefill) -> Result<Forward, Self::Error>;
    /// 读取缓存，为每个序列计算一个新位置。
    fn decode_step(&self, params: Parameters, query: DecodeStep)
        -> Result<Forward, Self::Error>;
}

/// 测试模型实现：逐词解码得到的 logits 应与一次性计算整个序列的结果一致。
///
/// 缓存容量小于序列长度时，逐词解码只能看到最近 `capacity` 个位置，不再与整体计算可比，
/// 因此要求 `capacity >= prompt.len()`。
pub fn test_impl<M: CausalLM>(model: &M, params: Parameters, prompt: &[utok], capacity: usize) {
    let len = prompt.len();
    assert!(len >= 2 && capacity >= len);

    let tokens = Tensor::new(&[1, len as _], prompt.to_vec());
    let positions = Tensor::from_fn(&[1, len as _], |idx| idx[1]);
    let mask = Tensor::from_fn(&[1, len as _, len as _], |idx| idx[2] <= idx[1]);
    let full = model
        .prefill(
            params,
            Prefill {
                tokens: &tokens,
                positions: &positions,
                mask: &mask,
            },
        )
        .unwrap()
        .logits;
    assert_eq!(full.shape(), &[1, len as _, model.vocab_size() as _]);

    let config = CacheConfig::new(
        capacity,
        model.num_layers(),
        model.num_kv_heads(),
        model.head_dim(),
    )
    .unwrap();
    let mut cache = KVCache::allocate(config, 1);
    let first = model
        .prefill(
            params,
            Prefill {
                tokens: &Tensor::new(&[1, 1], vec![prompt[0]]),
                positions: &Tensor::new(&[1, 1], vec![0]),
                mask: &Tensor::new(&[1, 1, 1], vec![true]),
            },
        )
        .unwrap();
    cache.write(&first.writes).unwrap();

    for (t, &tok) in prompt.iter().enumerate().skip(1) {
        let mask = Tensor::from_fn(&[1, 1, capacity as _], |idx| idx[2] as usize <= t);
        let step = model
            .decode_step(
                params,
                DecodeStep {
                    tokens: &Tensor::new(&[1, 1], vec![tok]),
                    positions: &Tensor::new(&[1, 1], vec![t as _]),
                    mask: &mask,
                    cache: &cache,
                },
            )
            .unwrap();
        let expected = full.select(0).select(t as _);
        let actual = step.logits.select(0).select(0);
        assert!(
            actual.all_close(&expected, 1e-4, 1e-4),
            "decode logits diverge from prefill at position {t}"
        );
        cache.write(&step.writes).unwrap();
    }
}
