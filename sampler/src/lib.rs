//! 自回归解码：左填充提示词、预填充 kv 缓存、逐步构造注意力掩码并按采样策略选词，
//! 以及在两次调用之间检查并替换模型参数。

#[macro_use]
extern crate log;

mod args;
mod decode;
mod error;
mod mask;
mod store;

#[cfg(test)]
mod tests;

pub use args::{GenerateArgs, SamplerOutput};
pub use causal_lm::{CacheConfig, ParameterTree, StructuralMismatch};
pub use decode::Sampler;
pub use error::SamplerError;
pub use mask::{compute_attention_mask, make_causal_attn_mask};
pub use sample::SamplingStrategy;
pub use store::{ParameterStore, Snapshot};
