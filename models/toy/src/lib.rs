//! 一个在 CPU 上运行的小型 decoder-only transformer（RMSNorm、RoPE、GQA、SwiGLU），
//! 支持低秩适配器，用于驱动解码器的测试和命令行。

#[macro_use]
extern crate log;

mod kernel;
mod weights;

use causal_lm::{CausalLM, DecodeStep, Forward, KVCache, LayerWrite, Parameters, Prefill};
use common::{upos, utok};
use itertools::izip;
use kernel::{gather, mat_mul, rms_norm, rotary_embedding, softmax, swiglu};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path};
use tensor::{udim, Tensor};
use weights::Weights;

/// 模型超参数。
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ToyConfig {
    pub vocab_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub rope_theta: f32,
    pub epsilon: f32,
    pub lora_rank: usize,
    pub lora_alpha: f32,
}

impl Default for ToyConfig {
    fn default() -> Self {
        Self {
            vocab_size: 0,
            num_layers: 4,
            num_heads: 4,
            num_kv_heads: 4,
            head_dim: 16,
            hidden_size: 16,
            intermediate_size: 32,
            rope_theta: 1e4,
            epsilon: 1e-6,
            lora_rank: 4,
            lora_alpha: 4.,
        }
    }
}

impl ToyConfig {
    #[inline]
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            ..Default::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ToyError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ToyError {
    #[error("failed to read model config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed model config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid model config: {0}")]
    Config(&'static str),
    #[error("parameter `{0}` not found")]
    MissingParameter(String),
    #[error("`{name}` has shape {actual:?}, expected {expected:?}")]
    Shape {
        name: String,
        expected: Vec<udim>,
        actual: Vec<udim>,
    },
    #[error("token {0} is out of vocabulary")]
    Token(utok),
    #[error("kv cache does not match the model")]
    Cache,
}

pub struct ToyTransformer {
    config: ToyConfig,
}

/// 一个查询可以看到的键。
#[derive(Clone, Copy, Debug)]
enum Key {
    /// 本次计算产生的第 i 个位置。
    Fresh(usize),
    /// 缓存中的绝对位置。
    Cached(usize),
}

/// 批中一个序列的计算任务。
struct Row<'a> {
    tokens: &'a [utok],
    positions: &'a [upos],
    keys: Vec<Vec<Key>>,
    cache: Option<(&'a KVCache, usize)>,
}

/// 一个序列的计算结果：logits 和每层新的 (k, v)。
type RowOutput = (Vec<f32>, Vec<(Vec<f32>, Vec<f32>)>);

impl ToyTransformer {
    pub fn new(config: ToyConfig) -> Result<Self, ToyError> {
        let c = &config;
        if [
            c.vocab_size,
            c.num_layers,
            c.num_heads,
            c.num_kv_heads,
            c.head_dim,
            c.hidden_size,
            c.intermediate_size,
            c.lora_rank,
        ]
        .contains(&0)
        {
            return Err(ToyError::Config("dimensions must be positive"));
        }
        if c.num_heads % c.num_kv_heads != 0 {
            return Err(ToyError::Config("num_heads must be a multiple of num_kv_heads"));
        }
        if c.head_dim % 2 != 0 {
            return Err(ToyError::Config("head_dim must be even"));
        }
        Ok(Self { config })
    }

    #[inline]
    pub fn config(&self) -> &ToyConfig {
        &self.config
    }

    fn check_shape(name: &str, t: &[udim], expected: &[udim]) -> Result<(), ToyError> {
        if t == expected {
            Ok(())
        } else {
            Err(ToyError::Shape {
                name: name.into(),
                expected: expected.to_vec(),
                actual: t.to_vec(),
            })
        }
    }

    fn check_tokens(&self, tokens: &Tensor<utok>) -> Result<(), ToyError> {
        match tokens
            .as_slice()
            .iter()
            .find(|&&t| t as usize >= self.config.vocab_size)
        {
            Some(&t) => Err(ToyError::Token(t)),
            None => Ok(()),
        }
    }

    fn run(&self, w: &Weights, n: usize, rows: Vec<Row>) -> Forward {
        let batch = rows.len();
        let outputs = rows
            .into_par_iter()
            .map(|row| self.forward_row(w, row))
            .collect::<Vec<_>>();

        let c = &self.config;
        let shape_kv = [
            batch as udim,
            n as udim,
            c.num_kv_heads as udim,
            c.head_dim as udim,
        ];
        let writes = (0..c.num_layers)
            .map(|layer| LayerWrite {
                k: Tensor::new(
                    &shape_kv,
                    outputs.iter().flat_map(|(_, kv)| kv[layer].0.iter().copied()).collect(),
                ),
                v: Tensor::new(
                    &shape_kv,
                    outputs.iter().flat_map(|(_, kv)| kv[layer].1.iter().copied()).collect(),
                ),
            })
            .collect();
        let logits = Tensor::new(
            &[batch as _, n as _, c.vocab_size as _],
            outputs.into_iter().flat_map(|(logits, _)| logits).collect(),
        );
        Forward { logits, writes }
    }

    fn forward_row(&self, w: &Weights, row: Row) -> RowOutput {
        let ToyConfig {
            vocab_size: voc,
            num_heads: nh,
            num_kv_heads: nkvh,
            head_dim: dh,
            hidden_size: d,
            intermediate_size: di,
            rope_theta: theta,
            epsilon,
            ..
        } = self.config;
        let Row {
            tokens,
            positions,
            keys,
            cache,
        } = row;
        let n = tokens.len();
        let dq = nh * dh;
        let dkv = nkvh * dh;
        let head_group = nh / nkvh;
        let head_div = (dh as f32).sqrt().recip();

        let mut x = vec![0.; n * d];
        let mut x1 = vec![0.; n * d];
        let mut qkv = vec![0.; n * (dq + dkv + dkv)];
        let mut o = vec![0.; n * dq];
        let mut gate_up = vec![0.; n * (di + di)];
        let mut gate = vec![0.; n * di];
        let mut up = vec![0.; n * di];
        let mut writes = Vec::with_capacity(w.layers.len());

        gather(&mut x, w.embed_tokens, tokens);
        for (layer, params) in w.layers.iter().enumerate() {
            rms_norm(&mut x1, &x, params.att_layernorm, epsilon);
            mat_mul(&mut qkv, 0., &x1, &params.att_qkv, 1., [n, d, dq + dkv + dkv]);

            let mut q = Vec::with_capacity(n * dq);
            let mut k = Vec::with_capacity(n * dkv);
            let mut v = Vec::with_capacity(n * dkv);
            for (row, &pos) in qkv.chunks_exact(dq + dkv + dkv).zip(positions) {
                let (q_, kv) = row.split_at(dq);
                let (k_, v_) = kv.split_at(dkv);
                let start = q.len();
                q.extend_from_slice(q_);
                rotary_embedding(&mut q[start..], dh, pos, theta);
                let start = k.len();
                k.extend_from_slice(k_);
                rotary_embedding(&mut k[start..], dh, pos, theta);
                v.extend_from_slice(v_);
            }

            let key = |key: Key, h: usize| match key {
                Key::Fresh(j) => &k[j * dkv + h * dh..][..dh],
                Key::Cached(p) => {
                    let (cache, b) = cache.expect("cached key without cache");
                    cache.key(layer, b, p, h)
                }
            };
            let value = |key: Key, h: usize| match key {
                Key::Fresh(j) => &v[j * dkv + h * dh..][..dh],
                Key::Cached(p) => {
                    let (cache, b) = cache.expect("cached value without cache");
                    cache.value(layer, b, p, h)
                }
            };

            o.fill(0.);
            for (i, keys) in keys.iter().enumerate() {
                for h in 0..nh {
                    let kvh = h / head_group;
                    let q = &q[i * dq + h * dh..][..dh];
                    let mut att = keys
                        .iter()
                        .map(|&kk| izip!(q, key(kk, kvh)).map(|(a, b)| a * b).sum::<f32>() * head_div)
                        .collect::<Vec<_>>();
                    softmax(&mut att);
                    let o = &mut o[i * dq + h * dh..][..dh];
                    for (&kk, &a) in izip!(keys, &att) {
                        izip!(&mut *o, value(kk, kvh)).for_each(|(o, v)| *o += a * v);
                    }
                }
            }
            mat_mul(&mut x, 1., &o, &params.att_o, 1., [n, dq, d]);

            rms_norm(&mut x1, &x, params.mlp_layernorm, epsilon);
            mat_mul(&mut gate_up, 0., &x1, &params.mlp_gate_up, 1., [n, d, di + di]);
            for (src, gate, up) in izip!(
                gate_up.chunks_exact(di + di),
                gate.chunks_exact_mut(di),
                up.chunks_exact_mut(di)
            ) {
                let (g, u) = src.split_at(di);
                gate.copy_from_slice(g);
                up.copy_from_slice(u);
            }
            swiglu(&mut gate, &up);
            mat_mul(&mut x, 1., &gate, &params.mlp_down, 1., [n, di, d]);

            writes.push((k, v));
        }

        let mut logits = vec![0.; n * voc];
        rms_norm(&mut x1, &x, w.lm_layernorm, epsilon);
        mat_mul(&mut logits, 0., &x1, w.lm_head, 1., [n, d, voc]);
        (logits, writes)
    }
}

impl CausalLM for ToyTransformer {
    type Error = ToyError;

    #[inline]
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }
    #[inline]
    fn num_layers(&self) -> usize {
        self.config.num_layers
    }
    #[inline]
    fn num_kv_heads(&self) -> usize {
        self.config.num_kv_heads
    }
    #[inline]
    fn head_dim(&self) -> usize {
        self.config.head_dim
    }

    fn prefill(&self, params: Parameters, query: Prefill) -> Result<Forward, Self::Error> {
        let &[batch, len] = query.tokens.shape() else {
            return Err(ToyError::Shape {
                name: "tokens".into(),
                expected: vec![],
                actual: query.tokens.shape().to_vec(),
            });
        };
        let target = query.mask.shape().get(2).copied().unwrap_or(0);
        Self::check_shape("positions", query.positions.shape(), &[batch, len])?;
        Self::check_shape("mask", query.mask.shape(), &[batch, len, target])?;
        self.check_tokens(query.tokens)?;
        let w = self.weights(params)?;
        trace!("toy prefill {batch} x {len}");

        let (len, target) = (len as usize, target as usize);
        let rows = (0..batch as usize)
            .map(|b| {
                let mask = &query.mask.as_slice()[b * len * target..][..len * target];
                Row {
                    tokens: &query.tokens.as_slice()[b * len..][..len],
                    positions: &query.positions.as_slice()[b * len..][..len],
                    keys: mask
                        .chunks_exact(target)
                        .map(|mask| {
                            (0..len.min(target))
                                .filter(|&j| mask[j])
                                .map(Key::Fresh)
                                .collect()
                        })
                        .collect(),
                    cache: None,
                }
            })
            .collect();
        Ok(self.run(&w, len, rows))
    }

    fn decode_step(&self, params: Parameters, query: DecodeStep) -> Result<Forward, Self::Error> {
        let cache = query.cache;
        let &[batch, 1] = query.tokens.shape() else {
            return Err(ToyError::Shape {
                name: "tokens".into(),
                expected: vec![cache.batch_size() as _, 1],
                actual: query.tokens.shape().to_vec(),
            });
        };
        let seq_len = query.mask.shape().get(2).copied().unwrap_or(0);
        Self::check_shape("positions", query.positions.shape(), &[batch, 1])?;
        Self::check_shape("mask", query.mask.shape(), &[batch, 1, seq_len])?;
        self.check_tokens(query.tokens)?;
        let config = cache.config();
        if cache.batch_size() != batch as usize
            || config.num_layers() != self.config.num_layers
            || config.num_kv_heads() != self.config.num_kv_heads
            || config.head_dim() != self.config.head_dim
        {
            return Err(ToyError::Cache);
        }
        let w = self.weights(params)?;

        let seq_len = seq_len as usize;
        let t = cache.time_step();
        let span = cache.span_start(seq_len);
        let resident = cache.window_start()..t;
        trace!("toy decode t = {t}, span = {span}");

        let rows = (0..batch as usize)
            .map(|b| {
                let mask = &query.mask.as_slice()[b * seq_len..][..seq_len];
                let keys = (0..seq_len)
                    .filter(|&k| mask[k])
                    .map(|k| span + k)
                    .filter_map(|p| {
                        if p == t {
                            Some(Key::Fresh(0))
                        } else if resident.contains(&p) {
                            Some(Key::Cached(p))
                        } else {
                            None
                        }
                    })
                    .collect();
                Row {
                    tokens: &query.tokens.as_slice()[b..][..1],
                    positions: &query.positions.as_slice()[b..][..1],
                    keys: vec![keys],
                    cache: Some((cache, b)),
                }
            })
            .collect();
        Ok(self.run(&w, 1, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causal_lm::{test_impl, ParameterTree};

    const VOC: usize = 14;

    fn model() -> ToyTransformer {
        ToyTransformer::new(ToyConfig::new(VOC)).unwrap()
    }

    fn prefill(
        model: &ToyTransformer,
        params: Parameters,
        tokens: Vec<utok>,
        positions: Vec<upos>,
        valid: &[bool],
    ) -> Forward {
        let len = tokens.len() as udim;
        let tokens = Tensor::new(&[1, len], tokens);
        let positions = Tensor::new(&[1, len], positions);
        let mask = Tensor::from_fn(&[1, len, len + 2], |idx| {
            idx[2] <= idx[1] && valid[idx[2] as usize]
        });
        model
            .prefill(
                params,
                Prefill {
                    tokens: &tokens,
                    positions: &positions,
                    mask: &mask,
                },
            )
            .unwrap()
    }

    #[test]
    fn test_shapes() {
        let model = model();
        let base = model.init_params(0);
        assert_eq!(base.leaves().len(), 3 + 6 * 4);
        let params = Parameters {
            base: &base,
            adapter: None,
        };
        let out = prefill(&model, params, vec![1, 4, 5], vec![0, 1, 2], &[true; 3]);
        assert_eq!(out.logits.shape(), &[1, 3, VOC as udim]);
        assert_eq!(out.writes.len(), 4);
        assert_eq!(out.writes[3].k.shape(), &[1, 3, 4, 16]);
        assert!(out.logits.as_slice().iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_decode_matches_prefill() {
        let model = model();
        let base = model.init_params(0);
        let params = Parameters {
            base: &base,
            adapter: None,
        };
        test_impl(&model, params, &[1, 4, 5, 6, 7, 8, 9], 8);

        let adapter = model.init_lora(1).map_leaves(|_, t| t.map(|x| x + 0.1));
        let params = Parameters {
            base: &base,
            adapter: Some(&adapter),
        };
        test_impl(&model, params, &[1, 6, 7, 2, 3], 5);
    }

    #[test]
    fn test_padding_ignored() {
        let model = model();
        let base = model.init_params(0);
        let params = Parameters {
            base: &base,
            adapter: None,
        };
        let plain = prefill(&model, params, vec![1, 4, 5], vec![0, 1, 2], &[true; 3]);
        let padded = prefill(
            &model,
            params,
            vec![0, 0, 1, 4, 5],
            vec![0, 0, 0, 1, 2],
            &[false, false, true, true, true],
        );
        for i in 0..3 {
            let a = plain.logits.select(0).select(i);
            let b = padded.logits.select(0).select(i + 2);
            assert!(a.all_close(&b, 1e-5, 1e-5));
        }
    }

    #[test]
    fn test_lora() {
        let model = model();
        let base = model.init_params(0);
        let plain = prefill(
            &model,
            Parameters {
                base: &base,
                adapter: None,
            },
            vec![1, 4, 5],
            vec![0, 1, 2],
            &[true; 3],
        );

        let lora = model.init_lora(0);
        assert!(lora.leaf("layers.0.att_qkv.lora_b").unwrap().as_slice().iter().all(|&x| x == 0.));
        let zero = prefill(
            &model,
            Parameters {
                base: &base,
                adapter: Some(&lora),
            },
            vec![1, 4, 5],
            vec![0, 1, 2],
            &[true; 3],
        );
        assert_eq!(plain.logits, zero.logits);

        let lora = lora.map_leaves(|_, t| t.map(|x| x + 0.1));
        let shifted = prefill(
            &model,
            Parameters {
                base: &base,
                adapter: Some(&lora),
            },
            vec![1, 4, 5],
            vec![0, 1, 2],
            &[true; 3],
        );
        assert!(!plain.logits.all_close(&shifted.logits, 1e-1, 1e-1));
    }

    #[test]
    fn test_errors() {
        let model = model();
        let empty = ParameterTree::new();
        let tokens = Tensor::new(&[1, 1], vec![1]);
        let positions = Tensor::new(&[1, 1], vec![0]);
        let mask = Tensor::new(&[1, 1, 1], vec![true]);
        let query = || Prefill {
            tokens: &tokens,
            positions: &positions,
            mask: &mask,
        };
        let params = Parameters {
            base: &empty,
            adapter: None,
        };
        assert!(matches!(
            model.prefill(params, query()),
            Err(ToyError::MissingParameter(name)) if name == "layers.0.att_layernorm"
        ));

        let base = model.init_params(0);
        let params = Parameters {
            base: &base,
            adapter: None,
        };
        let bad = Tensor::new(&[1, 1], vec![VOC as utok]);
        assert!(matches!(
            model.prefill(params, Prefill { tokens: &bad, ..query() }),
            Err(ToyError::Token(14))
        ));
        let bad = Tensor::new(&[1, 2], vec![0, 0]);
        assert!(matches!(
            model.prefill(params, Prefill { positions: &bad, ..query() }),
            Err(ToyError::Shape { .. })
        ));
    }

    #[test]
    fn test_config() {
        let config: ToyConfig =
            serde_json::from_str(r#"{"vocab_size": 32, "num_layers": 2}"#).unwrap();
        assert_eq!(config.num_layers, 2);
        assert_eq!(config.head_dim, 16);
        let model = ToyTransformer::new(config).unwrap();
        assert!(model.init_params(3).num_params() > 0);

        let mut config = ToyConfig::new(8);
        config.num_kv_heads = 3;
        assert!(matches!(ToyTransformer::new(config), Err(ToyError::Config(_))));
        assert!(matches!(
            ToyTransformer::new(ToyConfig::default()),
            Err(ToyError::Config(_))
        ));
    }
}
