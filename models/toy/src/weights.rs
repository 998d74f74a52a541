use crate::{kernel::mat_mul, ToyError, ToyTransformer};
use causal_lm::{ParameterTree, Parameters};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::borrow::Cow;
use tensor::{udim, Tensor};

/// 可以挂载低秩适配器的投影。
pub(crate) const ADAPTED: [&str; 4] = ["att_qkv", "att_o", "mlp_gate_up", "mlp_down"];

pub(crate) struct Weights<'a> {
    pub embed_tokens: &'a [f32],
    pub layers: Vec<LayerWeights<'a>>,
    pub lm_layernorm: &'a [f32],
    pub lm_head: &'a [f32],
}

pub(crate) struct LayerWeights<'a> {
    pub att_layernorm: &'a [f32],
    pub att_qkv: Cow<'a, [f32]>,
    pub att_o: Cow<'a, [f32]>,
    pub mlp_layernorm: &'a [f32],
    pub mlp_gate_up: Cow<'a, [f32]>,
    pub mlp_down: Cow<'a, [f32]>,
}

impl ToyTransformer {
    /// 每个投影的 `[输入, 输出]` 形状。
    fn projection(&self, name: &str) -> [udim; 2] {
        let c = &self.config;
        let (d, dh) = (c.hidden_size as udim, c.head_dim as udim);
        let (nh, nkvh) = (c.num_heads as udim, c.num_kv_heads as udim);
        let di = c.intermediate_size as udim;
        match name {
            "att_qkv" => [d, (nh + nkvh + nkvh) * dh],
            "att_o" => [nh * dh, d],
            "mlp_gate_up" => [d, di + di],
            "mlp_down" => [di, d],
            _ => unreachable!("unknown projection {name}"),
        }
    }

    /// 随机初始化全部参数。投影按 fan-in 缩放，使各层输出保持在 O(1)。
    pub fn init_params(&self, seed: u64) -> ParameterTree {
        let c = &self.config;
        let (voc, d) = (c.vocab_size as udim, c.hidden_size as udim);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut uniform = |shape: &[udim], a: f32| Tensor::from_fn(shape, |_| rng.gen_range(-a..a));
        let fan_in = |shape: &[udim]| (3. / shape[0] as f32).sqrt();
        let ones = |len: udim| Tensor::new(&[len], vec![1.; len as usize]);

        let mut tree = ParameterTree::new();
        tree.insert("embed_tokens", uniform(&[voc, d], 1.));
        for i in 0..c.num_layers {
            tree.insert(&format!("layers.{i}.att_layernorm"), ones(d));
            tree.insert(&format!("layers.{i}.mlp_layernorm"), ones(d));
            for name in ADAPTED {
                let shape = self.projection(name);
                tree.insert(&format!("layers.{i}.{name}"), uniform(&shape, fan_in(&shape)));
            }
        }
        tree.insert("lm_layernorm", ones(d));
        tree.insert("lm_head", uniform(&[d, voc], fan_in(&[d, voc])));
        tree
    }

    /// 为所有投影创建低秩适配器，`lora_b` 为零，因此初始时不改变模型输出。
    pub fn init_lora(&self, seed: u64) -> ParameterTree {
        let r = self.config.lora_rank as udim;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tree = ParameterTree::new();
        for i in 0..self.config.num_layers {
            for name in ADAPTED {
                let [din, dout] = self.projection(name);
                let a = (3. / din as f32).sqrt();
                tree.insert(
                    &format!("layers.{i}.{name}.lora_a"),
                    Tensor::from_fn(&[din, r], |_| rng.gen_range(-a..a)),
                );
                tree.insert(&format!("layers.{i}.{name}.lora_b"), Tensor::zeros(&[r, dout]));
            }
        }
        tree
    }

    /// 检查参数形状，并将适配器合并进投影。
    pub(crate) fn weights<'a>(&self, params: Parameters<'a>) -> Result<Weights<'a>, ToyError> {
        let c = &self.config;
        let (voc, d) = (c.vocab_size as udim, c.hidden_size as udim);
        let base = params.base;

        let layers = (0..c.num_layers)
            .map(|i| -> Result<LayerWeights<'a>, ToyError> {
                let adapted = |name: &str| {
                    let path = format!("layers.{i}.{name}");
                    let w = leaf(base, &path, &self.projection(name))?;
                    self.merge_lora(w, params.adapter, &path, self.projection(name))
                };
                Ok(LayerWeights {
                    att_layernorm: leaf(base, &format!("layers.{i}.att_layernorm"), &[d])?,
                    att_qkv: adapted("att_qkv")?,
                    att_o: adapted("att_o")?,
                    mlp_layernorm: leaf(base, &format!("layers.{i}.mlp_layernorm"), &[d])?,
                    mlp_gate_up: adapted("mlp_gate_up")?,
                    mlp_down: adapted("mlp_down")?,
                })
            })
            .collect::<Result<_, ToyError>>()?;

        Ok(Weights {
            embed_tokens: leaf(base, "embed_tokens", &[voc, d])?,
            layers,
            lm_layernorm: leaf(base, "lm_layernorm", &[d])?,
            lm_head: leaf(base, "lm_head", &[d, voc])?,
        })
    }

    /// W + (alpha / rank) · A · B
    fn merge_lora<'a>(
        &self,
        w: &'a [f32],
        adapter: Option<&ParameterTree>,
        path: &str,
        [din, dout]: [udim; 2],
    ) -> Result<Cow<'a, [f32]>, ToyError> {
        let Some(adapter) = adapter else {
            return Ok(Cow::Borrowed(w));
        };
        if adapter.get(path).is_none() {
            return Ok(Cow::Borrowed(w));
        }
        let r = self.config.lora_rank as udim;
        let a = leaf(adapter, &format!("{path}.lora_a"), &[din, r])?;
        let b = leaf(adapter, &format!("{path}.lora_b"), &[r, dout])?;

        let scale = self.config.lora_alpha / self.config.lora_rank as f32;
        let mut merged = w.to_vec();
        mat_mul(
            &mut merged,
            1.,
            a,
            b,
            scale,
            [din as usize, r as usize, dout as usize],
        );
        Ok(Cow::Owned(merged))
    }
}

fn leaf<'a>(tree: &'a ParameterTree, path: &str, shape: &[udim]) -> Result<&'a [f32], ToyError> {
    let t = tree
        .leaf(path)
        .ok_or_else(|| ToyError::MissingParameter(path.into()))?;
    if t.shape() != shape {
        return Err(ToyError::Shape {
            name: path.into(),
            expected: shape.to_vec(),
            actual: t.shape().to_vec(),
        });
    }
    Ok(t.as_slice())
}
