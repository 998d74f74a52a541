use crate::{
    compute_attention_mask, make_causal_attn_mask, GenerateArgs, ParameterStore, SamplerError,
    SamplerOutput,
};
use causal_lm::{CacheConfig, CausalLM, DecodeStep, KVCache, ParameterTree, Prefill};
use common::{slice, upos, utok};
use sample::RandomStream;
use std::time::Instant;
use tensor::{udim, Tensor};
use tokenizer::Vocabulary;

/// 自回归解码器。
///
/// 同一个实例不能被并发调用，[`Sampler::generate`] 需要 `&mut self`。
pub struct Sampler<M, V> {
    model: M,
    vocab: V,
    cache_config: CacheConfig,
    store: ParameterStore,
    cache: Option<KVCache>,
}

/// 编码并左填充后的一批提示词。
struct Batch {
    /// 每个提示词的真实词。
    prompts: Vec<Vec<utok>>,
    /// 填充后的公共长度。
    prompt_len: usize,
    /// `batch x prompt_len`
    tokens: Tensor<utok>,
    /// `batch x prompt_len`，填充位置为 0。
    positions: Tensor<upos>,
    /// `batch x (prompt_len + steps)`，`true` 为填充。
    padding: Tensor<bool>,
}

impl<M, V> Sampler<M, V>
where
    M: CausalLM,
    V: Vocabulary,
{
    /// 缓存的层数、头数和头维度必须与模型一致。
    pub fn new(
        model: M,
        vocab: V,
        cache_config: CacheConfig,
        store: ParameterStore,
    ) -> Result<Self, SamplerError> {
        cache_config.check_model(model.num_layers(), model.num_kv_heads(), model.head_dim())?;
        if vocab.piece_count() > model.vocab_size() {
            return Err(SamplerError::InvalidArgument(
                "vocabulary is larger than the model's output",
            ));
        }
        Ok(Self {
            model,
            vocab,
            cache_config,
            store,
            cache: None,
        })
    }

    #[inline]
    pub fn model(&self) -> &M {
        &self.model
    }

    #[inline]
    pub fn vocab(&self) -> &V {
        &self.vocab
    }

    #[inline]
    pub fn cache_config(&self) -> &CacheConfig {
        &self.cache_config
    }

    #[inline]
    pub fn parameters(&self) -> &ParameterStore {
        &self.store
    }

    /// 替换当前参数（有适配器时替换适配器），结构不一致时保持原状。
    #[inline]
    pub fn replace_parameters(&mut self, tree: ParameterTree) -> Result<(), SamplerError> {
        self.store.replace(tree).map_err(Into::into)
    }

    /// 为每个提示词生成 `total_generation_steps` 个词。
    pub fn generate<S: AsRef<str>>(
        &mut self,
        prompts: &[S],
        args: &GenerateArgs,
    ) -> Result<SamplerOutput, SamplerError> {
        if prompts.is_empty() {
            return Err(SamplerError::InvalidArgument("prompt list is empty"));
        }
        if args.total_generation_steps == 0 {
            return Err(SamplerError::InvalidArgument(
                "total_generation_steps must be positive",
            ));
        }
        if args.max_prompt_length == Some(0) {
            return Err(SamplerError::InvalidArgument(
                "max_prompt_length must be positive",
            ));
        }

        let steps = args.total_generation_steps;
        let strategy = args.strategy();
        let mut rng = match args.seed {
            Some(seed) => RandomStream::seeded(seed),
            None => RandomStream::from_entropy(),
        };

        let time = Instant::now();
        let Batch {
            prompts,
            prompt_len,
            tokens,
            positions,
            padding,
        } = self.tokenize(prompts, args.max_prompt_length, steps);
        let batch = prompts.len();
        let voc = self.model.vocab_size();
        let capacity = self.cache_config.capacity();
        info!("generate: batch = {batch}, prompt_len = {prompt_len}, steps = {steps}, {strategy:?}");
        debug!("tokenize {:?}", time.elapsed());

        let cache = match &mut self.cache {
            Some(cache) if cache.batch_size() == batch => {
                cache.reset();
                cache
            }
            slot => slot.insert(KVCache::allocate(self.cache_config, batch)),
        };
        let snapshot = self.store.snapshot();
        let params = snapshot.parameters();

        // 预填充
        let time = Instant::now();
        let input_mask = Tensor::from_fn(&[batch as _, prompt_len as _], |idx| {
            !padding.get(idx)
        });
        let mask = make_causal_attn_mask(&input_mask, capacity.max(prompt_len));
        trace!("prefill mask\n{mask}");
        let prefill = self
            .model
            .prefill(
                params,
                Prefill {
                    tokens: &tokens,
                    positions: &positions,
                    mask: &mask,
                },
            )
            .map_err(SamplerError::model)?;
        cache.write(&prefill.writes)?;
        debug!("prefill {:?}", time.elapsed());

        let mut generated = vec![Vec::with_capacity(steps); batch];
        let mut logits = vec![Vec::new(); if args.return_logits { batch } else { 0 }];
        if args.return_logits && args.echo {
            // 第 r 行是产生第 r 个词的分布，整体右移一行
            for (b, (logits, prompt)) in logits.iter_mut().zip(&prompts).enumerate() {
                let rows = &prefill.logits.as_slice()[b * prompt_len * voc..][..prompt_len * voc];
                let shifted = &rows[..(prompt_len - 1) * voc];
                match prompt_len - prompt.len() {
                    0 => {
                        logits.resize(voc, 0.);
                        logits.extend_from_slice(shifted);
                    }
                    offset => logits.extend_from_slice(&shifted[(offset - 1) * voc..]),
                }
            }
        }

        // 解码
        let time = Instant::now();
        let mut last = (0..batch)
            .flat_map(|b| {
                let rows = &prefill.logits.as_slice()[b * prompt_len * voc..][..prompt_len * voc];
                rows[(prompt_len - 1) * voc..].iter().copied()
            })
            .collect::<Vec<_>>();
        for step in 0..steps {
            let row = |b: usize| &slice!(last; voc; [b]);
            let next = (0..batch)
                .map(|b| strategy.select(row(b), &mut rng))
                .collect::<Vec<_>>();
            for (b, &tok) in next.iter().enumerate() {
                generated[b].push(tok);
                if let Some(logits) = logits.get_mut(b) {
                    logits.extend_from_slice(row(b));
                }
            }
            if step + 1 == steps {
                break;
            }

            let t = cache.time_step();
            let mask = compute_attention_mask(t, capacity, &padding);
            trace!("decode t = {t}, window starts at {}, mask\n{mask}", cache.window_start());
            let tokens = Tensor::new(&[batch as _, 1], next);
            let positions = Tensor::new(
                &[batch as _, 1],
                prompts.iter().map(|p| (p.len() + step) as upos).collect(),
            );
            let forward = self
                .model
                .decode_step(
                    params,
                    DecodeStep {
                        tokens: &tokens,
                        positions: &positions,
                        mask: &mask,
                        cache: &*cache,
                    },
                )
                .map_err(SamplerError::model)?;
            cache.write(&forward.writes)?;
            last = forward.logits.into_vec();
        }
        debug!("decode {:?}", time.elapsed());

        let tokens = if args.echo {
            prompts
                .into_iter()
                .zip(generated)
                .map(|(mut prompt, generated)| {
                    prompt.extend(generated);
                    prompt
                })
                .collect::<Vec<_>>()
        } else {
            generated
        };
        let text = tokens.iter().map(|t| self.vocab.decode(t)).collect();
        let logits = args.return_logits.then(|| {
            logits
                .into_iter()
                .map(|data| {
                    let rows = (data.len() / voc) as udim;
                    Tensor::new(&[rows, voc as _], data)
                })
                .collect()
        });
        Ok(SamplerOutput {
            text,
            tokens,
            logits,
        })
    }

    /// 编码、截断并左填充提示词。
    fn tokenize<S: AsRef<str>>(
        &self,
        prompts: &[S],
        max_prompt_length: Option<usize>,
        steps: usize,
    ) -> Batch {
        let bos = self.vocab.bos();
        let prompts = prompts
            .iter()
            .map(|p| {
                let mut tokens = vec![bos];
                tokens.extend(self.vocab.encode(p.as_ref()));
                if let Some(max) = max_prompt_length {
                    // 保留最近的词
                    tokens.drain(..tokens.len().saturating_sub(max));
                }
                tokens
            })
            .collect::<Vec<_>>();
        let prompt_len = max_prompt_length
            .unwrap_or_else(|| prompts.iter().map(Vec::len).max().unwrap_or(0));
        let total_len = prompt_len + steps;
        let batch = prompts.len() as udim;

        let pad = self.vocab.pad();
        let offset = |b: udim| prompt_len - prompts[b as usize].len();
        let tokens = Tensor::from_fn(&[batch, prompt_len as _], |idx| {
            let (b, i) = (idx[0], idx[1] as usize);
            i.checked_sub(offset(b))
                .map_or(pad, |i| prompts[b as usize][i])
        });
        let positions = Tensor::from_fn(&[batch, prompt_len as _], |idx| {
            let (b, i) = (idx[0], idx[1] as usize);
            i.checked_sub(offset(b)).map_or(0, |i| i as upos)
        });
        let padding = Tensor::from_fn(&[batch, total_len as _], |idx| {
            (idx[1] as usize) < offset(idx[0])
        });
        Batch {
            prompts,
            prompt_len,
            tokens,
            positions,
            padding,
        }
    }
}
