use crate::{CacheConfig, GenerateArgs, ParameterStore, Sampler, SamplerError, SamplerOutput};
use causal_lm::ParameterTree;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use tensor::Tensor;
use tokenizer::{VocabTxt, Vocabulary};
use toy_lm::{ToyConfig, ToyTransformer};

const PROMPTS: [&str; 2] = ["input string", "hello world"];

fn init_logger() {
    let _ = SimpleLogger::new().with_level(LevelFilter::Debug).init();
}

fn mock_vocab() -> VocabTxt {
    VocabTxt::new([
        "<pad>", "<s>", "</s>", "<unk>", "input", "string", "hello", "world", "Hello", "there",
        "!", "My", "name", "is", "Tunix",
    ])
    .unwrap()
}

fn toy(num_layers: usize) -> ToyTransformer {
    ToyTransformer::new(ToyConfig {
        num_layers,
        ..ToyConfig::new(mock_vocab().piece_count())
    })
    .unwrap()
}

fn sampler(capacity: usize, lora: bool) -> Sampler<ToyTransformer, VocabTxt> {
    init_logger();
    let model = toy(4);
    let base = model.init_params(0);
    let store = if lora {
        ParameterStore::with_adapter(base, model.init_lora(0))
    } else {
        ParameterStore::new(base)
    };
    Sampler::new(
        model,
        mock_vocab(),
        CacheConfig::new(capacity, 4, 4, 16).unwrap(),
        store,
    )
    .unwrap()
}

fn logits(output: &SamplerOutput) -> &[Tensor<f32>] {
    output.logits.as_deref().unwrap()
}

fn all_close(a: &[Tensor<f32>], b: &[Tensor<f32>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.all_close(b, 1e-1, 1e-1))
}

fn check_samples(max_prompt_length: Option<usize>, echo: bool) {
    let mut sampler = sampler(64, false);
    let voc = sampler.vocab().piece_count() as u32;

    let mut args = GenerateArgs::new(10).return_logits(true).echo(echo);
    if let Some(len) = max_prompt_length {
        args = args.max_prompt_length(len);
    }
    let result = sampler.generate(&PROMPTS, &args).unwrap();
    assert_eq!(logits(&result).len(), 2);
    assert_eq!(result.text.len(), 2);
    // 回显只包含真实的提示词，不含填充
    let prompt_len = match max_prompt_length {
        Some(len) => len.min(3),
        None => 3,
    };
    if echo {
        assert_eq!(logits(&result)[0].shape(), &[10 + prompt_len as u32, voc]);
        assert_eq!(result.tokens[0].len(), 10 + prompt_len);
    } else {
        assert_eq!(logits(&result)[0].shape(), &[10, voc]);
        assert_eq!(result.tokens[0].len(), 10);
    }

    let top_p = GenerateArgs::new(10).temperature(9.).top_p(0.95).echo(echo);
    let top_p_result = sampler.generate(&PROMPTS, &top_p).unwrap();
    assert_ne!(result.text, top_p_result.text);

    let top_p_result_2 = sampler.generate(&PROMPTS, &top_p.seed(42)).unwrap();
    assert_ne!(top_p_result.text, top_p_result_2.text);
}

#[test]
fn test_samples_full_prompt() {
    check_samples(None, false);
}

#[test]
fn test_samples_echo() {
    check_samples(Some(4), true);
}

#[test]
fn test_samples_padded() {
    check_samples(Some(4), false);
}

#[test]
fn test_samples_truncated() {
    check_samples(Some(1), false);
}

#[test]
fn test_truncation_keeps_tail() {
    let mut sampler = sampler(64, false);
    let args = GenerateArgs::new(2).max_prompt_length(2).echo(true);
    let result = sampler.generate(&PROMPTS, &args).unwrap();
    // "<s> input string" 截断为 "input string"
    assert_eq!(result.tokens[0][..2], [4, 5]);
    assert!(result.text[0].starts_with("input string"));
}

#[test]
fn test_echo_logits_aligned() {
    let mut sampler = sampler(64, false);
    let args = GenerateArgs::new(4).return_logits(true).echo(true);
    let result = sampler
        .generate(&["input string", "Hello there ! My name is"], &args)
        .unwrap();
    let voc = sampler.vocab().piece_count();
    // "input string" 左填充 4 个位置，另一条没有填充
    for (b, real) in [(0, 3), (1, 7)] {
        let rows = &logits(&result)[b];
        let tokens = &result.tokens[b];
        assert_eq!(rows.shape(), &[(real + 4) as u32, voc as u32]);
        assert_eq!(tokens.len(), real + 4);
        // 提示词与生成部分的交界处不重复
        assert_ne!(rows.select((real - 1) as _), rows.select(real as _));
        // 贪心生成时，每一行都给出了它所对应的词
        for r in real..real + 4 {
            assert_eq!(common::argmax(rows.select(r as _).as_slice()), tokens[r]);
        }
    }
    // 无填充时第一行没有来源，填零
    assert!(logits(&result)[1].select(0).as_slice().iter().all(|&x| x == 0.));
    // 有填充时第一行来自最后一个填充位置
    let padded = logits(&result)[0].select(0);
    assert!(padded.as_slice().iter().all(|x| x.is_finite()));
    assert!(padded.as_slice().iter().any(|&x| x != 0.));
}

#[test]
fn test_state_update() {
    let mut sampler = sampler(1024, false);
    let args = GenerateArgs::new(10).return_logits(true);
    let original = sampler.generate(&PROMPTS, &args).unwrap();

    let new_params = toy(4).init_params(42);
    sampler.replace_parameters(new_params).unwrap();
    let updated = sampler.generate(&PROMPTS, &args).unwrap();
    assert!(!all_close(logits(&original), logits(&updated)));
}

#[test]
fn test_lora_state_update() {
    let mut sampler = sampler(1024, true);
    let args = GenerateArgs::new(10).return_logits(true);
    let original = sampler.generate(&PROMPTS, &args).unwrap();

    // lora_b 初始为 0，加上扰动使新参数确实不同
    let new_lora = toy(4).init_lora(42).map_leaves(|_, t| t.map(|x| x + 0.1));
    sampler.replace_parameters(new_lora).unwrap();
    let updated = sampler.generate(&PROMPTS, &args).unwrap();
    assert!(!all_close(logits(&original), logits(&updated)));
    // 完整参数没有被替换
    assert_eq!(sampler.parameters().snapshot().parameters().base, &toy(4).init_params(0));
}

fn check_invalid_update(lora: bool, new_tree: ParameterTree) {
    let mut sampler = sampler(1024, lora);
    let args = GenerateArgs::new(4).return_logits(true);
    let before = sampler.generate(&PROMPTS, &args).unwrap();

    let err = sampler.replace_parameters(new_tree).unwrap_err();
    assert!(matches!(err, SamplerError::Structure(_)));
    assert!(err.to_string().contains("must have the same structure"));

    // 失败的替换不改变任何状态
    let after = sampler.generate(&PROMPTS, &args).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_invalid_state_update() {
    check_invalid_update(false, toy(6).init_params(42));
}

#[test]
fn test_invalid_lora_state_update() {
    check_invalid_update(true, toy(6).init_lora(42));
}

#[test]
fn test_deterministic() {
    let mut sampler = sampler(64, false);
    let args = GenerateArgs::new(10)
        .temperature(9.)
        .top_p(0.95)
        .seed(7)
        .return_logits(true);
    let a = sampler.generate(&PROMPTS, &args).unwrap();
    let b = sampler.generate(&PROMPTS, &args).unwrap();
    assert_eq!(a, b);

    // 贪心解码与种子无关
    let greedy = GenerateArgs::new(10).return_logits(true);
    let a = sampler.generate(&PROMPTS, &greedy.clone().seed(1)).unwrap();
    let b = sampler.generate(&PROMPTS, &greedy.seed(2)).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_batch_independent() {
    let mut sampler = sampler(64, false);
    let args = GenerateArgs::new(6).return_logits(true);
    let batched = sampler
        .generate(&["Hello there ! My name is", "hello world"], &args)
        .unwrap();
    // 批大小改变，缓存重新分配
    let alone = sampler.generate(&["hello world"], &args).unwrap();
    assert!(logits(&batched)[1].all_close(&logits(&alone)[0], 1e-4, 1e-4));
    assert_eq!(batched.tokens[1], alone.tokens[0]);
}

#[test]
fn test_sliding_window() {
    // 3 + 20 个位置超过了容量，缓存回绕
    let mut sampler = sampler(8, false);
    let args = GenerateArgs::new(20).return_logits(true);
    let a = sampler.generate(&PROMPTS, &args).unwrap();
    assert_eq!(logits(&a)[0].shape()[0], 20);
    assert!(logits(&a)
        .iter()
        .all(|t| t.as_slice().iter().all(|x| x.is_finite())));

    // 第 s 步的分布来自 t = 3 + s - 1 的解码，t < 8 时窗口内没有被淘汰的位置
    let mut large = self::sampler(64, false);
    let b = large.generate(&PROMPTS, &args).unwrap();
    let (a, b) = (&logits(&a)[0], &logits(&b)[0]);
    for s in 0..6 {
        assert!(a.select(s).all_close(&b.select(s), 1e-4, 1e-4));
    }
    // t = 8 起 BOS 移出窗口，之后的分布随之改变
    for s in 6..20 {
        assert!(!a.select(s).all_close(&b.select(s), 1e-4, 1e-4));
    }
}

#[test]
fn test_invalid_arguments() {
    let mut sampler = sampler(64, false);
    let empty: [&str; 0] = [];
    assert!(matches!(
        sampler.generate(&empty, &GenerateArgs::new(1)),
        Err(SamplerError::InvalidArgument(_))
    ));
    assert!(matches!(
        sampler.generate(&PROMPTS, &GenerateArgs::new(0)),
        Err(SamplerError::InvalidArgument(_))
    ));
    assert!(matches!(
        sampler.generate(&PROMPTS, &GenerateArgs::new(1).max_prompt_length(0)),
        Err(SamplerError::InvalidArgument(_))
    ));

    let model = toy(4);
    let store = ParameterStore::new(model.init_params(0));
    let config = CacheConfig::new(64, 6, 4, 16).unwrap();
    assert!(matches!(
        Sampler::new(model, mock_vocab(), config, store),
        Err(SamplerError::Config(_))
    ));
}
