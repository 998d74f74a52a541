use common::utok;
use sample::SamplingStrategy;
use serde::{Deserialize, Serialize};
use tensor::Tensor;

/// 一次生成的参数。
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct GenerateArgs {
    pub total_generation_steps: usize,
    #[serde(default)]
    pub return_logits: bool,
    #[serde(default)]
    pub max_prompt_length: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
    /// 不指定时每次调用从系统熵源取种子。
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub echo: bool,
}

impl GenerateArgs {
    #[inline]
    pub fn new(total_generation_steps: usize) -> Self {
        Self {
            total_generation_steps,
            return_logits: false,
            max_prompt_length: None,
            temperature: None,
            top_p: None,
            top_k: None,
            seed: None,
            echo: false,
        }
    }

    #[inline]
    pub fn return_logits(self, return_logits: bool) -> Self {
        Self {
            return_logits,
            ..self
        }
    }

    #[inline]
    pub fn max_prompt_length(self, len: usize) -> Self {
        Self {
            max_prompt_length: Some(len),
            ..self
        }
    }

    #[inline]
    pub fn temperature(self, temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
            ..self
        }
    }

    #[inline]
    pub fn top_p(self, top_p: f32) -> Self {
        Self {
            top_p: Some(top_p),
            ..self
        }
    }

    #[inline]
    pub fn top_k(self, top_k: usize) -> Self {
        Self {
            top_k: Some(top_k),
            ..self
        }
    }

    #[inline]
    pub fn seed(self, seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..self
        }
    }

    #[inline]
    pub fn echo(self, echo: bool) -> Self {
        Self { echo, ..self }
    }

    #[inline]
    pub fn strategy(&self) -> SamplingStrategy {
        SamplingStrategy::new(self.temperature, self.top_k, self.top_p)
    }
}

/// 生成结果，顺序与输入的提示词一致。
#[derive(Clone, PartialEq, Debug)]
pub struct SamplerOutput {
    pub text: Vec<String>,
    pub tokens: Vec<Vec<utok>>,
    /// 每个序列一个 `n x vocab_size` 的张量。
    pub logits: Option<Vec<Tensor<f32>>>,
}

#[test]
fn test_args() {
    let args: GenerateArgs =
        serde_json::from_str(r#"{"total_generation_steps": 10, "temperature": 9, "top_p": 0.95}"#)
            .unwrap();
    assert_eq!(args, GenerateArgs::new(10).temperature(9.).top_p(0.95));
    assert!(!args.strategy().is_argmax());
    assert!(GenerateArgs::new(10).seed(3).strategy().is_argmax());
}
