#![deny(warnings)]

mod random;
mod sample;

pub use random::RandomStream;

/// 从 logits 中选出下一个词的策略。
#[derive(Clone, Copy, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// 取最大值。
    Greedy,
    /// 温度缩放后在 top-k ∩ top-p 的候选集中按概率采样。
    Random {
        temperature: f32,
        top_k: Option<usize>,
        top_p: f32,
    },
}

impl Default for SamplingStrategy {
    #[inline]
    fn default() -> Self {
        Self::Greedy
    }
}

impl SamplingStrategy {
    /// 由调用参数决定策略：都未给出或取值退化时使用 [`SamplingStrategy::Greedy`]。
    pub fn new(temperature: Option<f32>, top_k: Option<usize>, top_p: Option<f32>) -> Self {
        if temperature.is_none() && top_k.is_none() && top_p.is_none() {
            return Self::Greedy;
        }
        let strategy = Self::Random {
            temperature: temperature.unwrap_or(1.),
            top_k,
            top_p: top_p.unwrap_or(1.),
        };
        if strategy.is_argmax() {
            Self::Greedy
        } else {
            strategy
        }
    }

    #[inline]
    pub fn is_argmax(&self) -> bool {
        match *self {
            Self::Greedy => true,
            Self::Random {
                temperature,
                top_k,
                top_p,
            } => temperature <= 0. || top_k.is_some_and(|k| k < 2) || top_p <= 0.,
        }
    }
}

#[test]
fn test_resolve() {
    assert_eq!(SamplingStrategy::new(None, None, None), SamplingStrategy::Greedy);
    assert_eq!(SamplingStrategy::new(Some(0.), None, Some(0.9)), SamplingStrategy::Greedy);
    assert_eq!(SamplingStrategy::new(None, Some(1), None), SamplingStrategy::Greedy);
    assert_eq!(
        SamplingStrategy::new(Some(9.), None, Some(0.95)),
        SamplingStrategy::Random {
            temperature: 9.,
            top_k: None,
            top_p: 0.95,
        }
    );
    assert_eq!(
        SamplingStrategy::new(None, None, Some(0.5)),
        SamplingStrategy::Random {
            temperature: 1.,
            top_k: None,
            top_p: 0.5,
        }
    );
}
