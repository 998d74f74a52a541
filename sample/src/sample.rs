use crate::{RandomStream, SamplingStrategy};
use common::{argmax, utok, BetweenF32};
use std::{cmp::Ordering, collections::BinaryHeap};

#[derive(Clone, Copy, PartialEq, Debug)]
struct Probability {
    val: f32,
    tok: utok,
}

impl Eq for Probability {}
impl PartialOrd for Probability {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
// 大的值排在前面，值相等时 id 小的在前。
impl Ord for Probability {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        match self.val.total_cmp(&other.val) {
            Ordering::Equal => self.tok.cmp(&other.tok),
            ord => ord.reverse(),
        }
    }
}

impl<T: BetweenF32> From<(usize, &T)> for Probability {
    #[inline]
    fn from((i, p): (usize, &T)) -> Self {
        Self {
            val: p.get(),
            tok: i as _,
        }
    }
}

impl SamplingStrategy {
    /// 选出下一个词。贪心策略不消耗随机数。
    pub fn select<T: BetweenF32>(&self, logits: &[T], rng: &mut RandomStream) -> utok {
        let &Self::Random {
            temperature,
            top_k,
            top_p,
        } = self
        else {
            return argmax(logits);
        };
        if self.is_argmax() {
            return argmax(logits);
        }

        // top-k & sort
        let top_k = top_k.unwrap_or(usize::MAX);
        let logits = if top_k < logits.len() {
            let mut buf = BinaryHeap::with_capacity(top_k + 1);
            for it in logits.iter().enumerate() {
                buf.push(Probability::from(it));
                if buf.len() > top_k {
                    buf.pop();
                }
            }
            buf.into_sorted_vec()
        } else {
            let mut buf = logits
                .iter()
                .enumerate()
                .map(Probability::from)
                .collect::<Vec<_>>();
            buf.sort_unstable();
            buf
        };
        let max = logits[0].val;
        // temperature & sum
        let (logits, sum) = {
            let mut logits = logits;
            let mut sum = 0.;
            for pi in logits.iter_mut() {
                pi.val = ((pi.val - max) / temperature).exp();
                sum += pi.val;
            }
            (logits, sum)
        };
        // top p
        let (logits, sum) = if top_p < 1. {
            let mut acc = 0.;
            let i = logits
                .iter()
                .take_while(|pi| {
                    let keep = acc < top_p * sum;
                    acc += pi.val;
                    keep
                })
                .count();
            (&logits[..i], acc.min(sum))
        } else {
            (&logits[..], sum)
        };
        // random
        let mut rand = rng.next_f32() * sum;
        logits
            .iter()
            .find(|pi| {
                rand -= pi.val;
                rand <= 0.
            })
            .unwrap_or(&logits[logits.len() - 1])
            .tok
    }
}
