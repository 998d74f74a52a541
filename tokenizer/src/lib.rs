mod vocab_txt;

use common::utok;

/// 文本与词 id 之间的双向映射。
pub trait Vocabulary {
    fn bos(&self) -> utok;
    fn eos(&self) -> utok;
    fn pad(&self) -> utok;
    fn unk(&self) -> utok;
    /// 词表中的词数，即模型输出的 logits 宽度。
    fn piece_count(&self) -> usize;
    fn encode(&self, text: &str) -> Vec<utok>;
    /// 特殊词（pad/bos/eos）不出现在解码结果中。
    fn decode(&self, tokens: &[utok]) -> String;
}

pub use vocab_txt::{VocabError, VocabTxt};
