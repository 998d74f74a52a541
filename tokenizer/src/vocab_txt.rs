use crate::Vocabulary;
use common::utok;
use memmap2::Mmap;
use std::{collections::HashMap, fs::File, path::Path};

/// 一个以空白切分单词的朴素词表。
pub struct VocabTxt {
    /// 词表。
    words: Vec<String>,
    /// 词到 id 的索引。
    index: HashMap<String, utok>,
    pad: utok,
    bos: utok,
    eos: utok,
    unk: utok,
}

#[derive(thiserror::Error, Debug)]
pub enum VocabError {
    #[error("failed to read vocabulary: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line} is not a quoted piece")]
    Malformed { line: usize },
    #[error("vocabulary has no \"{0}\" piece")]
    MissingSpecial(&'static str),
}

impl VocabTxt {
    pub const PAD: &'static str = "<pad>";
    pub const BOS: &'static str = "<s>";
    pub const EOS: &'static str = "</s>";
    pub const UNK: &'static str = "<unk>";

    pub fn new<S: Into<String>>(pieces: impl IntoIterator<Item = S>) -> Result<Self, VocabError> {
        let words = pieces.into_iter().map(Into::into).collect::<Vec<String>>();
        let index = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as utok))
            .collect::<HashMap<_, _>>();
        let special = |name: &'static str| index.get(name).copied().ok_or(VocabError::MissingSpecial(name));
        Ok(Self {
            pad: special(Self::PAD)?,
            bos: special(Self::BOS)?,
            eos: special(Self::EOS)?,
            unk: special(Self::UNK)?,
            words,
            index,
        })
    }

    /// 每行一个带引号的词，行号即 id。
    pub fn from_txt_file(path: impl AsRef<Path>) -> Result<Self, VocabError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        let text = std::str::from_utf8(&mmap)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut pieces = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let piece = line
                .strip_prefix('"')
                .and_then(|l| l.strip_suffix('"'))
                .ok_or(VocabError::Malformed { line: i + 1 })?;
            pieces.push(piece);
        }
        Self::new(pieces)
    }
}

impl Vocabulary for VocabTxt {
    #[inline]
    fn bos(&self) -> utok {
        self.bos
    }
    #[inline]
    fn eos(&self) -> utok {
        self.eos
    }
    #[inline]
    fn pad(&self) -> utok {
        self.pad
    }
    #[inline]
    fn unk(&self) -> utok {
        self.unk
    }
    #[inline]
    fn piece_count(&self) -> usize {
        self.words.len()
    }

    fn encode(&self, text: &str) -> Vec<utok> {
        text.split_whitespace()
            .map(|w| self.index.get(w).copied().unwrap_or(self.unk))
            .collect()
    }

    fn decode(&self, tokens: &[utok]) -> String {
        tokens
            .iter()
            .filter(|&&t| t != self.pad && t != self.bos && t != self.eos)
            .map(|&t| {
                self.words
                    .get(t as usize)
                    .map_or(Self::UNK, String::as_str)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock() -> VocabTxt {
        VocabTxt::new([
            "<pad>", "<s>", "</s>", "<unk>", "input", "string", "hello", "world", "Hello",
            "there", "!", "My", "name", "is",
        ])
        .unwrap()
    }

    #[test]
    fn test_encode_decode() {
        let vocab = mock();
        assert_eq!(vocab.piece_count(), 14);
        assert_eq!(vocab.encode("input string"), [4, 5]);
        assert_eq!(vocab.encode("hello  unknown"), [6, 3]);
        assert_eq!(vocab.decode(&[1, 6, 7, 0, 2]), "hello world");
        assert_eq!(vocab.decode(&[99]), "<unk>");
    }

    #[test]
    fn test_missing_special() {
        assert!(matches!(
            VocabTxt::new(["<pad>", "<s>", "</s>"]),
            Err(VocabError::MissingSpecial("<unk>"))
        ));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("vocabs-{}.txt", std::process::id()));
        std::fs::write(&path, "\"<pad>\"\n\"<s>\"\n\"</s>\"\n\"<unk>\"\n\"hi\"\n").unwrap();
        let vocab = VocabTxt::from_txt_file(&path).unwrap();
        assert_eq!(vocab.encode("hi"), [4]);
        std::fs::write(&path, "\"<pad>\"\nbroken\n").unwrap();
        assert!(matches!(
            VocabTxt::from_txt_file(&path),
            Err(VocabError::Malformed { line: 2 })
        ));
        std::fs::remove_file(path).unwrap();
    }
}
