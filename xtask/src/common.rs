use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::collections::BTreeSet;
use tokenizer::{VocabError, VocabTxt};

pub(crate) fn logger_init(log_level: &Option<String>) {
    let log = log_level
        .as_ref()
        .and_then(|log| match log.to_lowercase().as_str() {
            "off" | "none" => Some(LevelFilter::Off),
            "trace" => Some(LevelFilter::Trace),
            "debug" => Some(LevelFilter::Debug),
            "info" => Some(LevelFilter::Info),
            "error" => Some(LevelFilter::Error),
            _ => None,
        })
        .unwrap_or(LevelFilter::Warn);
    if let Err(e) = SimpleLogger::new().with_level(log).init() {
        eprintln!("failed to init logger: {e}");
    }
}

/// 从文件加载词表；未指定文件时用提示词中出现的单词构造一个。
pub(crate) fn vocab(path: Option<&str>, prompts: &[String]) -> Result<VocabTxt, VocabError> {
    match path {
        Some(path) => VocabTxt::from_txt_file(path),
        None => {
            let words = prompts
                .iter()
                .flat_map(|p| p.split_whitespace())
                .collect::<BTreeSet<_>>();
            VocabTxt::new(
                [VocabTxt::PAD, VocabTxt::BOS, VocabTxt::EOS, VocabTxt::UNK]
                    .into_iter()
                    .chain(words.into_iter().filter(|w| {
                        ![VocabTxt::PAD, VocabTxt::BOS, VocabTxt::EOS, VocabTxt::UNK].contains(w)
                    })),
            )
        }
    }
}
