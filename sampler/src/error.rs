use causal_lm::{CacheError, ConfigError, StructuralMismatch};
use tokenizer::VocabError;

#[derive(thiserror::Error, Debug)]
pub enum SamplerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Structure(#[from] StructuralMismatch),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Vocab(#[from] VocabError),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("model failed: {0}")]
    Model(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SamplerError {
    #[inline]
    pub fn model(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Model(Box::new(e))
    }
}
