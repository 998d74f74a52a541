use crate::common::{logger_init, vocab};
use causal_lm::{CacheConfig, CausalLM};
use sampler::{GenerateArgs as Request, ParameterStore, Sampler, SamplerError};
use std::time::Instant;
use tokenizer::Vocabulary;
use toy_lm::{ToyConfig, ToyTransformer};

#[derive(Args, Default)]
pub(crate) struct GenerateArgs {
    /// Prompt, may be repeated to form a batch.
    #[clap(short, long, required = true)]
    prompt: Vec<String>,
    /// Number of tokens to generate.
    #[clap(short, long, default_value_t = 16)]
    steps: usize,
    /// Sampling temperature.
    #[clap(long)]
    temperature: Option<f32>,
    /// Nucleus sampling probability.
    #[clap(long)]
    top_p: Option<f32>,
    /// Sample from the k most likely tokens only.
    #[clap(long)]
    top_k: Option<usize>,
    /// Random seed.
    #[clap(long)]
    seed: Option<u64>,
    /// Keep only the last tokens of each prompt.
    #[clap(long)]
    max_prompt_length: Option<usize>,
    /// Print the prompt before the continuation.
    #[clap(long)]
    echo: bool,
    /// KV cache capacity.
    #[clap(long, default_value_t = 256)]
    capacity: usize,
    /// Vocabulary file, one quoted piece per line.
    #[clap(long)]
    vocab: Option<String>,
    /// Model config (`config.json`).
    #[clap(long)]
    model_config: Option<String>,
    /// Seed for model parameter initialization.
    #[clap(long, default_value_t = 0)]
    model_seed: u64,
    /// Log level, may be "off", "trace", "debug", "info" or "error".
    #[clap(long)]
    log: Option<String>,
}

impl GenerateArgs {
    pub fn invoke(self) -> Result<(), SamplerError> {
        logger_init(&self.log);

        let time = Instant::now();
        let vocab = vocab(self.vocab.as_deref(), &self.prompt)?;
        let mut config = match &self.model_config {
            Some(path) => ToyConfig::from_json_file(path).map_err(SamplerError::model)?,
            None => ToyConfig::default(),
        };
        if config.vocab_size == 0 {
            config.vocab_size = vocab.piece_count();
        }
        let model = ToyTransformer::new(config).map_err(SamplerError::model)?;
        let store = ParameterStore::new(model.init_params(self.model_seed));
        let cache_config = CacheConfig::new(
            self.capacity,
            model.num_layers(),
            model.num_kv_heads(),
            model.head_dim(),
        )?;
        let mut sampler = Sampler::new(model, vocab, cache_config, store)?;
        info!("build sampler ... {:?}", time.elapsed());

        let mut args = Request::new(self.steps).echo(self.echo);
        args.temperature = self.temperature;
        args.top_p = self.top_p;
        args.top_k = self.top_k;
        args.seed = self.seed;
        args.max_prompt_length = self.max_prompt_length;

        let time = Instant::now();
        let output = sampler.generate(&self.prompt, &args)?;
        let duration = time.elapsed();
        for (prompt, text) in self.prompt.iter().zip(&output.text) {
            if self.echo {
                println!("{text}");
            } else {
                println!("{prompt} => {text}");
            }
        }
        info!("generate ... {duration:?}");
        info!(
            "avg. speed ... {} tokens/s",
            (self.steps * self.prompt.len()) as f32 / duration.as_secs_f32()
        );
        Ok(())
    }
}
