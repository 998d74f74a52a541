mod common;
mod generate;

use clap::Parser;

#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;

fn main() {
    use Commands::*;
    let result = match Cli::parse().command {
        Generate(generate) => generate.invoke(),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

#[derive(Parser)]
#[clap(name = "sampler-utils")]
#[clap(version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate following text
    Generate(generate::GenerateArgs),
}
