use anyhow::Result;
use candle_vae::cli::{train, Cli, Commands};
use clap::Parser;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => {
            train::run_train(args)?;
        }
    }

    Ok(())
}
