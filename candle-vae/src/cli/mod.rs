pub mod train;

use clap::{Parser, Subcommand};

pub use train::TrainArgs;

#[derive(Parser)]
#[command(name = "candle-vae")]
#[command(about = "Lifelong variational autoencoders over class-conditional image tasks")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a VAE on one class at a time
    Train(TrainArgs),
}
