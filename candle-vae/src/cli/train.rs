use crate::candle_grapher::LogGrapher;
use crate::candle_image_data_loader::mnist_loaders;
use crate::candle_vae_inference::{run_lifelong, TrainConfig};
use crate::candle_vae_model::Vae;
use crate::vae_config::{ComputeDevice, LayerType, NllType, ReparamType, VaeConfig};

use anyhow::Result;
use clap::Args;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(
        long,
        help = "Task to work on",
        long_help = "Task to work on: mnist or fashion (IDX files under --data-dir)."
    )]
    pub task: Option<String>,

    #[arg(long, default_value_t = 10, help = "Minimum number of epochs per class")]
    pub epochs: usize,

    #[arg(
        long,
        default_value_t = 13,
        help = "Up to this many extra epochs per class, drawn at random"
    )]
    pub extra_epochs_max: usize,

    #[arg(
        long,
        help = "Latent size",
        long_help = "Size of the continuous latent; also the number of\n\
                 categories when --reparam-type is discrete."
    )]
    pub latent_size: Option<usize>,

    #[arg(long, help = "Number of categories of the mixture's discrete latent")]
    pub mixture_discrete_size: Option<usize>,

    #[arg(long, default_value = ".datasets", help = "Directory with the data files")]
    pub data_dir: PathBuf,

    #[arg(long, help = "Minibatch size")]
    pub batch_size: Option<usize>,

    #[arg(long, help = "Base number of convolution filters")]
    pub filter_depth: Option<usize>,

    #[arg(long, value_enum, help = "Latent reparameterization")]
    pub reparam_type: Option<ReparamType>,

    #[arg(long, value_enum, help = "Encoder/decoder layer type")]
    pub layer_type: Option<LayerType>,

    #[arg(long, value_enum, help = "Observation model")]
    pub nll_type: Option<NllType>,

    #[arg(long, help = "Learning rate")]
    pub lr: Option<f64>,

    #[arg(long, help = "Random seed")]
    pub seed: Option<u64>,

    #[arg(long, help = "Mutual information regularizer weight (mixture only)")]
    pub mut_reg: Option<f64>,

    #[arg(long, default_value_t = 10, help = "Log every this many minibatches")]
    pub log_interval: usize,

    #[arg(long, value_enum, help = "Compute device")]
    pub device: Option<ComputeDevice>,

    #[arg(long, help = "Device number")]
    pub device_no: Option<usize>,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Classes to train on in order",
        long_help = "Comma-separated class numbers, one task each, trained in order.\n\
                 Defaults to 0,1,...,9."
    )]
    pub classes: Option<Vec<u32>>,

    #[arg(
        long,
        help = "JSON config file",
        long_help = "JSON file with model hyperparameters. Flags given on the\n\
                 command line take precedence over the file."
    )]
    pub config: Option<PathBuf>,

    #[arg(
        short,
        long,
        help = "Verbosity.",
        long_help = "Increase output verbosity."
    )]
    pub verbose: bool,
}

impl TrainArgs {
    /// defaults, then the config file, then the flags
    pub fn vae_config(&self) -> Result<VaeConfig> {
        let mut config = match &self.config {
            Some(path) => VaeConfig::from_json_file(path)?,
            None => VaeConfig::default(),
        };

        if let Some(task) = &self.task {
            config.task = task.to_lowercase();
        }
        if let Some(r) = self.reparam_type {
            config.reparam_type = r;
        }
        if let Some(k) = self.latent_size {
            config.continuous_size = k;
            if config.reparam_type == ReparamType::Discrete {
                config.discrete_size = k;
            }
        }
        if let Some(k) = self.mixture_discrete_size {
            config.discrete_size = k;
        }
        if let Some(l) = self.layer_type {
            config.layer_type = l;
        }
        if let Some(n) = self.nll_type {
            config.nll_type = n;
        }
        if let Some(b) = self.batch_size {
            config.batch_size = b;
        }
        if let Some(f) = self.filter_depth {
            config.filter_depth = f;
        }
        if let Some(lr) = self.lr {
            config.lr = lr;
        }
        if let Some(m) = self.mut_reg {
            config.mut_reg = m;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(d) = self.device {
            config.device = d;
        }
        if let Some(d) = self.device_no {
            config.device_no = d;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn train_config(&self) -> TrainConfig {
        TrainConfig {
            epochs: self.epochs,
            extra_epochs_max: self.extra_epochs_max,
            log_interval: self.log_interval,
            show_progress: true,
            verbose: self.verbose,
        }
    }
}

pub fn run_train(args: &TrainArgs) -> Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let config = args.vae_config()?;
    config.log();

    let classes = args.classes.clone().unwrap_or_else(|| (0..10).collect());
    let mut loaders = mnist_loaders(&config.task, &args.data_dir, config.batch_size, &classes)?;

    let img_shp = loaders
        .first()
        .map(|l| l.img_shp.clone())
        .ok_or_else(|| anyhow::anyhow!("no classes to train on"))?;

    let mut vae = Vae::new(&img_shp, Arc::new(config))?;
    let mut grapher = LogGrapher::new(&vae.get_name());

    let trace = run_lifelong(&mut vae, &mut loaders, &mut grapher, &args.train_config())?;

    if let Some(last) = trace.last() {
        info!(
            "done: {} epochs, last test loss {:.4} (kld {:.4}, nll {:.4})",
            trace.len(),
            last.losses.loss,
            last.losses.kld,
            last.losses.nll
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    fn parse(argv: &[&str]) -> TrainArgs {
        let cli = Cli::try_parse_from(argv).expect("valid arguments");
        match cli.command {
            Commands::Train(args) => args,
        }
    }

    #[test]
    fn flags_override_defaults() -> Result<()> {
        let args = parse(&[
            "candle-vae",
            "train",
            "--reparam-type",
            "mixture",
            "--latent-size",
            "12",
            "--mixture-discrete-size",
            "7",
            "--layer-type",
            "dense",
            "--classes",
            "3,4",
        ]);
        let config = args.vae_config()?;
        assert_eq!(config.reparam_type, ReparamType::Mixture);
        assert_eq!(config.continuous_size, 12);
        assert_eq!(config.discrete_size, 7);
        assert_eq!(config.layer_type, LayerType::Dense);
        assert_eq!(config.nll_type, NllType::Bernoulli);
        assert_eq!(args.classes, Some(vec![3, 4]));
        Ok(())
    }

    #[test]
    fn latent_size_sets_discrete_categories() -> Result<()> {
        let args = parse(&[
            "candle-vae",
            "train",
            "--reparam-type",
            "discrete",
            "--latent-size",
            "20",
        ]);
        assert_eq!(args.vae_config()?.discrete_size, 20);
        Ok(())
    }

    #[test]
    fn unknown_reparam_type_is_rejected() {
        assert!(Cli::try_parse_from(["candle-vae", "train", "--reparam-type", "vq"]).is_err());
    }
}
