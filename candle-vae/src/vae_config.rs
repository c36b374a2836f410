use crate::error::{Result, VaeError};

use candle_core::Device;
use clap::ValueEnum;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReparamType {
    #[value(name = "isotropic_gaussian")]
    IsotropicGaussian,
    Discrete,
    Mixture,
}

#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LayerType {
    Conv,
    Dense,
}

#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NllType {
    Bernoulli,
    Gaussian,
}

#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

macro_rules! impl_str_enum {
    ($ty:ident, $what:expr, $( $variant:ident => $name:expr ),+ ) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $ty::$variant => $name, )+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = VaeError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_lowercase().as_str() {
                    $( $name => Ok($ty::$variant), )+
                    other => Err(VaeError::config(format!("unknown {}: {}", $what, other))),
                }
            }
        }
    };
}

impl_str_enum!(ReparamType, "reparameterization type",
    IsotropicGaussian => "isotropic_gaussian",
    Discrete => "discrete",
    Mixture => "mixture");

impl_str_enum!(LayerType, "layer type",
    Conv => "conv",
    Dense => "dense");

impl_str_enum!(NllType, "nll type",
    Bernoulli => "bernoulli",
    Gaussian => "gaussian");

impl_str_enum!(ComputeDevice, "device",
    Cpu => "cpu",
    Cuda => "cuda",
    Metal => "metal");

/// Hyperparameters of one VAE.
///
/// Shared read-only by the encoder, decoder and reparameterizer
/// builders once the model is constructed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct VaeConfig {
    pub task: String,
    pub reparam_type: ReparamType,
    pub layer_type: LayerType,
    pub nll_type: NllType,
    pub filter_depth: usize,
    pub batch_size: usize,
    /// weight of the mutual information regularizer (mixture only)
    pub mut_reg: f64,
    pub discrete_size: usize,
    pub continuous_size: usize,
    pub lr: f64,
    pub seed: Option<u64>,
    /// fixed observation scale of the Gaussian likelihood
    pub gaussian_scale: f64,
    /// initial Gumbel-Softmax temperature
    pub tau0: f64,
    pub device: ComputeDevice,
    pub device_no: usize,
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self {
            task: "mnist".into(),
            reparam_type: ReparamType::IsotropicGaussian,
            layer_type: LayerType::Conv,
            nll_type: NllType::Bernoulli,
            filter_depth: 32,
            batch_size: 64,
            mut_reg: 0.3,
            discrete_size: 32,
            continuous_size: 32,
            lr: 1e-3,
            seed: None,
            gaussian_scale: 1.0,
            tau0: 1.0,
            device: ComputeDevice::Cpu,
            device_no: 0,
        }
    }
}

impl VaeConfig {
    /// Read a (partial) config from a JSON file; missing fields take
    /// their default values
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: VaeConfig = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| VaeError::config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        info!("read config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Reject configs that cannot build a model
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, v: usize) -> Result<()> {
            if v == 0 {
                return Err(VaeError::config(format!("{} must be positive", name)));
            }
            Ok(())
        }

        positive("filter_depth", self.filter_depth)?;
        positive("batch_size", self.batch_size)?;

        match self.reparam_type {
            ReparamType::IsotropicGaussian => positive("continuous_size", self.continuous_size)?,
            ReparamType::Discrete => positive("discrete_size", self.discrete_size)?,
            ReparamType::Mixture => {
                positive("continuous_size", self.continuous_size)?;
                positive("discrete_size", self.discrete_size)?;
            }
        }

        if !(self.tau0 > 0.0) {
            return Err(VaeError::config("tau0 must be positive"));
        }
        if !(self.gaussian_scale > 0.0) {
            return Err(VaeError::config("gaussian_scale must be positive"));
        }
        if !self.mut_reg.is_finite() || !self.lr.is_finite() {
            return Err(VaeError::config("mut_reg and lr must be finite"));
        }
        if self.task.trim().is_empty() {
            return Err(VaeError::config("empty task name"));
        }
        Ok(())
    }

    /// The candle device described by `device` and `device_no`
    pub fn candle_device(&self) -> Result<Device> {
        let dev = match self.device {
            ComputeDevice::Cpu => Device::Cpu,
            ComputeDevice::Cuda => Device::new_cuda(self.device_no)?,
            ComputeDevice::Metal => Device::new_metal(self.device_no)?,
        };
        Ok(dev)
    }

    /// Log the config the way it will be used
    pub fn log(&self) {
        match serde_json::to_string_pretty(self) {
            Ok(s) => info!("config:\n{}", s),
            Err(_) => info!("config: {:?}", self),
        }
    }
}
