use crate::candle_reparam_gaussian::IsotropicGaussian;
use crate::candle_reparam_gumbel::GumbelSoftmax;
use crate::candle_reparam_mixture::Mixture;
use crate::candle_reparam_traits::*;
use crate::error::Result;
use crate::vae_config::{ReparamType, VaeConfig};

use candle_core::Tensor;
use log::info;

/// The latent family of a model, picked once from the config
pub enum Reparameterizer {
    Gaussian(IsotropicGaussian),
    Discrete(GumbelSoftmax),
    Mixture(Mixture),
}

impl Reparameterizer {
    pub fn build(config: &VaeConfig, noise: NoiseSource) -> Result<Self> {
        config.validate()?;
        let ret = match config.reparam_type {
            ReparamType::IsotropicGaussian => {
                info!("using isotropic gaussian reparameterizer");
                Reparameterizer::Gaussian(IsotropicGaussian::new(config.continuous_size, noise))
            }
            ReparamType::Discrete => {
                info!("using gumbel softmax reparameterizer");
                Reparameterizer::Discrete(GumbelSoftmax::new(
                    config.discrete_size,
                    config.tau0,
                    noise,
                ))
            }
            ReparamType::Mixture => {
                info!("using mixture reparameterizer");
                Reparameterizer::Mixture(Mixture::new(
                    config.discrete_size,
                    config.continuous_size,
                    config.tau0,
                    noise,
                ))
            }
        };
        Ok(ret)
    }

    fn inner(&self) -> &dyn ReparameterizerT {
        match self {
            Reparameterizer::Gaussian(r) => r,
            Reparameterizer::Discrete(r) => r,
            Reparameterizer::Mixture(r) => r,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ReparameterizerT {
        match self {
            Reparameterizer::Gaussian(r) => r,
            Reparameterizer::Discrete(r) => r,
            Reparameterizer::Mixture(r) => r,
        }
    }
}

impl ReparameterizerT for Reparameterizer {
    fn sample(&self, logits_nd: &Tensor, train: bool) -> Result<(Tensor, LatentParams)> {
        self.inner().sample(logits_nd, train)
    }

    fn kl(&self, params: &LatentParams) -> Result<Tensor> {
        self.inner().kl(params)
    }

    fn mutual_info(&self, params: &LatentParams) -> Result<Option<Tensor>> {
        self.inner().mutual_info(params)
    }

    fn needs_reencoding(&self) -> bool {
        self.inner().needs_reencoding()
    }

    fn input_size(&self) -> usize {
        self.inner().input_size()
    }

    fn output_size(&self) -> usize {
        self.inner().output_size()
    }

    fn tau(&self) -> Option<f64> {
        self.inner().tau()
    }

    fn set_tau(&mut self, tau: f64) {
        self.inner_mut().set_tau(tau)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_per_family() -> Result<()> {
        let mut config = VaeConfig {
            continuous_size: 8,
            discrete_size: 10,
            ..VaeConfig::default()
        };

        let expected = [
            (ReparamType::IsotropicGaussian, 16, 8),
            (ReparamType::Discrete, 10, 10),
            (ReparamType::Mixture, 26, 18),
        ];
        for (reparam_type, input_size, output_size) in expected {
            config.reparam_type = reparam_type;
            let r = Reparameterizer::build(&config, NoiseSource::new(Some(0)))?;
            assert_eq!(r.input_size(), input_size);
            assert_eq!(r.output_size(), output_size);
        }
        Ok(())
    }

    #[test]
    fn only_discrete_families_have_temperature() -> Result<()> {
        let mut config = VaeConfig::default();
        config.reparam_type = ReparamType::IsotropicGaussian;
        let mut r = Reparameterizer::build(&config, NoiseSource::new(Some(0)))?;
        r.set_tau(0.1);
        assert_eq!(r.tau(), None);
        assert!(!r.needs_reencoding());

        config.reparam_type = ReparamType::Mixture;
        let r = Reparameterizer::build(&config, NoiseSource::new(Some(0)))?;
        assert_eq!(r.tau(), Some(config.tau0));
        assert!(r.needs_reencoding());
        Ok(())
    }
}
