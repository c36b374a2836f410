use crate::candle_loss_functions::cross_entropy_per_example;
use crate::candle_reparam_gaussian::IsotropicGaussian;
use crate::candle_reparam_gumbel::{GumbelSoftmax, SampleMode};
use crate::candle_reparam_traits::*;
use crate::error::{Result, VaeError};

use candle_core::{Tensor, D};

/// Discrete (Gumbel-Softmax) and continuous (Gaussian) latents side by
/// side. Logits and samples are laid out discrete first, continuous
/// second.
pub struct Mixture {
    discrete: GumbelSoftmax,
    gaussian: IsotropicGaussian,
}

impl Mixture {
    pub fn new(num_discrete: usize, num_continuous: usize, tau: f64, noise: NoiseSource) -> Self {
        Self {
            discrete: GumbelSoftmax::new(num_discrete, tau, noise.clone()),
            gaussian: IsotropicGaussian::new(num_continuous, noise),
        }
    }

    pub fn discrete(&self) -> &GumbelSoftmax {
        &self.discrete
    }

    pub fn gaussian(&self) -> &IsotropicGaussian {
        &self.gaussian
    }

    /// split point between the discrete and continuous logits
    pub fn split(&self) -> usize {
        self.discrete.input_size()
    }

    /// (discrete, continuous) views of the logits
    pub fn split_logits(&self, logits_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        check_logits_width("mixture logits", logits_nd, self.input_size())?;
        let split = self.split();
        let disc = logits_nd.narrow(1, 0, split)?;
        let cont = logits_nd.narrow(1, split, self.gaussian.input_size())?;
        Ok((disc, cont))
    }

    pub fn kl_divergence(&self, params: &MixtureParams) -> Result<Tensor> {
        let kl_disc = self.discrete.kl_divergence(&params.discrete)?;
        let kl_cont = self.gaussian.kl_divergence(&params.gaussian)?;
        Ok(kl_disc.add(&kl_cont)?)
    }

    /// Lower bound on I(c; x) through the re-encoded reconstruction
    ///
    /// mi(i) = H(c) - CE( q(c | x_hat(i)), c(i) )
    ///
    /// where `c(i)` is the hard code drawn for the i-th example and
    /// `H(c) = log K` under the uniform prior.
    pub fn mutual_info_bound(&self, params: &MixtureParams) -> Result<Tensor> {
        let q_logits_nk = params
            .q_z_given_xhat
            .as_ref()
            .ok_or(VaeError::ParamMismatch {
                expected: "mixture with re-encoded discrete logits",
                actual: "mixture",
            })?;

        let targets_n = params.discrete.z_hard.argmax(D::Minus1)?;
        let ce_n = cross_entropy_per_example(q_logits_nk, &targets_n)?;
        Ok((ce_n.neg()? + self.discrete.prior_entropy())?)
    }
}

impl ReparameterizerT for Mixture {
    fn sample(&self, logits_nd: &Tensor, train: bool) -> Result<(Tensor, LatentParams)> {
        let (disc_nd, cont_nd) = self.split_logits(logits_nd)?;

        let (z_disc, discrete) = self
            .discrete
            .sample_params(&disc_nd, SampleMode::for_training(train))?;

        let gaussian = self.gaussian.split_params(&cont_nd)?;
        let z_cont = self.gaussian.reparameterize(&gaussian, train)?;

        let z_nk = Tensor::cat(&[&z_disc, &z_cont], 1)?;
        Ok((
            z_nk,
            LatentParams::Mixture(MixtureParams {
                discrete,
                gaussian,
                split: self.split(),
                q_z_given_xhat: None,
            }),
        ))
    }

    fn kl(&self, params: &LatentParams) -> Result<Tensor> {
        self.kl_divergence(params.as_mixture()?)
    }

    fn mutual_info(&self, params: &LatentParams) -> Result<Option<Tensor>> {
        Ok(Some(self.mutual_info_bound(params.as_mixture()?)?))
    }

    fn needs_reencoding(&self) -> bool {
        true
    }

    fn input_size(&self) -> usize {
        self.discrete.input_size() + self.gaussian.input_size()
    }

    fn output_size(&self) -> usize {
        self.discrete.output_size() + self.gaussian.output_size()
    }

    fn tau(&self) -> Option<f64> {
        self.discrete.tau()
    }

    fn set_tau(&mut self, tau: f64) {
        self.discrete.set_tau(tau);
    }
}
