use crate::candle_loss_functions::gaussian_kl_loss;
use crate::candle_reparam_traits::*;
use crate::error::Result;

use candle_core::Tensor;

/// Diagonal Gaussian latent with a N(0, I) prior.
///
/// The logits carry `[mu | logvar]` side by side.
pub struct IsotropicGaussian {
    latent_size: usize,
    noise: NoiseSource,
}

impl IsotropicGaussian {
    pub fn new(latent_size: usize, noise: NoiseSource) -> Self {
        Self { latent_size, noise }
    }

    /// split logits into (mu, logvar), each (n x k); the log variance
    /// is clamped for stability
    pub fn split_params(&self, logits_nd: &Tensor) -> Result<GaussianParams> {
        let min_lv = -8.;
        let max_lv = 8.;

        check_logits_width("isotropic gaussian logits", logits_nd, self.input_size())?;
        let k = self.latent_size;
        let mu = logits_nd.narrow(1, 0, k)?;
        let logvar = logits_nd.narrow(1, k, k)?.clamp(min_lv, max_lv)?;
        Ok(GaussianParams { mu, logvar })
    }

    ///
    /// z = mu + sigma * eps
    /// where eps ~ N(0, 1)
    ///
    /// # Arguments
    /// * `params` - mean and log variance
    /// * `train` - returns `mu` when false
    pub fn reparameterize(&self, params: &GaussianParams, train: bool) -> Result<Tensor> {
        if train {
            let eps = self.noise.standard_normal_like(&params.mu)?;
            let sigma = (&params.logvar * 0.5)?.exp()?;
            Ok(params.mu.add(&sigma.mul(&eps)?)?)
        } else {
            Ok(params.mu.clone())
        }
    }

    pub fn kl_divergence(&self, params: &GaussianParams) -> Result<Tensor> {
        Ok(gaussian_kl_loss(&params.mu, &params.logvar)?)
    }
}

impl ReparameterizerT for IsotropicGaussian {
    fn sample(&self, logits_nd: &Tensor, train: bool) -> Result<(Tensor, LatentParams)> {
        let params = self.split_params(logits_nd)?;
        let z_nk = self.reparameterize(&params, train)?;
        Ok((z_nk, LatentParams::Gaussian(params)))
    }

    fn kl(&self, params: &LatentParams) -> Result<Tensor> {
        self.kl_divergence(params.as_gaussian()?)
    }

    fn input_size(&self) -> usize {
        2 * self.latent_size
    }

    fn output_size(&self) -> usize {
        self.latent_size
    }
}
