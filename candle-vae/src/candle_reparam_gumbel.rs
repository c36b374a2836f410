use crate::candle_loss_functions::categorical_uniform_kl_loss;
use crate::candle_numeric_util::one_hot;
use crate::candle_reparam_traits::*;
use crate::error::Result;

use candle_core::{Tensor, D};
use candle_nn::ops;

/// How a discrete latent is drawn
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleMode {
    /// softmax((logits + g) / tau)
    Relaxed,
    /// one-hot forward pass, relaxed gradient (straight-through)
    Hard,
}

impl SampleMode {
    /// relaxed while training, hard one-hot codes at evaluation
    pub fn for_training(train: bool) -> Self {
        if train {
            SampleMode::Relaxed
        } else {
            SampleMode::Hard
        }
    }
}

/// Gumbel-Softmax (Concrete) relaxation of a categorical latent with a
/// uniform prior.
///
/// The temperature is stored here but annealed by the caller.
pub struct GumbelSoftmax {
    num_classes: usize,
    tau: f64,
    noise: NoiseSource,
}

impl GumbelSoftmax {
    pub fn new(num_classes: usize, tau: f64, noise: NoiseSource) -> Self {
        Self {
            num_classes,
            tau,
            noise,
        }
    }

    /// g = -log(-log(u + eps) + eps), u ~ U[0, 1)
    fn sample_gumbel_like(&self, logits_nk: &Tensor) -> Result<Tensor> {
        let eps = 1e-20;
        let u_nk = self.noise.uniform_like(logits_nk)?;
        Ok(((u_nk + eps)?.log()?.neg()? + eps)?.log()?.neg()?)
    }

    /// Draw a discrete latent in the requested mode
    ///
    /// # Returns `(z_nk, z_hard_nk)`
    /// * `z_nk` - relaxed or straight-through sample
    /// * `z_hard_nk` - one-hot argmax of the relaxed sample, detached
    pub fn sample_with_mode(&self, logits_nk: &Tensor, mode: SampleMode) -> Result<(Tensor, Tensor)> {
        check_logits_width("gumbel softmax logits", logits_nk, self.num_classes)?;

        let g_nk = self.sample_gumbel_like(logits_nk)?;
        let y_nk = ops::softmax(&(logits_nk.add(&g_nk)? / self.tau)?, D::Minus1)?;

        let y_hard_nk = one_hot(&y_nk.argmax(D::Minus1)?, self.num_classes, y_nk.dtype())?;

        let z_nk = match mode {
            SampleMode::Relaxed => y_nk,
            SampleMode::Hard => y_hard_nk.sub(&y_nk)?.detach().add(&y_nk)?,
        };
        Ok((z_nk, y_hard_nk.detach()))
    }

    pub fn kl_divergence(&self, params: &DiscreteParams) -> Result<Tensor> {
        Ok(categorical_uniform_kl_loss(&params.logits)?)
    }

    /// entropy of the uniform prior, log(K)
    pub fn prior_entropy(&self) -> f64 {
        (self.num_classes as f64).ln()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// sample and pack the parameter record in one go
    pub fn sample_params(&self, logits_nk: &Tensor, mode: SampleMode) -> Result<(Tensor, DiscreteParams)> {
        let (z_nk, z_hard) = self.sample_with_mode(logits_nk, mode)?;
        Ok((
            z_nk,
            DiscreteParams {
                logits: logits_nk.clone(),
                tau: self.tau,
                z_hard,
            },
        ))
    }
}

impl ReparameterizerT for GumbelSoftmax {
    fn sample(&self, logits_nd: &Tensor, train: bool) -> Result<(Tensor, LatentParams)> {
        let (z_nk, params) = self.sample_params(logits_nd, SampleMode::for_training(train))?;
        Ok((z_nk, LatentParams::Discrete(params)))
    }

    fn kl(&self, params: &LatentParams) -> Result<Tensor> {
        self.kl_divergence(params.as_discrete()?)
    }

    fn input_size(&self) -> usize {
        self.num_classes
    }

    fn output_size(&self) -> usize {
        self.num_classes
    }

    fn tau(&self) -> Option<f64> {
        Some(self.tau)
    }

    fn set_tau(&mut self, tau: f64) {
        self.tau = tau;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};

    fn gumbel(k: usize) -> GumbelSoftmax {
        GumbelSoftmax::new(k, 1.0, NoiseSource::new(Some(3)))
    }

    #[test]
    fn relaxed_rows_sum_to_one() -> Result<()> {
        let g = gumbel(6);
        let logits = Tensor::randn(0f32, 1., (5, 6), &Device::Cpu)?;
        let (z, _) = g.sample_with_mode(&logits, SampleMode::Relaxed)?;
        for s in z.sum(1)?.to_vec1::<f32>()? {
            assert!((s - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn hard_rows_are_one_hot() -> Result<()> {
        let g = gumbel(4);
        let logits = Tensor::randn(0f32, 1., (8, 4), &Device::Cpu)?;
        let (z, z_hard) = g.sample_with_mode(&logits, SampleMode::Hard)?;
        for (row, hard) in z.to_vec2::<f32>()?.iter().zip(z_hard.to_vec2::<f32>()?) {
            let ones = row.iter().filter(|&&v| (v - 1.0).abs() < 1e-5).count();
            let zeros = row.iter().filter(|&&v| v.abs() < 1e-5).count();
            assert_eq!((ones, zeros), (1, 3));
            assert_eq!(hard.iter().sum::<f32>(), 1.0);
        }
        Ok(())
    }

    #[test]
    fn straight_through_keeps_gradient() -> Result<()> {
        let g = gumbel(3);
        let logits = Var::from_tensor(&Tensor::randn(0f32, 1., (2, 3), &Device::Cpu)?)?;
        let w = Tensor::new(&[[1f32, 2., 3.]], &Device::Cpu)?;
        let (z, _) = g.sample_with_mode(logits.as_tensor(), SampleMode::Hard)?;
        let grads = z.broadcast_mul(&w)?.sum_all()?.backward()?;
        assert!(grads.get(logits.as_tensor()).is_some());
        Ok(())
    }

    #[test]
    fn relaxed_sample_keeps_gradient() -> Result<()> {
        let g = gumbel(3);
        let logits = Var::from_tensor(&Tensor::randn(0f32, 1., (2, 3), &Device::Cpu)?)?;
        let w = Tensor::new(&[[1f32, 2., 3.]], &Device::Cpu)?;
        let (z, _) = g.sample_with_mode(logits.as_tensor(), SampleMode::Relaxed)?;
        let grads = z.broadcast_mul(&w)?.sum_all()?.backward()?;
        let grad = grads
            .get(logits.as_tensor())
            .ok_or_else(|| candle_core::Error::Msg("no gradient on logits".into()))?;
        // softmax rows sum to one, so a non-constant weight gives a non-zero gradient
        let total = grad.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(total > 0.);
        Ok(())
    }

    #[test]
    fn kl_vanishes_for_uniform_logits() -> Result<()> {
        let g = gumbel(10);
        let logits = Tensor::full(0.3f32, (3, 10), &Device::Cpu)?;
        let (_, params) = g.sample(&logits, true)?;
        for v in g.kl(&params)?.to_vec1::<f32>()? {
            assert!(v.abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn temperature_is_exposed() {
        let mut g = gumbel(2);
        assert_eq!(g.tau(), Some(1.0));
        g.set_tau(0.5);
        assert_eq!(g.tau(), Some(0.5));
    }

    #[test]
    fn record_keeps_pre_softmax_logits() -> Result<()> {
        let g = gumbel(3);
        let logits = Tensor::new(&[[1f32, -2., 0.5]], &Device::Cpu)?;
        let (_, params) = g.sample(&logits, false)?;
        let p = params.as_discrete()?;
        assert_eq!(p.logits.to_vec2::<f32>()?, logits.to_vec2::<f32>()?);
        assert_eq!(p.tau, 1.0);
        assert_eq!(p.z_hard.dtype(), DType::F32);
        Ok(())
    }
}
