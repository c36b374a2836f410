use crate::candle_loss_functions::{bernoulli_nll, gaussian_nll};
use crate::candle_model_traits::*;
use crate::candle_reparam_traits::*;
use crate::candle_reparameterizer::Reparameterizer;
use crate::candle_vae_decoder::ImageDecoder;
use crate::candle_vae_encoder::{check_image_shape, ImageEncoder};
use crate::error::{Result, VaeError};
use crate::vae_config::{NllType, ReparamType, VaeConfig};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{ops, VarBuilder, VarMap};
use log::{info, warn};
use std::sync::Arc;

/// Output of `Vae::loss_function`
///
/// `loss == nll + kld - mut_reg * mut_info` elementwise; every
/// `*_mean` is the batch mean of its per-example counterpart.
pub struct LossMap {
    pub loss: Tensor,
    pub loss_mean: Tensor,
    pub elbo_mean: Tensor,
    pub nll_mean: Tensor,
    pub kld_mean: Tensor,
    pub mut_info_mean: Tensor,
    pub nll: Tensor,
    pub kld: Tensor,
    pub mut_info: Tensor,
}

/// host-side copy of the mean fields of a `LossMap`
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LossSummary {
    pub loss: f64,
    pub elbo: f64,
    pub nll: f64,
    pub kld: f64,
    pub mut_info: f64,
}

impl LossMap {
    /// combine per-example terms (n) into the loss map
    pub fn assemble(nll: Tensor, kld: Tensor, mut_info: Tensor, mut_reg: f64) -> Result<Self> {
        let elbo = nll.add(&kld)?;
        let loss = elbo.sub(&(&mut_info * mut_reg)?)?;
        Ok(Self {
            loss_mean: loss.mean_all()?,
            elbo_mean: elbo.mean_all()?,
            nll_mean: nll.mean_all()?,
            kld_mean: kld.mean_all()?,
            mut_info_mean: mut_info.mean_all()?,
            loss,
            nll,
            kld,
            mut_info,
        })
    }

    pub fn summary(&self) -> Result<LossSummary> {
        let scalar = |t: &Tensor| -> Result<f64> { Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?) };
        Ok(LossSummary {
            loss: scalar(&self.loss_mean)?,
            elbo: scalar(&self.elbo_mean)?,
            nll: scalar(&self.nll_mean)?,
            kld: scalar(&self.kld_mean)?,
            mut_info: scalar(&self.mut_info_mean)?,
        })
    }
}

/// Variational autoencoder over images with a pluggable latent family.
pub struct Vae {
    config: Arc<VaeConfig>,
    input_shape: Vec<usize>,
    reparameterizer: Reparameterizer,
    encoder: ImageEncoder,
    decoder: ImageDecoder,
    variable_map: VarMap,
    device: Device,
    noise: NoiseSource,
}

impl Vae {
    /// Build a model for images of shape `input_shape = [c, h, w]`
    /// on the configured device
    pub fn new(input_shape: &[usize], config: Arc<VaeConfig>) -> Result<Self> {
        let device = config.candle_device()?;
        Self::with_device(input_shape, config, device)
    }

    pub fn with_device(input_shape: &[usize], config: Arc<VaeConfig>, device: Device) -> Result<Self> {
        config.validate()?;
        check_image_shape(input_shape)?;

        if let (Some(seed), false) = (config.seed, device.is_cpu()) {
            if let Err(e) = device.set_seed(seed) {
                warn!("could not seed the device: {}", e);
            }
        }

        let noise = NoiseSource::new(config.seed);
        let reparameterizer = Reparameterizer::build(&config, noise.clone())?;

        let variable_map = VarMap::new();
        let vs = VarBuilder::from_varmap(&variable_map, DType::F32, &device);

        let encoder = ImageEncoder::new(
            input_shape,
            reparameterizer.input_size(),
            config.layer_type,
            config.filter_depth,
            vs.clone(),
        )?;

        let decoder = ImageDecoder::new(
            input_shape,
            reparameterizer.output_size(),
            config.layer_type,
            config.filter_depth,
            vs,
        )?;

        let ret = Self {
            config,
            input_shape: input_shape.to_vec(),
            reparameterizer,
            encoder,
            decoder,
            variable_map,
            device,
            noise,
        };
        info!("built {}", ret.get_name());
        Ok(ret)
    }

    /// encode -> reparameterize -> decode in training mode
    ///
    /// # Returns `(recon_logits, params)`
    pub fn forward(&self, x_nchw: &Tensor) -> Result<(Tensor, LatentParams)> {
        self.forward_t(x_nchw, true)
    }

    pub fn forward_t(&self, x_nchw: &Tensor, train: bool) -> Result<(Tensor, LatentParams)> {
        let logits_nd = self.encode(x_nchw, train)?;
        let (z_nk, params) = self.reparameterizer.sample(&logits_nd, train)?;
        Ok((self.decode(&z_nk, train)?, params))
    }

    pub fn encode(&self, x_nchw: &Tensor, train: bool) -> Result<Tensor> {
        self.encoder.forward_t(x_nchw, train)
    }

    pub fn decode(&self, z_nk: &Tensor, train: bool) -> Result<Tensor> {
        self.decoder.forward_t(z_nk, train)
    }

    /// per-example negative log-likelihood (n) of `x` under the
    /// configured observation model
    pub fn nll(&self, recon_x: &Tensor, x: &Tensor) -> Result<Tensor> {
        if recon_x.dims() != x.dims() {
            return Err(VaeError::shape("nll target", recon_x.dims(), x.dims()));
        }
        let x = x.to_dtype(recon_x.dtype())?;
        let nll_n = match self.config.nll_type {
            NllType::Bernoulli => bernoulli_nll(recon_x, &x)?,
            NllType::Gaussian => gaussian_nll(recon_x, &x, self.config.gaussian_scale)?,
        };
        Ok(nll_n)
    }

    /// map reconstruction logits to the data space
    pub fn nll_activation(&self, logits: &Tensor) -> Result<Tensor> {
        match self.config.nll_type {
            NllType::Gaussian => Ok(logits.clone()),
            NllType::Bernoulli => Ok(ops::sigmoid(logits)?),
        }
    }

    pub fn kld(&self, params: &LatentParams) -> Result<Tensor> {
        self.reparameterizer.kl(params)
    }

    pub fn loss_function(&self, recon_x: &Tensor, x: &Tensor, params: &LatentParams) -> Result<LossMap> {
        self.loss_function_t(recon_x, x, params, true)
    }

    /// `nll + kld - mut_reg * mut_info`; the mutual information term is
    /// zero unless the latent family defines one
    ///
    /// # Arguments
    /// * `train` - batch norm mode of the re-encoding pass, if any
    pub fn loss_function_t(
        &self,
        recon_x: &Tensor,
        x: &Tensor,
        params: &LatentParams,
        train: bool,
    ) -> Result<LossMap> {
        let nll = self.nll(recon_x, x)?;
        let kld = self.kld(params)?;

        let mut_info = if self.reparameterizer.needs_reencoding() {
            let x_hat = self.nll_activation(recon_x)?;
            let logits_xhat = self.encode(&x_hat, train)?;
            let reencoded = params.with_reencoded(&logits_xhat)?;
            self.reparameterizer.mutual_info(&reencoded)?
        } else {
            self.reparameterizer.mutual_info(params)?
        };
        let mut_info = match mut_info {
            Some(mi) => mi,
            None => nll.zeros_like()?,
        };

        LossMap::assemble(nll, kld, mut_info, self.config.mut_reg)
    }

    /// Deterministic identifier of everything that shapes the model
    pub fn get_name(&self) -> String {
        let c = &self.config;
        let param_str = match c.reparam_type {
            ReparamType::Mixture => format!("_disc{}_cont{}", c.discrete_size, c.continuous_size),
            ReparamType::IsotropicGaussian => format!("_latent{}", c.continuous_size),
            ReparamType::Discrete => format!("_latent{}", c.discrete_size),
        };
        let input_str = self
            .input_shape
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("_");

        format!(
            "vae_{}_input{}{}_batch{}_mut{}_filter_depth{}_nll{}_reparam{}_layer{}_lr{}",
            c.task.trim(),
            input_str,
            param_str,
            c.batch_size,
            c.mut_reg,
            c.filter_depth,
            c.nll_type,
            c.reparam_type,
            c.layer_type,
            c.lr
        )
        .to_lowercase()
    }

    /// Trainable variables. Call after the first forward pass so the
    /// lazily sized projection is included.
    pub fn parameters(&self) -> Vec<Var> {
        self.variable_map.all_vars()
    }

    pub fn variable_map(&self) -> &VarMap {
        &self.variable_map
    }

    pub fn is_sized(&self) -> bool {
        self.encoder.is_sized()
    }

    pub fn config(&self) -> &VaeConfig {
        &self.config
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn noise(&self) -> &NoiseSource {
        &self.noise
    }

    pub fn reparameterizer(&self) -> &Reparameterizer {
        &self.reparameterizer
    }

    pub fn encoder(&self) -> &ImageEncoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &ImageDecoder {
        &self.decoder
    }

    /// current Gumbel-Softmax temperature, if the family has one
    pub fn temperature(&self) -> Option<f64> {
        self.reparameterizer.tau()
    }

    pub fn set_temperature(&mut self, tau: f64) {
        self.reparameterizer.set_tau(tau);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vae_config::LayerType;
    use approx::assert_abs_diff_eq;

    fn small_config(reparam_type: ReparamType, layer_type: LayerType) -> Arc<VaeConfig> {
        Arc::new(VaeConfig {
            reparam_type,
            layer_type,
            filter_depth: 2,
            batch_size: 4,
            discrete_size: 5,
            continuous_size: 3,
            seed: Some(1),
            ..VaeConfig::default()
        })
    }

    #[test]
    fn isotropic_end_to_end() -> Result<()> {
        let config = Arc::new(VaeConfig {
            continuous_size: 8,
            ..(*small_config(ReparamType::IsotropicGaussian, LayerType::Conv)).clone()
        });
        let vae = Vae::new(&[1, 28, 28], config)?;
        let x = Tensor::zeros((4, 1, 28, 28), DType::F32, &Device::Cpu)?;

        let (recon, params) = vae.forward(&x)?;
        assert_eq!(recon.dims(), x.dims());

        let losses = vae.loss_function(&recon, &x, &params)?;
        assert_eq!(losses.loss.dims(), &[4]);
        let s = losses.summary()?;
        assert!(s.loss.is_finite() && s.nll.is_finite());
        assert!(s.kld >= 0.);
        assert_eq!(s.mut_info, 0.);
        assert_abs_diff_eq!(s.loss, s.elbo, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn loss_identity_holds_for_mixture() -> Result<()> {
        let config = small_config(ReparamType::Mixture, LayerType::Dense);
        let mut_reg = config.mut_reg;
        let vae = Vae::new(&[1, 8, 8], config)?;
        let x = Tensor::rand(0f32, 1., (4, 1, 8, 8), &Device::Cpu)?;

        let (recon, params) = vae.forward(&x)?;
        let losses = vae.loss_function(&recon, &x, &params)?;

        let loss = losses.loss.to_vec1::<f32>()?;
        let nll = losses.nll.to_vec1::<f32>()?;
        let kld = losses.kld.to_vec1::<f32>()?;
        let mi = losses.mut_info.to_vec1::<f32>()?;
        for i in 0..4 {
            let expected = nll[i] + kld[i] - (mut_reg as f32) * mi[i];
            assert_abs_diff_eq!(loss[i], expected, epsilon = 1e-3);
            assert!(mi[i] <= (5f32).ln() + 1e-4);
        }
        Ok(())
    }

    #[test]
    fn zero_mutual_info_leaves_loss_at_elbo() -> Result<()> {
        let config = Arc::new(VaeConfig {
            discrete_size: 10,
            continuous_size: 8,
            mut_reg: 0.3,
            ..(*small_config(ReparamType::Mixture, LayerType::Dense)).clone()
        });
        let vae = Vae::new(&[1, 8, 8], config.clone())?;
        let x = Tensor::rand(0f32, 1., (4, 1, 8, 8), &Device::Cpu)?;
        let (recon, params) = vae.forward(&x)?;

        let nll = vae.nll(&recon, &x)?;
        let kld = vae.kld(&params)?;
        let zeros = nll.zeros_like()?;
        let losses = LossMap::assemble(nll, kld, zeros, config.mut_reg)?;

        let elbo = losses.nll.add(&losses.kld)?.to_vec1::<f32>()?;
        assert_eq!(losses.loss.to_vec1::<f32>()?, elbo);
        let s = losses.summary()?;
        assert_eq!(s.loss, s.elbo);
        assert_eq!(s.mut_info, 0.);
        Ok(())
    }

    #[test]
    fn loss_means_average_the_batch() -> Result<()> {
        let vae = Vae::new(&[1, 8, 8], small_config(ReparamType::Mixture, LayerType::Dense))?;
        let x = Tensor::rand(0f32, 1., (4, 1, 8, 8), &Device::Cpu)?;
        let (recon, params) = vae.forward(&x)?;
        let losses = vae.loss_function(&recon, &x, &params)?;
        let s = losses.summary()?;

        let mean = |t: &Tensor| -> Result<f64> {
            let v = t.to_vec1::<f32>()?;
            Ok(v.iter().map(|&e| e as f64).sum::<f64>() / v.len() as f64)
        };
        let elbo = losses.nll.add(&losses.kld)?;
        assert_abs_diff_eq!(s.loss, mean(&losses.loss)?, epsilon = 1e-2);
        assert_abs_diff_eq!(s.elbo, mean(&elbo)?, epsilon = 1e-2);
        assert_abs_diff_eq!(s.nll, mean(&losses.nll)?, epsilon = 1e-2);
        assert_abs_diff_eq!(s.kld, mean(&losses.kld)?, epsilon = 1e-3);
        assert_abs_diff_eq!(s.mut_info, mean(&losses.mut_info)?, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn widths_follow_reparameterizer() -> Result<()> {
        for reparam_type in [ReparamType::IsotropicGaussian, ReparamType::Discrete, ReparamType::Mixture] {
            let vae = Vae::new(&[1, 8, 8], small_config(reparam_type, LayerType::Dense))?;
            assert_eq!(vae.encoder().dim_latent(), vae.reparameterizer().input_size());
            assert_eq!(vae.decoder().dim_latent(), vae.reparameterizer().output_size());
        }
        Ok(())
    }

    #[test]
    fn nll_rejects_shape_mismatch() -> Result<()> {
        let vae = Vae::new(&[1, 8, 8], small_config(ReparamType::IsotropicGaussian, LayerType::Dense))?;
        let a = Tensor::zeros((2, 1, 8, 8), DType::F32, &Device::Cpu)?;
        let b = Tensor::zeros((2, 64), DType::F32, &Device::Cpu)?;
        assert!(matches!(vae.nll(&a, &b), Err(VaeError::ShapeMismatch { .. })));
        Ok(())
    }

    #[test]
    fn name_is_deterministic_and_sensitive() -> Result<()> {
        let config = small_config(ReparamType::IsotropicGaussian, LayerType::Dense);
        let a = Vae::new(&[1, 8, 8], config.clone())?;
        let b = Vae::new(&[1, 8, 8], config.clone())?;
        assert_eq!(a.get_name(), b.get_name());
        assert_eq!(
            a.get_name(),
            "vae_mnist_input1_8_8_latent3_batch4_mut0.3_filter_depth2_nllbernoulli_reparamisotropic_gaussian_layerdense_lr0.001"
        );

        let wider = Arc::new(VaeConfig {
            continuous_size: 4,
            ..(*config).clone()
        });
        let c = Vae::new(&[1, 8, 8], wider)?;
        assert_ne!(a.get_name(), c.get_name());
        Ok(())
    }

    #[test]
    fn eval_forward_is_deterministic_for_gaussian() -> Result<()> {
        let vae = Vae::new(&[1, 8, 8], small_config(ReparamType::IsotropicGaussian, LayerType::Dense))?;
        let x = Tensor::rand(0f32, 1., (4, 1, 8, 8), &Device::Cpu)?;
        vae.forward(&x)?;
        let (r1, _) = vae.forward_t(&x, false)?;
        let (r2, _) = vae.forward_t(&x, false)?;
        assert_eq!(r1.flatten_all()?.to_vec1::<f32>()?, r2.flatten_all()?.to_vec1::<f32>()?);
        Ok(())
    }
}
