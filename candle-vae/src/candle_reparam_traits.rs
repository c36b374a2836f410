use crate::error::{Result, VaeError};

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::sync::{Arc, Mutex};

/// Converts encoder logits into a latent sample and the parameters
/// needed later for the KL (and mutual information) terms.
pub trait ReparameterizerT {
    /// Draw a reparameterized latent sample
    ///
    /// # Arguments
    /// * `logits_nd` - encoder output (n x input_size)
    /// * `train` - stochastic sampling if true, deterministic otherwise
    ///
    /// # Returns `(z_nk, params)`
    /// * `z_nk` - latent sample (n x output_size), differentiable in logits
    /// * `params` - distribution parameters for `kl`
    fn sample(&self, logits_nd: &Tensor, train: bool) -> Result<(Tensor, LatentParams)>;

    /// KL divergence to the prior, one value per row (n)
    fn kl(&self, params: &LatentParams) -> Result<Tensor>;

    /// Mutual information regularizer, one value per row (n);
    /// `None` when the family defines no such term
    fn mutual_info(&self, _params: &LatentParams) -> Result<Option<Tensor>> {
        Ok(None)
    }

    /// Whether `mutual_info` needs the reconstruction re-encoded
    fn needs_reencoding(&self) -> bool {
        false
    }

    /// width of the logits this reparameterizer consumes
    fn input_size(&self) -> usize;

    /// width of the latent sample it produces
    fn output_size(&self) -> usize;

    /// current Gumbel-Softmax temperature, if any
    fn tau(&self) -> Option<f64> {
        None
    }

    fn set_tau(&mut self, _tau: f64) {}
}

/// Check that logits are (n x expected_width)
pub(crate) fn check_logits_width(
    context: &'static str,
    logits_nd: &Tensor,
    expected_width: usize,
) -> Result<()> {
    match *logits_nd.dims() {
        [_, d] if d == expected_width => Ok(()),
        [n, _] => Err(VaeError::shape(
            context,
            &[n, expected_width],
            logits_nd.dims(),
        )),
        _ => Err(VaeError::shape(context, &[0, expected_width], logits_nd.dims())),
    }
}

//////////////////////////////
// latent parameter records //
//////////////////////////////

#[derive(Clone, Debug)]
pub struct GaussianParams {
    pub mu: Tensor,
    pub logvar: Tensor,
}

#[derive(Clone, Debug)]
pub struct DiscreteParams {
    /// pre-softmax logits
    pub logits: Tensor,
    pub tau: f64,
    /// one-hot argmax of the sample, no gradient
    pub z_hard: Tensor,
}

#[derive(Clone, Debug)]
pub struct MixtureParams {
    pub discrete: DiscreteParams,
    pub gaussian: GaussianParams,
    /// feature index where the continuous logits start
    pub split: usize,
    /// discrete logits of q(z | x_hat), filled in by re-encoding
    pub q_z_given_xhat: Option<Tensor>,
}

/// Parameters of the latent distribution; the variant is fixed by
/// the reparameterizer that produced it.
#[derive(Clone, Debug)]
pub enum LatentParams {
    Gaussian(GaussianParams),
    Discrete(DiscreteParams),
    Mixture(MixtureParams),
}

impl LatentParams {
    pub fn family(&self) -> &'static str {
        match self {
            LatentParams::Gaussian(_) => "isotropic_gaussian",
            LatentParams::Discrete(_) => "discrete",
            LatentParams::Mixture(_) => "mixture",
        }
    }

    pub fn as_gaussian(&self) -> Result<&GaussianParams> {
        match self {
            LatentParams::Gaussian(p) => Ok(p),
            other => Err(VaeError::ParamMismatch {
                expected: "isotropic_gaussian",
                actual: other.family(),
            }),
        }
    }

    pub fn as_discrete(&self) -> Result<&DiscreteParams> {
        match self {
            LatentParams::Discrete(p) => Ok(p),
            other => Err(VaeError::ParamMismatch {
                expected: "discrete",
                actual: other.family(),
            }),
        }
    }

    pub fn as_mixture(&self) -> Result<&MixtureParams> {
        match self {
            LatentParams::Mixture(p) => Ok(p),
            other => Err(VaeError::ParamMismatch {
                expected: "mixture",
                actual: other.family(),
            }),
        }
    }

    /// A copy of a mixture record carrying the discrete part of
    /// re-encoded logits `logits_xhat` (n x input_size).
    pub fn with_reencoded(&self, logits_xhat: &Tensor) -> Result<LatentParams> {
        let p = self.as_mixture()?;
        let q = logits_xhat.narrow(1, 0, p.split)?;
        Ok(LatentParams::Mixture(MixtureParams {
            q_z_given_xhat: Some(q),
            ..p.clone()
        }))
    }
}

//////////////////
// noise source //
//////////////////

/// Seeded generator shared by the reparameterizers of one model.
///
/// Candle's CPU backend cannot be seeded, so noise is drawn here and
/// copied into tensors.
#[derive(Clone)]
pub struct NoiseSource {
    rng: Arc<Mutex<StdRng>>,
}

impl NoiseSource {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    fn draw<F>(&self, like: &Tensor, mut f: F) -> candle_core::Result<Tensor>
    where
        F: FnMut(&mut StdRng) -> f32,
    {
        let mut guard = self
            .rng
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("noise source: {}", e)))?;
        let rng: &mut StdRng = &mut guard;
        let ntot = like.elem_count();
        let mut data = Vec::with_capacity(ntot);
        for _ in 0..ntot {
            data.push(f(rng));
        }
        Tensor::from_vec(data, like.dims().to_vec(), like.device())?.to_dtype(like.dtype())
    }

    /// eps ~ N(0, 1) with the shape, dtype and device of `like`
    pub fn standard_normal_like(&self, like: &Tensor) -> candle_core::Result<Tensor> {
        self.draw(like, |rng| rng.sample::<f32, _>(StandardNormal))
    }

    /// u ~ Uniform[0, 1) with the shape, dtype and device of `like`
    pub fn uniform_like(&self, like: &Tensor) -> candle_core::Result<Tensor> {
        self.draw(like, |rng| rng.random::<f32>())
    }

    /// a child seed for other consumers (e.g. minibatch shuffling)
    pub fn next_seed(&self) -> candle_core::Result<u64> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("noise source: {}", e)))?;
        Ok(rng.random::<u64>())
    }
}
