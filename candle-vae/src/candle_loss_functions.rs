use core::f64;

use crate::candle_numeric_util::one_hot;
use candle_core::{Result, Tensor, D};
use candle_nn::ops;

/// KL divergence between a diagonal Gaussian and N(0, I)
///
/// 0.5 * sum_k ( exp(lnvar) + mu^2 - 1 - lnvar )
///
/// * `z_mean` - mean of Gaussian distribution (n x k)
/// * `z_lnvar` - log variance of Gaussian distribution (n x k)
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (z_var - 1. + z_mean.powf(2.)? - z_lnvar)?.sum(z_mean.rank() - 1)? * 0.5
}

/// KL divergence between softmax(logits) and a uniform categorical
///
/// sum_k p(k) * log( p(k) * K )
///
/// * `logits_nk` - pre-softmax logits (n x k)
///
pub fn categorical_uniform_kl_loss(logits_nk: &Tensor) -> Result<Tensor> {
    let last = logits_nk.rank() - 1;
    let num_classes = logits_nk.dim(last)? as f64;
    let log_p_nk = ops::log_softmax(logits_nk, last)?;
    let p_nk = log_p_nk.exp()?;
    p_nk.mul(&(log_p_nk + num_classes.ln())?)?.sum(last)
}

/// Bernoulli negative log-likelihood on logits
///
/// nll(i) = sum_d max(-l,0) + l - l*x + log( exp(-max) + exp(-l-max) )
///
/// Everything but the batch axis is summed.
///
/// * `logits` - reconstruction logits (n x ...)
/// * `x` - observed data in [0, 1] (same shape)
///
pub fn bernoulli_nll(logits: &Tensor, x: &Tensor) -> Result<Tensor> {
    let logits_nd = logits.flatten_from(1)?;
    let x_nd = x.flatten_from(1)?;

    let max_nd = logits_nd.neg()?.relu()?;
    let log_term = max_nd
        .neg()?
        .exp()?
        .add(&logits_nd.neg()?.sub(&max_nd)?.exp()?)?
        .log()?;

    logits_nd
        .sub(&logits_nd.mul(&x_nd)?)?
        .add(&max_nd)?
        .add(&log_term)?
        .sum(1)
}

/// Gaussian negative log-likelihood with a fixed scale
///
/// z = (x - loc) / (scale + eps)
/// nll(i) = sum_d 0.5 * z^2 + log(scale + eps) + 0.5 * log(2 pi)
///
/// * `loc` - reconstruction (n x ...)
/// * `x` - observed data (same shape)
/// * `scale` - observation standard deviation
///
pub fn gaussian_nll(loc: &Tensor, x: &Tensor, scale: f64) -> Result<Tensor> {
    let eps = 1e-9;
    let loc_nd = loc.flatten_from(1)?;
    let x_nd = x.flatten_from(1)?;
    let dd = x_nd.dim(1)? as f64;

    let log_norm = (scale + eps).ln() + 0.5 * (2. * f64::consts::PI).ln();
    let z_nd = (x_nd.sub(&loc_nd)? / (scale + eps))?;
    let sq_n = (z_nd.sqr()?.sum(1)? * 0.5)?;
    sq_n + log_norm * dd
}

/// Per-example cross entropy of categorical logits against class targets
///
/// ce(i) = - log softmax(logits)[i, target(i)]
///
/// * `logits_nk` - pre-softmax logits (n x k)
/// * `targets_n` - class indexes (n)
///
pub fn cross_entropy_per_example(logits_nk: &Tensor, targets_n: &Tensor) -> Result<Tensor> {
    let k = logits_nk.dim(D::Minus1)?;
    let log_p_nk = ops::log_softmax(logits_nk, D::Minus1)?;
    let mask_nk = one_hot(targets_n, k, log_p_nk.dtype())?;
    log_p_nk.mul(&mask_nk)?.sum(D::Minus1)?.neg()
}
