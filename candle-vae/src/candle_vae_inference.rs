use crate::candle_grapher::Grapher;
use crate::candle_image_data_loader::{DataLoader, ImageLoader};
use crate::candle_numeric_util::has_nan;
use crate::candle_vae_model::{LossSummary, Vae};

use candle_core::backprop::GradStore;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct TrainConfig {
    pub epochs: usize,
    /// each task trains `epochs + U[0, extra_epochs_max)` epochs
    pub extra_epochs_max: usize,
    pub log_interval: usize,
    pub show_progress: bool,
    pub verbose: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            extra_epochs_max: 13,
            log_interval: 10,
            show_progress: true,
            verbose: false,
        }
    }
}

/// Iteration counter owned by the driver
#[derive(Clone, Copy, Debug, Default)]
pub struct TrainState {
    pub total_iter: usize,
}

/// Exponential annealing of the Gumbel-Softmax temperature
///
/// tau(t) = max(tau0 * exp(-anneal_rate * t), min_tau)
///
/// applied every `interval` iterations.
#[derive(Clone, Copy, Debug)]
pub struct TemperatureSchedule {
    pub tau0: f64,
    pub min_tau: f64,
    pub anneal_rate: f64,
    pub interval: usize,
}

impl TemperatureSchedule {
    pub fn new(tau0: f64) -> Self {
        Self {
            tau0,
            min_tau: 0.5,
            anneal_rate: 3e-5,
            interval: 500,
        }
    }

    pub fn tau_at(&self, iter: usize) -> f64 {
        (self.tau0 * (-self.anneal_rate * iter as f64).exp()).max(self.min_tau)
    }

    pub fn should_update(&self, iter: usize) -> bool {
        self.interval > 0 && iter > 0 && iter % self.interval == 0
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EpochSummary {
    pub epoch: usize,
    /// batch-averaged loss terms
    pub losses: LossSummary,
    pub num_batches: usize,
    /// batches whose optimizer step was skipped for NaN gradients
    pub nan_batches: usize,
}

impl EpochSummary {
    fn accumulate(&mut self, s: &LossSummary) {
        self.losses.loss += s.loss;
        self.losses.elbo += s.elbo;
        self.losses.nll += s.nll;
        self.losses.kld += s.kld;
        self.losses.mut_info += s.mut_info;
        self.num_batches += 1;
    }

    fn finish(mut self) -> Self {
        let n = self.num_batches.max(1) as f64;
        self.losses.loss /= n;
        self.losses.elbo /= n;
        self.losses.nll /= n;
        self.losses.kld /= n;
        self.losses.mut_info /= n;
        self
    }
}

/// Names of the variables whose gradients contain NaN
pub fn nan_gradient_vars(vae: &Vae, grads: &GradStore) -> anyhow::Result<Vec<String>> {
    let data = vae
        .variable_map()
        .data()
        .lock()
        .map_err(|e| anyhow::anyhow!("variable map lock: {}", e))?;

    let mut ret = vec![];
    for (name, var) in data.iter() {
        if let Some(g) = grads.get(var.as_tensor()) {
            if has_nan(g)? {
                ret.push(name.clone());
            }
        }
    }
    ret.sort();
    Ok(ret)
}

/// Build the optimizer over every variable, sizing the lazy encoder
/// projection first with one forward pass
pub fn build_optimizer(vae: &Vae, warmup: &ImageLoader) -> anyhow::Result<AdamW> {
    if !vae.is_sized() {
        let mb = warmup.train.minibatch_data(0, vae.device())?;
        vae.forward(&mb.input)?;
    }
    let params = ParamsAdamW {
        lr: vae.config().lr,
        ..Default::default()
    };
    Ok(AdamW::new(vae.parameters(), params)?)
}

/// One pass over the training minibatches of `loader`
#[allow(clippy::too_many_arguments)]
pub fn train_epoch(
    vae: &mut Vae,
    optimizer: &mut AdamW,
    loader: &ImageLoader,
    epoch: usize,
    state: &mut TrainState,
    schedule: Option<&TemperatureSchedule>,
    grapher: &mut dyn Grapher,
    config: &TrainConfig,
) -> anyhow::Result<EpochSummary> {
    let mut summary = EpochSummary {
        epoch,
        ..Default::default()
    };
    let num_minibatch = loader.train.num_minibatch();
    let log_interval = config.log_interval.max(1);

    for b in 0..num_minibatch {
        let mb = loader.train.minibatch_data(b, vae.device())?;
        let (recon_x, params) = vae.forward(&mb.input)?;
        let losses = vae.loss_function(&recon_x, &mb.input, &params)?;
        let grads = losses.loss_mean.backward()?;

        let nan_vars = nan_gradient_vars(vae, &grads)?;
        if nan_vars.is_empty() {
            optimizer.step(&grads)?;
        } else {
            warn!(
                "NaN gradients at iteration {} in {:?}; skipped the step",
                state.total_iter, nan_vars
            );
            summary.nan_batches += 1;
        }

        let s = losses.summary()?;
        summary.accumulate(&s);

        if b % log_interval == 0 {
            info!(
                "[{}] train epoch {} [{}/{}]\tloss: {:.4}\tkld: {:.4}\tnll: {:.4}\tmi: {:.4}",
                loader.name,
                epoch,
                b * loader.batch_size,
                loader.train.num_samples(),
                s.loss,
                s.kld,
                s.nll,
                s.mut_info
            );
            grapher.register_scalar("train_loss", state.total_iter, s.loss);
            grapher.register_scalar("train_kld", state.total_iter, s.kld);
            grapher.register_scalar("train_nll", state.total_iter, s.nll);
            grapher.register_images("train_reconstructions", &vae.nll_activation(&recon_x)?);
            grapher.register_images("train_inputs", &mb.input);
            grapher.show();
        }

        state.total_iter += 1;

        if let Some(schedule) = schedule {
            if schedule.should_update(state.total_iter) {
                let tau = schedule.tau_at(state.total_iter);
                vae.set_temperature(tau);
                info!("temperature {:.4} at iteration {}", tau, state.total_iter);
            }
        }
    }

    Ok(summary.finish())
}

/// Evaluation-mode pass over the test minibatches of `loader`
pub fn test_epoch(
    vae: &Vae,
    loader: &ImageLoader,
    epoch: usize,
    grapher: &mut dyn Grapher,
) -> anyhow::Result<EpochSummary> {
    let mut summary = EpochSummary {
        epoch,
        ..Default::default()
    };

    let mut last = None;
    for b in 0..loader.test.num_minibatch() {
        let mb = loader.test.minibatch_data(b, vae.device())?;
        let (recon_x, params) = vae.forward_t(&mb.input, false)?;
        let losses = vae.loss_function_t(&recon_x, &mb.input, &params, false)?;
        summary.accumulate(&losses.summary()?);
        last = Some((recon_x, mb.input));
    }
    let summary = summary.finish();

    info!(
        "[{}] test epoch {}\tloss: {:.4}\tkld: {:.4}\tnll: {:.4}",
        loader.name, epoch, summary.losses.loss, summary.losses.kld, summary.losses.nll
    );

    grapher.register_scalar("test_loss", epoch, summary.losses.loss);
    grapher.register_scalar("test_kld", epoch, summary.losses.kld);
    grapher.register_scalar("test_nll", epoch, summary.losses.nll);
    if let Some((recon_x, x)) = last {
        grapher.register_images("test_reconstructions", &vae.nll_activation(&recon_x)?);
        grapher.register_images("test_inputs", &x);
    }
    grapher.show();

    Ok(summary)
}

/// Train on each loader in turn, testing after every epoch
///
/// # Returns one test summary per epoch, in order
pub fn run_lifelong(
    vae: &mut Vae,
    loaders: &mut [ImageLoader],
    grapher: &mut dyn Grapher,
    config: &TrainConfig,
) -> anyhow::Result<Vec<EpochSummary>> {
    let first = loaders
        .first()
        .ok_or_else(|| anyhow::anyhow!("no data loaders"))?;

    let mut optimizer = build_optimizer(vae, first)?;
    info!("optimizing {} variables", vae.parameters().len());

    let schedule = vae.temperature().map(TemperatureSchedule::new);
    let mut state = TrainState::default();
    let mut rng = StdRng::seed_from_u64(vae.noise().next_seed()?);

    let mut trace = vec![];

    for loader in loaders.iter_mut() {
        let extra = if config.extra_epochs_max > 0 {
            rng.random_range(0..config.extra_epochs_max)
        } else {
            0
        };
        let num_epochs = config.epochs + extra;
        info!("{}: {} epochs", loader.name, num_epochs);

        let pb = ProgressBar::new(num_epochs as u64);
        if !config.show_progress || config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        for epoch in 1..=num_epochs {
            loader.shuffle_train(&mut rng);
            let train = train_epoch(
                vae,
                &mut optimizer,
                loader,
                epoch,
                &mut state,
                schedule.as_ref(),
                grapher,
                config,
            )?;
            if train.nan_batches > 0 {
                warn!(
                    "[{}] epoch {}: {} of {} steps skipped",
                    loader.name, epoch, train.nan_batches, train.num_batches
                );
            }
            trace.push(test_epoch(vae, loader, epoch, grapher)?);
            pb.inc(1);
        }
        pb.finish_and_clear();
    }

    Ok(trace)
}
