use candle_core::Tensor;
use log::info;
use std::collections::BTreeMap;

/// Sink for training curves and image grids. Loss values never depend
/// on it.
pub trait Grapher {
    fn register_scalar(&mut self, name: &str, step: usize, value: f64);

    fn register_images(&mut self, name: &str, images: &Tensor);

    /// flush whatever has been registered so far
    fn show(&mut self) {}
}

pub struct NullGrapher;

impl Grapher for NullGrapher {
    fn register_scalar(&mut self, _name: &str, _step: usize, _value: f64) {}

    fn register_images(&mut self, _name: &str, _images: &Tensor) {}
}

/// Logs every scalar and keeps the curves in memory
#[derive(Default)]
pub struct LogGrapher {
    env: String,
    scalars: BTreeMap<String, Vec<(usize, f64)>>,
    num_pending: usize,
}

impl LogGrapher {
    pub fn new(env: &str) -> Self {
        Self {
            env: env.to_string(),
            ..Default::default()
        }
    }

    pub fn scalars(&self, name: &str) -> &[(usize, f64)] {
        self.scalars.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

impl Grapher for LogGrapher {
    fn register_scalar(&mut self, name: &str, step: usize, value: f64) {
        self.scalars
            .entry(name.to_string())
            .or_default()
            .push((step, value));
        self.num_pending += 1;
    }

    fn register_images(&mut self, name: &str, images: &Tensor) {
        info!("[{}] {} images {:?}", self.env, name, images.dims());
    }

    fn show(&mut self) {
        if self.num_pending == 0 {
            return;
        }
        for (name, curve) in self.scalars.iter() {
            if let Some((step, value)) = curve.last() {
                info!("[{}] {} @{}: {:.4}", self.env, name, step, value);
            }
        }
        self.num_pending = 0;
    }
}
