pub mod candle_aux_layers;
pub mod candle_grapher;
pub mod candle_image_data_loader;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod candle_numeric_util;
pub mod candle_reparam_gaussian;
pub mod candle_reparam_gumbel;
pub mod candle_reparam_mixture;
pub mod candle_reparam_traits;
pub mod candle_reparameterizer;
pub mod candle_vae_decoder;
pub mod candle_vae_encoder;
pub mod candle_vae_inference;
pub mod candle_vae_model;
pub mod cli;
pub mod error;
pub mod vae_config;

pub use candle_core;
pub use candle_nn;
