use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;
use crate::candle_vae_encoder::{check_image_shape, resize_image, CONV_IMAGE_SIZE};
use crate::error::{Result, VaeError};
use crate::vae_config::LayerType;

use candle_core::Tensor;
use candle_nn::{
    Activation, Conv2d, ConvTranspose2d, ConvTranspose2dConfig, Linear, Module, ModuleT,
    VarBuilder,
};

enum DecoderBody {
    Conv {
        deconv: StackLayers<ConvTranspose2d>,
        to_chans: Conv2d,
    },
    Dense(StackLayers<Linear>),
}

/// Maps latent samples back to reconstruction logits of the input
/// image shape.
pub struct ImageDecoder {
    output_shape: Vec<usize>,
    input_size: usize,
    body: DecoderBody,
}

impl DecoderModuleT for ImageDecoder {
    fn forward_t(&self, z_nk: &Tensor, train: bool) -> Result<Tensor> {
        let (n, k) = z_nk.dims2()?;
        if k != self.input_size {
            return Err(VaeError::shape("decoder input", &[n, self.input_size], &[n, k]));
        }

        let (c, h, w) = (self.output_shape[0], self.output_shape[1], self.output_shape[2]);

        match &self.body {
            DecoderBody::Conv { deconv, to_chans } => {
                let z_nk11 = z_nk.contiguous()?.reshape((n, k, 1, 1))?;
                let h_nchw = deconv.forward_t(&z_nk11, train)?;
                let logits = to_chans.forward(&h_nchw)?;
                resize_image(&logits, h, w)
            }
            DecoderBody::Dense(fc) => {
                let logits_nd = fc.forward_t(z_nk, train)?;
                Ok(logits_nd.reshape((n, c, h, w))?)
            }
        }
    }

    fn dim_obs(&self) -> &[usize] {
        &self.output_shape
    }

    fn dim_latent(&self) -> usize {
        self.input_size
    }
}

impl ImageDecoder {
    /// Will create a new image decoder with these variables:
    ///
    /// * `dec.deconv.{}.weight` and `dec.deconv.{}.bn`, then
    ///   `dec.out.weight` for the conv stack
    /// * `dec.fc.{}.weight` and `dec.fc.{}.bn` for the dense stack
    ///
    /// # Arguments
    /// * `output_shape` - per-example image shape `[c, h, w]`
    /// * `input_size` - latent width of the reparameterizer
    /// * `layer_type` - conv or dense body
    /// * `filter_depth` - base number of conv filters
    /// * `vs` - variable builder
    pub fn new(
        output_shape: &[usize],
        input_size: usize,
        layer_type: LayerType,
        filter_depth: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        let chans = check_image_shape(output_shape)?;
        let f = filter_depth;

        let body = match layer_type {
            LayerType::Conv => {
                // 1x1 -> 4 -> 10 -> 13 -> 28 -> 32
                let layers = [
                    (input_size, 8 * f, 4, 1),
                    (8 * f, 4 * f, 4, 2),
                    (4 * f, 2 * f, 4, 1),
                    (2 * f, f, 4, 2),
                    (f, f, 5, 1),
                ];

                let vs_deconv = vs.pp("dec.deconv");
                let mut deconv = StackLayers::<ConvTranspose2d>::new();
                for (j, &(c_in, c_out, kernel, stride)) in layers.iter().enumerate() {
                    let cfg = ConvTranspose2dConfig {
                        stride,
                        ..Default::default()
                    };
                    deconv.push_with_norm_act(
                        candle_nn::conv_transpose2d(c_in, c_out, kernel, cfg, vs_deconv.pp(j))?,
                        c_out,
                        Activation::Relu,
                        vs_deconv.pp(format!("{}.bn", j)),
                    )?;
                }
                let to_chans = candle_nn::conv2d(f, chans, 1, Default::default(), vs.pp("dec.out"))?;
                DecoderBody::Conv { deconv, to_chans }
            }
            LayerType::Dense => {
                let d: usize = output_shape.iter().product();
                let vs_fc = vs.pp("dec.fc");
                let mut fc = StackLayers::<Linear>::new();
                for j in 0..2 {
                    fc.push_with_norm_act(
                        candle_nn::linear(input_size, input_size, vs_fc.pp(j))?,
                        input_size,
                        Activation::Relu,
                        vs_fc.pp(format!("{}.bn", j)),
                    )?;
                }
                fc.push(candle_nn::linear(input_size, d, vs_fc.pp(2))?);
                DecoderBody::Dense(fc)
            }
        };

        Ok(Self {
            output_shape: output_shape.to_vec(),
            input_size,
            body,
        })
    }

    /// spatial size of the conv stack output before resampling
    pub fn conv_output_size(&self) -> Option<usize> {
        match self.body {
            DecoderBody::Conv { .. } => Some(CONV_IMAGE_SIZE),
            DecoderBody::Dense(_) => None,
        }
    }
}
