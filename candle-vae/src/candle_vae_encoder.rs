use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;
use crate::error::{Result, VaeError};
use crate::vae_config::LayerType;

use candle_core::Tensor;
use candle_nn::{Activation, Conv2d, Conv2dConfig, Linear, Module, ModuleT, VarBuilder};
use log::{debug, info};
use std::sync::OnceLock;

/// spatial size the convolutional stack is built for
pub const CONV_IMAGE_SIZE: usize = 32;

enum EncoderBody {
    Conv(StackLayers<Conv2d>),
    Dense(StackLayers<Linear>),
}

/// flatten-to-logits projection, sized by the first forward pass
struct SizedProjection {
    linear: Linear,
    input_shape: Vec<usize>,
    width: usize,
}

/// Maps images to reparameterizer logits.
///
/// The final projection is created on the first `forward_t` from the
/// measured width of the body output. Until then the encoder is
/// unsized; afterwards every input must have the shape seen at sizing
/// time.
pub struct ImageEncoder {
    input_shape: Vec<usize>,
    output_size: usize,
    body: EncoderBody,
    proj: OnceLock<SizedProjection>,
    vs: VarBuilder<'static>,
}

impl EncoderModuleT for ImageEncoder {
    fn forward_t(&self, x_nchw: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.body_forward_t(x_nchw, train)?;
        let proj = self.projection(x_nchw, &h)?;
        let h_nd = h.flatten_from(1)?;
        Ok(proj.linear.forward(&h_nd)?)
    }

    fn dim_obs(&self) -> &[usize] {
        &self.input_shape
    }

    fn dim_latent(&self) -> usize {
        self.output_size
    }
}

impl ImageEncoder {
    /// Will create a new image encoder with these variables:
    ///
    /// * `enc.conv.{}.weight` and `enc.conv.{}.bn` for the conv stack
    /// * `enc.fc.{}.weight` and `enc.fc.{}.bn` for the dense stack
    /// * `enc.proj.weight`, created on the first forward pass
    ///
    /// # Arguments
    /// * `input_shape` - per-example image shape `[c, h, w]`
    /// * `output_size` - logits width expected by the reparameterizer
    /// * `layer_type` - conv or dense body
    /// * `filter_depth` - base number of conv filters
    /// * `vs` - variable builder
    pub fn new(
        input_shape: &[usize],
        output_size: usize,
        layer_type: LayerType,
        filter_depth: usize,
        vs: VarBuilder<'static>,
    ) -> Result<Self> {
        let chans = check_image_shape(input_shape)?;

        let body = match layer_type {
            LayerType::Conv => {
                EncoderBody::Conv(conv_stack(chans, output_size, filter_depth, vs.pp("enc.conv"))?)
            }
            LayerType::Dense => {
                let d: usize = input_shape.iter().product();
                EncoderBody::Dense(dense_stack(d, output_size, vs.pp("enc.fc"))?)
            }
        };

        Ok(Self {
            input_shape: input_shape.to_vec(),
            output_size,
            body,
            proj: OnceLock::new(),
            vs,
        })
    }

    /// whether the lazy projection has been built
    pub fn is_sized(&self) -> bool {
        self.proj.get().is_some()
    }

    /// measured body width, once sized
    pub fn projection_width(&self) -> Option<usize> {
        self.proj.get().map(|p| p.width)
    }

    fn body_forward_t(&self, x_nchw: &Tensor, train: bool) -> Result<Tensor> {
        let dims = x_nchw.dims();
        if dims.len() != 4 {
            let mut expected = vec![0];
            expected.extend_from_slice(&self.input_shape);
            return Err(VaeError::shape("encoder input", &expected, dims));
        }

        match &self.body {
            EncoderBody::Conv(conv) => {
                if dims[1] != self.input_shape[0] {
                    return Err(VaeError::shape(
                        "encoder input channels",
                        &self.input_shape[..1],
                        &dims[1..2],
                    ));
                }
                let x = resize_image(x_nchw, CONV_IMAGE_SIZE, CONV_IMAGE_SIZE)?;
                Ok(conv.forward_t(&x, train)?)
            }
            EncoderBody::Dense(fc) => {
                if dims[1..] != self.input_shape[..] {
                    return Err(VaeError::shape("encoder input", &self.input_shape, &dims[1..]));
                }
                Ok(fc.forward_t(&x_nchw.flatten_from(1)?, train)?)
            }
        }
    }

    fn projection(&self, x_nchw: &Tensor, h: &Tensor) -> Result<&SizedProjection> {
        let input_shape = &x_nchw.dims()[1..];

        if let Some(proj) = self.proj.get() {
            if proj.input_shape[..] != *input_shape {
                return Err(VaeError::shape(
                    "encoder input after sizing",
                    &proj.input_shape,
                    input_shape,
                ));
            }
            return Ok(proj);
        }

        let width: usize = h.dims()[1..].iter().product();
        let linear = candle_nn::linear(width, self.output_size, self.vs.pp("enc.proj"))?;
        info!(
            "sized encoder projection: {:?} -> {} -> {}",
            input_shape, width, self.output_size
        );

        self.proj
            .set(SizedProjection {
                linear,
                input_shape: input_shape.to_vec(),
                width,
            })
            .map_err(|_| VaeError::config("encoder projection was sized twice"))?;
        self.proj
            .get()
            .ok_or_else(|| VaeError::config("encoder projection was not initialized"))
    }
}

/// `[c, h, w]` with positive entries; returns `c`
pub(crate) fn check_image_shape(input_shape: &[usize]) -> Result<usize> {
    match *input_shape {
        [c, h, w] if c > 0 && h > 0 && w > 0 => Ok(c),
        _ => Err(VaeError::config(format!(
            "input shape must be [channels, height, width], got {:?}",
            input_shape
        ))),
    }
}

/// nearest-neighbour resampling to `h x w`; identity when already there
pub(crate) fn resize_image(x_nchw: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    let (_, _, xh, xw) = x_nchw.dims4()?;
    if xh == h && xw == w {
        Ok(x_nchw.clone())
    } else {
        debug!("resampling {}x{} -> {}x{}", xh, xw, h, w);
        Ok(x_nchw.upsample_nearest2d(h, w)?)
    }
}

fn conv_cfg(stride: usize) -> Conv2dConfig {
    Conv2dConfig {
        stride,
        ..Default::default()
    }
}

/// 32x32 -> 28 -> 13 -> 10 -> 4 -> 1
fn conv_stack(
    chans: usize,
    output_size: usize,
    filter_depth: usize,
    vs: VarBuilder,
) -> Result<StackLayers<Conv2d>> {
    let f = filter_depth;
    let layers = [
        (chans, f, 5, 1),
        (f, 2 * f, 4, 2),
        (2 * f, 4 * f, 4, 1),
        (4 * f, 8 * f, 4, 2),
        (8 * f, 16 * f, 4, 1),
        (16 * f, 16 * f, 1, 1),
        (16 * f, output_size, 1, 1),
    ];

    let mut conv = StackLayers::<Conv2d>::new();
    for (j, &(c_in, c_out, kernel, stride)) in layers.iter().enumerate() {
        conv.push_with_norm_act(
            candle_nn::conv2d(c_in, c_out, kernel, conv_cfg(stride), vs.pp(j))?,
            c_out,
            Activation::Relu,
            vs.pp(format!("{}.bn", j)),
        )?;
    }
    Ok(conv)
}

fn dense_stack(input_dim: usize, output_size: usize, vs: VarBuilder) -> Result<StackLayers<Linear>> {
    let mut fc = StackLayers::<Linear>::new();
    let mut prev_dim = input_dim;
    for j in 0..2 {
        fc.push_with_norm_act(
            candle_nn::linear(prev_dim, output_size, vs.pp(j))?,
            output_size,
            Activation::Relu,
            vs.pp(format!("{}.bn", j)),
        )?;
        prev_dim = output_size;
    }
    fc.push(candle_nn::linear(prev_dim, output_size, vs.pp("2"))?);
    Ok(fc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn encoder(shape: &[usize], layer_type: LayerType) -> Result<(ImageEncoder, VarMap)> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let enc = ImageEncoder::new(shape, 12, layer_type, 2, vs)?;
        Ok((enc, varmap))
    }

    #[test]
    fn conv_encoder_sizes_lazily() -> Result<()> {
        let (enc, varmap) = encoder(&[1, 28, 28], LayerType::Conv)?;
        assert!(!enc.is_sized());
        let n_before = varmap.all_vars().len();

        let x = Tensor::rand(0f32, 1., (3, 1, 28, 28), &Device::Cpu)?;
        let logits = enc.forward_t(&x, true)?;
        assert_eq!(logits.dims(), &[3, 12]);
        assert_eq!(enc.projection_width(), Some(12));
        assert!(varmap.all_vars().len() > n_before);

        // sized exactly once
        let n_after = varmap.all_vars().len();
        enc.forward_t(&x, false)?;
        assert_eq!(varmap.all_vars().len(), n_after);
        Ok(())
    }

    #[test]
    fn rejects_new_shape_after_sizing() -> Result<()> {
        let (enc, _) = encoder(&[1, 28, 28], LayerType::Conv)?;
        enc.forward_t(&Tensor::zeros((2, 1, 28, 28), DType::F32, &Device::Cpu)?, true)?;

        let other = Tensor::zeros((2, 1, 32, 32), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            enc.forward_t(&other, true),
            Err(VaeError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn dense_encoder_checks_input() -> Result<()> {
        let (enc, _) = encoder(&[1, 6, 5], LayerType::Dense)?;
        let x = Tensor::rand(0f32, 1., (4, 1, 6, 5), &Device::Cpu)?;
        assert_eq!(enc.forward_t(&x, true)?.dims(), &[4, 12]);

        let flat = Tensor::rand(0f32, 1., (4, 30), &Device::Cpu)?;
        assert!(matches!(
            enc.forward_t(&flat, true),
            Err(VaeError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn bad_image_shape_is_a_config_error() {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(
            ImageEncoder::new(&[28, 28], 4, LayerType::Conv, 2, vs),
            Err(VaeError::Configuration(_))
        ));
    }
}
