use crate::error::Result;

use candle_core::Tensor;

pub trait EncoderModuleT {
    /// An encoder that maps images to reparameterizer logits
    ///
    /// # Arguments
    /// * `x_nchw` - input images (n x c x h x w)
    /// * `train` - whether to update batch norm statistics or not
    ///
    /// # Returns `logits_nd` (n x input_size of the reparameterizer)
    fn forward_t(&self, x_nchw: &Tensor, train: bool) -> Result<Tensor>;

    /// per-example input shape `[c, h, w]`
    fn dim_obs(&self) -> &[usize];

    /// width of the logits
    fn dim_latent(&self) -> usize;
}

pub trait DecoderModuleT {
    /// A decoder that spits out reconstruction logits
    ///
    /// # Arguments
    /// * `z_nk` - latent sample (n x output_size of the reparameterizer)
    /// * `train` - whether to update batch norm statistics or not
    ///
    /// # Returns `logits_nchw`, the shape of the encoder's input
    fn forward_t(&self, z_nk: &Tensor, train: bool) -> Result<Tensor>;

    /// per-example reconstruction shape `[c, h, w]`
    fn dim_obs(&self) -> &[usize];

    /// width of the latent sample
    fn dim_latent(&self) -> usize;
}
