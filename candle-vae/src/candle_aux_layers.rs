use candle_core::{Result, Tensor};
use candle_nn::{Activation, BatchNorm, BatchNormConfig, Module, ModuleT, VarBuilder};

/// batch norm settings shared by every normalized layer
pub fn default_bn_config() -> BatchNormConfig {
    BatchNormConfig {
        eps: 1e-4,
        remove_mean: true,
        affine: true,
        momentum: 0.1,
    }
}

struct StackedLayer<M: Module> {
    module: M,
    norm: Option<BatchNorm>,
    activation: Option<Activation>,
}

/// build a stack of `M` layers, each optionally followed by batch
/// normalization and then an activation
pub struct StackLayers<M>
where
    M: Module,
{
    layers: Vec<StackedLayer<M>>,
}

impl<M> ModuleT for StackLayers<M>
where
    M: Module,
{
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for layer in self.layers.iter() {
            x = layer.module.forward(&x)?;
            if let Some(norm) = &layer.norm {
                x = norm.forward_t(&x, train)?;
            }
            if let Some(activation) = &layer.activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.layers.push(StackedLayer {
            module: layer,
            norm: None,
            activation: Some(activation),
        });
    }

    /// Appends `layer -> batch_norm(num_features) -> activation`; the
    /// norm variables live under `vs`
    pub fn push_with_norm_act(
        &mut self,
        layer: M,
        num_features: usize,
        activation: Activation,
        vs: VarBuilder,
    ) -> Result<()> {
        let norm = candle_nn::batch_norm(num_features, default_bn_config(), vs)?;
        self.layers.push(StackedLayer {
            module: layer,
            norm: Some(norm),
            activation: Some(activation),
        });
        Ok(())
    }

    pub fn push(&mut self, layer: M) {
        self.layers.push(StackedLayer {
            module: layer,
            norm: None,
            activation: None,
        });
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Linear, VarMap};

    #[test]
    fn normalized_stack_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

        let mut fc = StackLayers::<Linear>::new();
        fc.push_with_norm_act(
            candle_nn::linear(7, 5, vs.pp("fc.0"))?,
            5,
            Activation::Relu,
            vs.pp("fc.0.bn"),
        )?;
        fc.push(candle_nn::linear(5, 3, vs.pp("fc.1"))?);
        assert_eq!(fc.len(), 2);

        let x = Tensor::randn(0f32, 1., (4, 7), &dev)?;
        assert_eq!(fc.forward_t(&x, true)?.dims(), &[4, 3]);
        assert_eq!(fc.forward_t(&x, false)?.dims(), &[4, 3]);

        let names: Vec<String> = varmap.data().lock().map_or(vec![], |d| d.keys().cloned().collect());
        assert!(names.iter().any(|n| n.starts_with("fc.0.bn")));
        Ok(())
    }

    #[test]
    fn relu_stack_is_non_negative() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

        let mut fc = StackLayers::<Linear>::new();
        fc.push_with_act(candle_nn::linear(3, 6, vs.pp("fc"))?, Activation::Relu);
        let y = fc.forward_t(&Tensor::randn(0f32, 1., (5, 3), &dev)?, false)?;
        assert!(y.min_all()?.to_scalar::<f32>()? >= 0.);
        Ok(())
    }
}
