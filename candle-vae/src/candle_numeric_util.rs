use candle_core::{DType, Result, Tensor};

/// softplus with beta = 1, written in the overflow-safe form
///
/// oneplus(x) = max(x, 0) + log(1 + exp(-|x|))
///
pub fn oneplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    x.relu()?.add(&tail)
}

/// One-hot rows for integer class indexes
///
/// * `indices_n` - class index per row (any integer dtype)
/// * `depth` - number of classes
/// * `dtype` - dtype of the returned (n x depth) matrix
///
pub fn one_hot(indices_n: &Tensor, depth: usize, dtype: DType) -> Result<Tensor> {
    let idx_n1 = to_index(&indices_n.flatten_all()?)?.unsqueeze(1)?;
    let classes_1k = Tensor::arange(0u32, depth as u32, indices_n.device())?.unsqueeze(0)?;
    classes_1k.broadcast_eq(&idx_n1)?.to_dtype(dtype)
}

/// Coerce to the floating type the models run in
pub fn to_float(x: &Tensor) -> Result<Tensor> {
    match x.dtype() {
        DType::F32 => Ok(x.clone()),
        _ => x.to_dtype(DType::F32),
    }
}

/// Coerce to the index type used for class labels and argmax
pub fn to_index(x: &Tensor) -> Result<Tensor> {
    match x.dtype() {
        DType::U32 => Ok(x.clone()),
        _ => x.to_dtype(DType::U32),
    }
}

/// insert a singleton axis at `dim`
pub fn expand_dims(x: &Tensor, dim: usize) -> Result<Tensor> {
    x.unsqueeze(dim)
}

/// True if any element is NaN; infinities do not count
pub fn has_nan(x: &Tensor) -> Result<bool> {
    if x.elem_count() == 0 {
        return Ok(false);
    }
    let nan_mask = x.ne(x)?.flatten_all()?;
    Ok(nan_mask.max(0)?.to_scalar::<u8>()? > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn oneplus_matches_naive_softplus() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[-3f32, -0.5, 0.0, 0.5, 3.0], &dev)?;
        let got = oneplus(&x)?.to_vec1::<f32>()?;
        for (g, v) in got.iter().zip([-3f32, -0.5, 0.0, 0.5, 3.0]) {
            let expected = (1.0 + v.exp()).ln();
            assert!((g - expected).abs() < 1e-6, "{} vs {}", g, expected);
        }
        Ok(())
    }

    #[test]
    fn oneplus_large_input_is_finite() -> Result<()> {
        let x = Tensor::new(&[120f32, -120.0], &Device::Cpu)?;
        let got = oneplus(&x)?.to_vec1::<f32>()?;
        assert!((got[0] - 120.0).abs() < 1e-4);
        assert!(got[1] >= 0.0 && got[1] < 1e-6);
        Ok(())
    }

    #[test]
    fn one_hot_rows() -> Result<()> {
        let idx = Tensor::new(&[2u32, 0, 1], &Device::Cpu)?;
        let oh = one_hot(&idx, 3, DType::F32)?.to_vec2::<f32>()?;
        assert_eq!(
            oh,
            vec![vec![0., 0., 1.], vec![1., 0., 0.], vec![0., 1., 0.]]
        );
        Ok(())
    }

    #[test]
    fn nan_detection_is_elementwise() -> Result<()> {
        let dev = Device::Cpu;
        let opposite_infs = Tensor::new(&[f32::INFINITY, f32::NEG_INFINITY, 1.0], &dev)?;
        assert!(!has_nan(&opposite_infs)?);
        let with_nan = Tensor::new(&[[0f32, f32::NAN], [2.0, 3.0]], &dev)?;
        assert!(has_nan(&with_nan)?);
        assert!(!has_nan(&Tensor::zeros((2, 2), DType::F32, &dev)?)?);
        Ok(())
    }

    #[test]
    fn dtype_coercion() -> Result<()> {
        let x = Tensor::new(&[1.7f64, 2.0], &Device::Cpu)?;
        assert_eq!(to_float(&x)?.dtype(), DType::F32);
        assert_eq!(to_index(&x)?.dtype(), DType::U32);
        assert_eq!(expand_dims(&x, 0)?.dims(), &[1, 2]);
        Ok(())
    }
}
