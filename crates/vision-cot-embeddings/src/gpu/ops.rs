//! Tensor helpers shared by the marker table, evaluation and loss engine.

use candle_core::{Tensor, D};

use crate::error::{VisionCotError, VisionCotResult};

/// Normalize the last dimension to unit length.
///
/// `normalized = tensor / (||tensor||_2 + 1e-12)`
pub fn l2_normalize(tensor: &Tensor) -> candle_core::Result<Tensor> {
    let norm = tensor.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    tensor.broadcast_div(&(norm + 1e-12)?)
}

/// L2 norm of each row of a `[N, D]` tensor, as `[N]`.
pub fn row_norms(tensor: &Tensor) -> candle_core::Result<Tensor> {
    tensor.sqr()?.sum(D::Minus1)?.sqrt()
}

/// Extract a scalar f32 from a 0-dim or 1-element tensor.
pub fn tensor_to_f32(t: &Tensor) -> VisionCotResult<f32> {
    t.flatten_all()
        .and_then(|flat| flat.to_dtype(candle_core::DType::F32))
        .and_then(|flat| flat.to_vec1::<f32>())
        .map_err(|e| VisionCotError::TensorError {
            message: format!("Scalar extraction failed: {}", e),
        })?
        .first()
        .copied()
        .ok_or_else(|| VisionCotError::TensorError {
            message: "Scalar extraction from empty tensor".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_l2_normalize() {
        let t = Tensor::from_slice(&[3.0f32, 4.0], (1, 2), &Device::Cpu).unwrap();
        let n: Vec<Vec<f32>> = l2_normalize(&t).unwrap().to_vec2().unwrap();
        assert!((n[0][0] - 0.6).abs() < 1e-6);
        assert!((n[0][1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_row_stays_finite() {
        let t = Tensor::zeros((2, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let n: Vec<Vec<f32>> = l2_normalize(&t).unwrap().to_vec2().unwrap();
        assert!(n.iter().flatten().all(|v| v.is_finite() && *v == 0.0));
    }

    #[test]
    fn test_row_norms_and_scalar() {
        let t = Tensor::from_slice(&[3.0f32, 4.0, 0.0, 2.0], (2, 2), &Device::Cpu).unwrap();
        let norms: Vec<f32> = row_norms(&t).unwrap().to_vec1().unwrap();
        assert_eq!(norms, vec![5.0, 2.0]);
        let mean = row_norms(&t).unwrap().mean_all().unwrap();
        assert!((tensor_to_f32(&mean).unwrap() - 3.5).abs() < 1e-6);
    }
}
