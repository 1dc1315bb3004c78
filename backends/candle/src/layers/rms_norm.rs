use candle::{DType, Result, Tensor, D};
use candle_nn::VarBuilder;

#[derive(Debug)]
pub struct RMSNorm {
    weight: Tensor,
    epsilon: f32,
    span: tracing::Span,
}

impl RMSNorm {
    pub fn load(vb: VarBuilder, hidden_size: usize, epsilon: f32) -> Result<Self> {
        Ok(Self {
            weight: vb.get(hidden_size, "weight")?,
            epsilon,
            span: tracing::span!(tracing::Level::TRACE, "rms-norm"),
        })
    }

    /// Returns `(normed, residual)` where `residual` is `hidden_states (+ residual)`, the value
    /// the next residual connection has to be added to.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        residual: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();

        let hidden_states = match residual {
            Some(residual) => hidden_states.add(residual)?,
            None => hidden_states.clone(),
        };

        // Accumulate in f32 to keep f16 models stable
        let dtype = hidden_states.dtype();
        let x = hidden_states.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&(variance + self.epsilon as f64)?.sqrt()?)?;
        let normed = x.to_dtype(dtype)?.broadcast_mul(&self.weight)?;

        Ok((normed, hidden_states))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    #[test]
    fn test_rms_norm() -> Result<()> {
        let device = Device::Cpu;
        let norm = RMSNorm {
            weight: Tensor::new(&[1f32, 1., 1., 1.], &device)?,
            epsilon: 0.0,
            span: tracing::Span::none(),
        };

        let x = Tensor::new(&[[2f32, 2., 2., 2.]], &device)?;
        let (normed, residual) = norm.forward(&x, None)?;
        assert_eq!(normed.to_vec2::<f32>()?, vec![vec![1.0, 1.0, 1.0, 1.0]]);
        assert_eq!(residual.to_vec2::<f32>()?, vec![vec![2.0, 2.0, 2.0, 2.0]]);

        let (_, residual) = norm.forward(&x, Some(&x))?;
        assert_eq!(residual.to_vec2::<f32>()?, vec![vec![4.0, 4.0, 4.0, 4.0]]);
        Ok(())
    }
}
