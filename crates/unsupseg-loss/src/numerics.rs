use burn::{prelude::*, tensor::cast::ToElement};

use crate::error::{UnsupervisedLossError, UnsupervisedLossResult};

/// Fail with [`UnsupervisedLossError::NonFinite`] if `tensor` holds a NaN.
///
/// Only active in debug builds with `enabled` set; reading the flag back from the
/// device synchronizes the backend.
pub(crate) fn ensure_no_nan<B: Backend, const D: usize>(
    enabled: bool,
    stage: &'static str,
    tensor: &Tensor<B, D>,
) -> UnsupervisedLossResult<()> {
    if !(enabled && cfg!(debug_assertions)) {
        return Ok(());
    }

    let has_nan = tensor.clone().is_nan().any().int().into_scalar().to_i64() != 0;
    if has_nan {
        tracing::error!(stage, "NaN detected in unsupervised loss");
        return Err(UnsupervisedLossError::NonFinite { stage });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Tensor, TensorData};

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn ensure_no_nan_accepts_finite_tensor() {
        let tensor = Tensor::<TestBackend, 2>::ones([2, 2], &Default::default());
        assert!(ensure_no_nan(true, "test", &tensor).is_ok());
    }

    #[test]
    fn ensure_no_nan_reports_stage() {
        let tensor = Tensor::<TestBackend, 1>::from_data(
            TensorData::from([1.0, f32::NAN]),
            &Default::default(),
        );

        let result = ensure_no_nan(true, "variance", &tensor);

        if cfg!(debug_assertions) {
            match result {
                Err(UnsupervisedLossError::NonFinite { stage }) => assert_eq!(stage, "variance"),
                other => panic!("Expected NonFinite, got {other:?}"),
            }
        } else {
            assert!(result.is_ok());
        }
    }

    #[test]
    fn ensure_no_nan_is_skipped_when_disabled() {
        let tensor = Tensor::<TestBackend, 1>::from_data(
            TensorData::from([f32::NAN]),
            &Default::default(),
        );
        assert!(ensure_no_nan(false, "variance", &tensor).is_ok());
    }
}
