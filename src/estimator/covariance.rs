//! Block composition of the random-effects covariance matrix for IOV models.

use nalgebra::DMatrix;

use crate::error::EstimationError;

/// Merge the reduced IIV covariance with per-occasion copies of the reduced
/// IOV covariance
///
/// The result is block-diagonal: the leading block is the IIV covariance and
/// one copy of the IOV covariance follows for every occasion beyond the
/// first (the first occasion's inter-occasion deviation is absorbed into
/// IIV). For `d1 × d1` IIV, `d2 × d2` IOV and `k` occasions the result is
/// `(d1 + (k−1)·d2)` square.
///
/// # Errors
///
/// Returns [`EstimationError::Dimension`] when either input is not square or
/// the occasion count is zero.
pub fn merge_iov(
    iiv: &DMatrix<f64>,
    iov: &DMatrix<f64>,
    n_occasions: usize,
) -> Result<DMatrix<f64>, EstimationError> {
    if n_occasions == 0 {
        return Err(EstimationError::Dimension {
            context: "occasion count could not be determined (no occasions in dataset)"
                .to_string(),
        });
    }
    if iiv.nrows() != iiv.ncols() {
        return Err(EstimationError::Dimension {
            context: format!("IIV covariance is {}x{}, not square", iiv.nrows(), iiv.ncols()),
        });
    }
    if iov.nrows() != iov.ncols() {
        return Err(EstimationError::Dimension {
            context: format!("IOV covariance is {}x{}, not square", iov.nrows(), iov.ncols()),
        });
    }

    let d1 = iiv.nrows();
    let d2 = iov.nrows();
    let replicates = n_occasions - 1;
    let dim = d1 + replicates * d2;

    let mut merged = DMatrix::zeros(dim, dim);
    merged.view_mut((0, 0), (d1, d1)).copy_from(iiv);
    for block in 0..replicates {
        let offset = d1 + block * d2;
        merged.view_mut((offset, offset), (d2, d2)).copy_from(iov);
    }

    Ok(merged)
}
