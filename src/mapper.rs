//! Applying [`MappingFactors`] to one source field.
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use num_traits::Float;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::factors::{MappingError, MappingFactors};

/// How the source values inside a target's radius are combined.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReductionOp {
    #[default]
    Mean,
    Median,
    Min,
    Max,
    /// The closest value within the radius
    Nearest,
}

impl ReductionOp {
    /// Reduce the finite values in `values`, which are ordered nearest first.
    /// Returns NaN if there are none.
    pub fn reduce<F: Float>(&self, values: &[F]) -> F {
        let mut finite = values.iter().copied().filter(|v| v.is_finite());
        match self {
            Self::Nearest => finite.next().unwrap_or_else(F::nan),
            Self::Min => finite.reduce(F::min).unwrap_or_else(F::nan),
            Self::Max => finite.reduce(F::max).unwrap_or_else(F::nan),
            Self::Mean => {
                let (sum, n) = finite.fold((F::zero(), 0usize), |(s, n), v| (s + v, n + 1));
                match F::from(n) {
                    Some(count) if n > 0 => sum / count,
                    _ => F::nan(),
                }
            }
            Self::Median => {
                let mut sorted: Vec<F> = finite.collect();
                if sorted.is_empty() {
                    return F::nan();
                }
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 1 {
                    sorted[mid]
                } else {
                    let two = F::one() + F::one();
                    (sorted[mid - 1] + sorted[mid]) / two
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MappingOutcome {
    Mapped(ArrayD<f64>),
    /// The source field had no finite values at all
    AllMissing,
}

/// Map one source field onto the target grid.
///
/// `source` must have as many elements as the factors' source grid; its layout
/// is flattened in row-major order. The result has `target_shape`. A target with
/// no source points in range takes the value of its nearest source point, and
/// a target whose contributing points are all non-finite is NaN.
pub fn map_field(
    factors: &MappingFactors,
    source: ArrayViewD<f64>,
    target_shape: &[usize],
    op: ReductionOp,
) -> Result<MappingOutcome, MappingError> {
    if source.len() != factors.n_source {
        return Err(MappingError::SourceSizeMismatch {
            expected: factors.n_source,
            actual: source.len(),
        });
    }

    let target_size: usize = target_shape.iter().product();
    if target_size != factors.n_target() {
        return Err(MappingError::TargetSizeMismatch {
            shape: target_shape.to_vec(),
            size: target_size,
            expected: factors.n_target(),
        });
    }

    let flat: Vec<f64> = source.iter().copied().collect();
    if !flat.iter().any(|v| v.is_finite()) {
        return Ok(MappingOutcome::AllMissing);
    }

    let values: Vec<f64> = (0..factors.n_target())
        .into_par_iter()
        .map(|i| {
            if factors.counts[i] == 0 {
                let v = flat[factors.nearest[i]];
                if v.is_finite() {
                    v
                } else {
                    f64::NAN
                }
            } else {
                let contributing: Vec<f64> = factors.source_indices[i].iter().map(|&j| flat[j]).collect();
                op.reduce(&contributing)
            }
        })
        .collect();

    let mapped = ArrayD::from_shape_vec(IxDyn(target_shape), values)
        .map_err(|e| MappingError::Inconsistent(e.to_string()))?;
    Ok(MappingOutcome::Mapped(mapped))
}
