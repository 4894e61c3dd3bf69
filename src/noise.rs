use nalgebra::{DVector, DVectorView, RealField, Scalar};
use num_traits::Float;

use crate::util::Weights;

/// The statistical noise model of the measured transients, which determines
/// the per-sample weights entering the fit.
///
/// The weight of a sample is the reciprocal of its assumed variance,
/// $w_k = 1/\sigma_k^2$, so that the minimized quantity is the $\chi^2$
/// statistic
///
/// ```math
/// \chi^2 = \sum_k w_k \left(y_k - f_k(\vec{p})\right)^2.
/// ```
///
/// Time-correlated photon counting data obeys Poisson statistics, for which
/// the variance of a bin equals its expected count. [`NoiseModel::Poisson`]
/// estimates that variance from the observed counts, with empty bins clamped
/// to a variance of one so their weight stays finite.
#[derive(Debug, Clone, PartialEq)]
pub enum NoiseModel<ScalarType>
where
    ScalarType: Scalar,
{
    /// every sample enters the fit with unit weight
    Unweighted,
    /// gaussian noise with the same standard deviation for every sample
    Const(ScalarType),
    /// gaussian noise with an individual standard deviation per time bin,
    /// given on the full time range of the transients
    Given(DVector<ScalarType>),
    /// poisson photon counting statistics with the variance of each bin
    /// estimated by its observed count
    Poisson,
}

impl<ScalarType> NoiseModel<ScalarType>
where
    ScalarType: Scalar + RealField + Float,
{
    /// Build the weights for one transient over the active fit window
    /// `[fit_start, fit_end)`.
    ///
    /// The observation vector covers the full time range; only the active
    /// rows contribute weights. The caller guarantees that sigma values are
    /// positive and sized to the full time range, which the problem builder
    /// validates.
    pub(crate) fn weights_for(
        &self,
        observations: DVectorView<'_, ScalarType>,
        fit_start: usize,
        fit_end: usize,
    ) -> Weights<ScalarType> {
        let active_len = fit_end - fit_start;
        match self {
            NoiseModel::Unweighted => Weights::Unit,
            NoiseModel::Const(sigma) => {
                let weight = ScalarType::one() / (*sigma * *sigma);
                Weights::diagonal(DVector::from_element(active_len, weight))
            }
            NoiseModel::Given(sigma) => Weights::diagonal(DVector::from_fn(active_len, |k, _| {
                let sig = sigma[fit_start + k];
                ScalarType::one() / (sig * sig)
            })),
            NoiseModel::Poisson => Weights::diagonal(DVector::from_fn(active_len, |k, _| {
                // variance of an empty (or underflowing) bin is clamped to one
                let variance = Float::max(observations[fit_start + k], ScalarType::one());
                ScalarType::one() / variance
            })),
        }
    }
}
