use nalgebra::{DMatrix, DVector, RealField, Scalar};
use num_traits::Float;
use thiserror::Error as ThisError;

use crate::mapping::GlobalParameterMapper;
use crate::model::{errors::ModelError, DecayModel};
use crate::problem::GlobalFitProblem;

pub mod numeric_traits;
#[cfg(test)]
mod test;

pub use numeric_traits::CastF64;

/// Information about an error that occurred during calculation
/// of the fit statistics.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum StatisticsError {
    /// Every parameter of the problem is fixed, so there is no parameter
    /// estimate to calculate statistics for.
    #[error("Cannot calculate statistics for a problem without free parameters.")]
    NoFreeParameters,

    /// The problem does not have more observations than free parameters.
    #[error(
        "Fit is underdetermined: {} observations for {} free parameters.",
        observations,
        fitted_parameters
    )]
    Underdetermined {
        /// the number of data points inside the fit window, over all transients
        observations: usize,
        /// the number of free parameters, counting local ones once per transient
        fitted_parameters: usize,
    },

    /// The normal matrix of the fit could not be inverted, e.g. because a
    /// free parameter has no influence on the model curve.
    #[error("The normal matrix of the fit is singular and provides no covariance.")]
    SingularNormalMatrix,

    /// The model could not be evaluated at the final parameters.
    #[error("Model evaluation failed during statistics calculation: {}", source)]
    ModelEvaluation {
        /// the underlying model error
        #[from]
        source: ModelError,
    },
}

/// This structure contains additional statistical information about a
/// completed fit, such as errors on the parameters and other useful
/// information to assess the quality of the parameter estimates.
///
/// # Parameter Ordering
///
/// All matrices and vectors here are indexed by the *reduced* parameter
/// vector of the fit: the free globally shared parameters come first,
/// followed by the free local parameters of each transient in turn. Fixed
/// parameters carry no uncertainty and do not appear.
///
/// # Caveat
///
/// The covariance is the standard linearization about the minimum,
///
/// ```math
/// \mathrm{Cov}(\vec{q}) = \chi^2_\nu \, \left(J^T W J\right)^{-1},
/// ```
///
/// with the reduced chi square `$\chi^2_\nu$` and the undamped normal
/// matrix at the final parameters. As always with nonlinear fits it is an
/// approximation that degrades when the model is strongly nonlinear within
/// one standard error.
#[derive(Debug, Clone)]
pub struct FitStatistics<ScalarType>
where
    ScalarType: Scalar,
{
    /// the covariance matrix of the reduced parameter estimates
    covariance_matrix: DMatrix<ScalarType>,
    /// the regression standard error
    sigma: ScalarType,
    /// the chi square per degree of freedom
    reduced_chisq: ScalarType,
    /// the degrees of freedom of the fit
    degrees_of_freedom: usize,
}

impl<ScalarType> FitStatistics<ScalarType>
where
    ScalarType: Scalar + RealField + Float + CastF64,
{
    /// Calculate the fit statistics from the problem and the final
    /// parameters of every transient. The given parameters must be the ones
    /// after the fit has completed.
    pub(crate) fn try_calculate<Model>(
        problem: &GlobalFitProblem<Model>,
        mapper: &GlobalParameterMapper,
        final_parameters: &[DVector<ScalarType>],
        chisq_global: ScalarType,
        degrees_of_freedom: usize,
    ) -> Result<Self, StatisticsError>
    where
        Model: DecayModel<ScalarType = ScalarType>,
    {
        assert_eq!(
            final_parameters.len(),
            mapper.n_trans(),
            "Statistics need the final parameters of every transient."
        );
        if mapper.reduced_len() == 0 {
            return Err(StatisticsError::NoFreeParameters);
        }
        let observations = problem.active_len() * problem.n_trans();
        let fitted_parameters =
            mapper.free_global_count() + mapper.free_local_count() * mapper.n_trans();
        if observations <= fitted_parameters {
            return Err(StatisticsError::Underdetermined {
                observations,
                fitted_parameters,
            });
        }

        let normal = weighted_normal_matrix(problem, mapper, final_parameters)?;
        let Some(inverse) = normal.try_inverse() else {
            log::warn!("normal matrix of the fit is singular, no covariance available");
            return Err(StatisticsError::SingularNormalMatrix);
        };
        let reduced_chisq =
            chisq_global / <ScalarType as CastF64>::from_f64(degrees_of_freedom as f64);
        let covariance_matrix = inverse * reduced_chisq;
        let sigma = Float::sqrt(reduced_chisq);

        Ok(Self {
            covariance_matrix,
            sigma,
            reduced_chisq,
            degrees_of_freedom,
        })
    }

    /// The covariance matrix of the reduced parameter estimates. The
    /// diagonal contains the parameter variances.
    pub fn covariance_matrix(&self) -> &DMatrix<ScalarType> {
        &self.covariance_matrix
    }

    /// Calculate the estimated correlation matrix from the covariance
    /// matrix by dividing each element `$c_{ij}$` by
    /// `$\sqrt{c_{ii} c_{jj}}$`.
    pub fn calculate_correlation_matrix(&self) -> DMatrix<ScalarType> {
        calc_correlation_matrix(&self.covariance_matrix)
    }

    /// The _regression standard error_ `$\sigma$`, i.e. the square root of
    /// the reduced chi square. For a good fit with correct weights this is
    /// close to one.
    pub fn regression_standard_error(&self) -> ScalarType {
        self.sigma
    }

    /// the chi square of the fit divided by its degrees of freedom
    pub fn reduced_chisq(&self) -> ScalarType {
        self.reduced_chisq
    }

    /// the degrees of freedom the reduced chi square was calculated with
    pub fn degrees_of_freedom(&self) -> usize {
        self.degrees_of_freedom
    }

    /// the variances of the reduced parameter estimates, which is the
    /// diagonal of the covariance matrix
    pub fn parameter_variances(&self) -> DVector<ScalarType> {
        DVector::from_fn(self.covariance_matrix.nrows(), |index, _| {
            self.covariance_matrix[(index, index)]
        })
    }

    /// The half width of the confidence interval of every reduced parameter
    /// at the given probability level, using the quantiles of a Student's t
    /// distribution with the degrees of freedom of the fit. A parameter
    /// estimate `$q_i$` lies within `$q_i \pm r_i$` at e.g. 95% confidence
    /// for `probability = 0.95`.
    ///
    /// # Panics
    ///
    /// Panics if the probability is outside the open interval `$(0, 1)$`.
    pub fn confidence_radius(&self, probability: ScalarType) -> DVector<ScalarType> {
        assert!(
            probability > ScalarType::zero() && probability < ScalarType::one(),
            "Confidence probability must lie strictly between 0 and 1."
        );
        let quantile = distrs::StudentsT::ppf(
            (1. + probability.into_f64()) / 2.,
            self.degrees_of_freedom as f64,
        );
        DVector::from_fn(self.covariance_matrix.nrows(), |index, _| {
            <ScalarType as CastF64>::from_f64(quantile)
                * Float::sqrt(self.covariance_matrix[(index, index)])
        })
    }
}

/// The undamped normal matrix `$J^T W J$` of the batch at the final
/// parameters, assembled in the reduced parameter space exactly like during
/// the fit iterations.
fn weighted_normal_matrix<Model, ScalarType>(
    problem: &GlobalFitProblem<Model>,
    mapper: &GlobalParameterMapper,
    final_parameters: &[DVector<ScalarType>],
) -> Result<DMatrix<ScalarType>, ModelError>
where
    Model: DecayModel<ScalarType = ScalarType>,
    ScalarType: Scalar + RealField + Float,
{
    let (fit_start, fit_end) = problem.fit_window();
    let mut normal = DMatrix::zeros(mapper.reduced_len(), mapper.reduced_len());
    for slot in 0..mapper.n_trans() {
        let mut jacobian = DMatrix::zeros(fit_end - fit_start, mapper.curve_free_count());
        for (col, position) in mapper.free_positions().enumerate() {
            let deriv = problem
                .model()
                .eval_partial_deriv(&final_parameters[slot], position)?;
            for row in 0..jacobian.nrows() {
                jacobian[(row, col)] = deriv[fit_start + row];
            }
        }
        let weighted_jacobian = problem.weights_of(slot) * jacobian.clone();
        let block = jacobian.tr_mul(&weighted_jacobian);
        let columns = mapper.reduced_columns(slot);
        for (a, &row) in columns.iter().enumerate() {
            for (b, &col) in columns.iter().enumerate() {
                normal[(row, col)] += block[(a, b)];
            }
        }
    }
    Ok(normal)
}

/// calculates the estimated correlation matrix from the given
/// covariance matrix
fn calc_correlation_matrix<ScalarType>(covariance: &DMatrix<ScalarType>) -> DMatrix<ScalarType>
where
    ScalarType: Scalar + Float,
{
    assert_eq!(
        covariance.nrows(),
        covariance.ncols(),
        "covariance matrix must be square"
    );
    let mut correlation = covariance.clone();
    for row in 0..correlation.nrows() {
        for col in 0..correlation.ncols() {
            let denominator = Float::sqrt(covariance[(row, row)] * covariance[(col, col)]);
            correlation[(row, col)] = covariance[(row, col)] / denominator;
        }
    }
    correlation
}
