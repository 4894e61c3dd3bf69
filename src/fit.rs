use nalgebra::{DVector, DVectorView, RealField, Scalar};
use num_traits::{Float, FromPrimitive};

/// The reason a fit (or one transient of a batch) ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// the damped normal equations remained unsolvable within the retry
    /// budget, typically because a parameter has no influence on the model
    /// or two parameters are perfectly redundant
    SingularSystem,
    /// no sufficiently improving step was found, either because the retry
    /// budget or the iteration cap was exhausted
    NonConvergence,
}

/// The terminal status of a fit. A failed fit is still reported with its
/// best parameters so far; the status tells how much to trust them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStatus {
    /// the chi square improvement fell below the convergence threshold
    Converged,
    /// the fit ended without converging for the given reason
    Failed(FailureReason),
}

impl FitStatus {
    /// whether this status indicates a converged fit
    pub fn converged(&self) -> bool {
        matches!(self, FitStatus::Converged)
    }
}

/// The per-transient outcome of a batch fit.
///
/// Which of the optional output vectors are populated is controlled on the
/// solver with
/// [`with_parameter_output`](crate::solvers::marquardt::MarquardtSolver::with_parameter_output),
/// [`with_fitted_output`](crate::solvers::marquardt::MarquardtSolver::with_fitted_output) and
/// [`with_residual_output`](crate::solvers::marquardt::MarquardtSolver::with_residual_output).
/// By default only the parameters are populated, which keeps the memory
/// footprint of large batches small.
#[derive(Debug, Clone, PartialEq)]
pub struct TransientFit<ScalarType>
where
    ScalarType: Scalar,
{
    /// the final full parameter vector, if parameter output is enabled
    pub(crate) parameters: Option<DVector<ScalarType>>,
    /// the fitted model curve over the full time range, if enabled
    pub(crate) fitted: Option<DVector<ScalarType>>,
    /// the unweighted residuals over the full time range, if enabled
    pub(crate) residuals: Option<DVector<ScalarType>>,
    /// the weighted chi square over the active fit window
    pub(crate) chisq: ScalarType,
    /// the terminal status of this transient
    pub(crate) status: FitStatus,
}

impl<ScalarType> TransientFit<ScalarType>
where
    ScalarType: Scalar,
{
    /// the final full parameter vector, including the values of fixed
    /// positions. `None` if parameter output is disabled on the solver.
    pub fn parameters(&self) -> Option<DVectorView<'_, ScalarType>> {
        self.parameters.as_ref().map(|p| p.as_view())
    }

    /// the fitted model curve over the full time range. `None` unless
    /// fitted output is enabled on the solver.
    pub fn fitted(&self) -> Option<DVectorView<'_, ScalarType>> {
        self.fitted.as_ref().map(|f| f.as_view())
    }

    /// the unweighted residuals $\vec{y} - \vec{f}(\vec{p})$ over the full
    /// time range. `None` unless residual output is enabled on the solver.
    pub fn residuals(&self) -> Option<DVectorView<'_, ScalarType>> {
        self.residuals.as_ref().map(|r| r.as_view())
    }

    /// the weighted chi square of this transient over the active fit window
    pub fn chisq(&self) -> ScalarType
    where
        ScalarType: Copy,
    {
        self.chisq
    }

    /// the terminal status of this transient
    pub fn status(&self) -> FitStatus {
        self.status
    }
}

/// The result of fitting a batch of transients.
///
/// This structure is returned by the
/// [`MarquardtSolver::fit`](crate::solvers::marquardt::MarquardtSolver::fit) and
/// [`MarquardtSolver::fit_with_statistics`](crate::solvers::marquardt::MarquardtSolver::fit_with_statistics)
/// methods. It is produced for failed fits as well, with the per-transient
/// statuses recording what went wrong; only structural errors abort a fit
/// without a result.
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult<ScalarType>
where
    ScalarType: Scalar,
{
    /// the per-transient outcomes, in the column order of the data
    pub(crate) transients: Vec<TransientFit<ScalarType>>,
    /// the summed chi square over the batch
    pub(crate) chisq_global: ScalarType,
    /// the degrees of freedom of the batch
    pub(crate) degrees_of_freedom: usize,
    /// the number of outer iterations the solver performed
    pub(crate) iterations: usize,
}

impl<ScalarType> FitResult<ScalarType>
where
    ScalarType: Scalar,
{
    /// the per-transient outcomes, in the column order of the data
    pub fn transients(&self) -> &[TransientFit<ScalarType>] {
        &self.transients
    }

    /// the outcome for the transient at the given column index
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds for the batch.
    pub fn transient(&self, index: usize) -> &TransientFit<ScalarType> {
        &self.transients[index]
    }

    /// the number of transients in the batch
    pub fn len(&self) -> usize {
        self.transients.len()
    }

    /// whether the batch is empty, which a successfully built problem
    /// never produces
    pub fn is_empty(&self) -> bool {
        self.transients.is_empty()
    }

    /// whether every transient of the batch converged
    pub fn all_converged(&self) -> bool {
        self.transients.iter().all(|t| t.status.converged())
    }

    /// the summed chi square over all transients of the batch
    pub fn chisq_global(&self) -> ScalarType
    where
        ScalarType: Copy,
    {
        self.chisq_global
    }

    /// The degrees of freedom of the batch: the total number of active
    /// samples minus the number of free parameters in the reduced space,
    /// floored at one.
    ///
    /// With $T$ transients of $K_a$ active samples each, $n_g$ free global
    /// and $n_l$ free local positions this is
    ///
    /// ```math
    /// \nu = \max\!\left(1,\; T K_a - n_g - T\, n_l\right).
    /// ```
    pub fn degrees_of_freedom(&self) -> usize {
        self.degrees_of_freedom
    }

    /// the number of outer iterations the solver performed; for independent
    /// per-transient fits this is the largest iteration count of any
    /// transient
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// the summed chi square divided by the degrees of freedom
    pub fn reduced_chisq_global(&self) -> ScalarType
    where
        ScalarType: RealField + Float + FromPrimitive,
    {
        self.chisq_global
            / ScalarType::from_usize(self.degrees_of_freedom)
                .expect("degrees of freedom must convert to scalar")
    }
}
