use nalgebra::{DMatrix, DVector, DVectorView, RealField, Scalar};
use num_traits::Float;

use crate::mapping::GlobalParameterMapper;
use crate::model::{errors::ModelError, DecayModel};
use crate::problem::GlobalFitProblem;
use crate::util::Weights;

/// Everything the solver needs from evaluating one transient at a parameter
/// vector: the model curve on the full time range, the residuals over the
/// active window and their weighted chi square.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CurveEval<ScalarType>
where
    ScalarType: Scalar,
{
    /// the model curve over the full time range
    pub(crate) fitted: DVector<ScalarType>,
    /// the unweighted residuals over the active window
    pub(crate) residuals: DVector<ScalarType>,
    /// the weighted chi square over the active window
    pub(crate) chisq: ScalarType,
}

/// Evaluate one transient at the given full parameter vector. The model is
/// evaluated on the full time range; residuals and chi square only use the
/// active window.
pub(crate) fn evaluate_curve<Model>(
    model: &Model,
    parameters: &DVector<Model::ScalarType>,
    observations: DVectorView<'_, Model::ScalarType>,
    window: (usize, usize),
    weights: &Weights<Model::ScalarType>,
) -> Result<CurveEval<Model::ScalarType>, ModelError>
where
    Model: DecayModel,
    Model::ScalarType: Scalar + RealField + Float,
{
    let fitted = model.eval(parameters)?;
    let (fit_start, fit_end) = window;
    let residuals = DVector::from_fn(fit_end - fit_start, |k, _| {
        observations[fit_start + k] - fitted[fit_start + k]
    });
    debug_assert!(
        weights.is_size_correct_for_data_length(residuals.len()),
        "weights must be precomputed for the active window"
    );
    let chisq = weights.chisq(&residuals);
    Ok(CurveEval {
        fitted,
        residuals,
        chisq,
    })
}

/// Assemble the jacobian block of one transient over the active window. The
/// columns are the partial derivatives with respect to the transient's free
/// parameters, in the order given by
/// [`GlobalParameterMapper::free_positions`].
pub(crate) fn jacobian_block<Model>(
    model: &Model,
    parameters: &DVector<Model::ScalarType>,
    window: (usize, usize),
    mapper: &GlobalParameterMapper,
) -> Result<DMatrix<Model::ScalarType>, ModelError>
where
    Model: DecayModel,
    Model::ScalarType: Scalar + RealField + Float,
{
    let (fit_start, fit_end) = window;
    let nrows = fit_end - fit_start;
    let mut jacobian = DMatrix::zeros(nrows, mapper.curve_free_count());
    for (col, position) in mapper.free_positions().enumerate() {
        let deriv = model.eval_partial_deriv(parameters, position)?;
        for row in 0..nrows {
            jacobian[(row, col)] = deriv[fit_start + row];
        }
    }
    Ok(jacobian)
}

/// The weighted normal equations of the batch, accumulated in the reduced
/// parameter space:
///
/// ```math
/// \left(J^T W J\right) \, \Delta\vec{q} = J^T W \vec{r},
/// ```
///
/// where the full jacobian `$J$` is never materialized. Instead each
/// transient's jacobian block is scattered into the shared system through
/// the index tables of the [`GlobalParameterMapper`].
#[allow(non_snake_case)]
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NormalEquations<ScalarType>
where
    ScalarType: Scalar + RealField,
{
    pub(crate) JTWJ: DMatrix<ScalarType>,
    pub(crate) JTWr: DVector<ScalarType>,
}

impl<ScalarType> NormalEquations<ScalarType>
where
    ScalarType: Scalar + RealField + Float,
{
    /// an empty system of the given reduced dimension
    pub(crate) fn zeros(reduced_len: usize) -> Self {
        Self {
            JTWJ: DMatrix::zeros(reduced_len, reduced_len),
            JTWr: DVector::zeros(reduced_len),
        }
    }

    /// Scatter one transient's weighted block into the shared system.
    /// `columns` maps each block column onto its reduced vector index.
    pub(crate) fn accumulate(
        &mut self,
        jtj_block: &DMatrix<ScalarType>,
        jtwr_block: &DVector<ScalarType>,
        columns: &[usize],
    ) {
        debug_assert_eq!(jtj_block.nrows(), columns.len());
        debug_assert_eq!(jtwr_block.len(), columns.len());
        for (a, &row) in columns.iter().enumerate() {
            self.JTWr[row] += jtwr_block[a];
            for (b, &col) in columns.iter().enumerate() {
                self.JTWJ[(row, col)] += jtj_block[(a, b)];
            }
        }
    }

    /// Solve the system with classic Marquardt damping, which scales the
    /// diagonal by `$1 + \lambda$`. Returns `None` if the damped matrix is
    /// not positive definite, which the caller treats as a singular system.
    pub(crate) fn solve_damped(&self, lambda: ScalarType) -> Option<DVector<ScalarType>> {
        let mut damped = self.JTWJ.clone();
        for i in 0..damped.nrows() {
            damped[(i, i)] += lambda * self.JTWJ[(i, i)];
        }
        damped.cholesky().map(|decomp| decomp.solve(&self.JTWr))
    }
}

/// Assemble the reduced normal equations of the batch at the given
/// parameters. `slots` lists the data column of each batch slot and
/// `params` and `evals` hold the full parameter vector and current
/// evaluation per slot.
pub(crate) fn assemble_normal_equations<Model>(
    problem: &GlobalFitProblem<Model>,
    mapper: &GlobalParameterMapper,
    slots: &[usize],
    params: &[DVector<Model::ScalarType>],
    evals: &[CurveEval<Model::ScalarType>],
) -> Result<NormalEquations<Model::ScalarType>, ModelError>
where
    Model: DecayModel,
    Model::ScalarType: Scalar + RealField + Float,
{
    let mut normal = NormalEquations::zeros(mapper.reduced_len());
    for (slot, &column) in slots.iter().enumerate() {
        let jacobian = jacobian_block(problem.model(), &params[slot], problem.fit_window(), mapper)?;
        let weighted_jacobian = problem.weights_of(column) * jacobian.clone();
        let jtj_block = jacobian.tr_mul(&weighted_jacobian);
        let jtwr_block = weighted_jacobian.tr_mul(&evals[slot].residuals);
        normal.accumulate(&jtj_block, &jtwr_block, &mapper.reduced_columns(slot));
    }
    Ok(normal)
}
