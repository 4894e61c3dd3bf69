//! Levenberg-Marquardt solver for batches of decay transients with shared
//! parameters.
//!
//! The solver minimizes the total weighted sum of squared residuals of the
//! batch by iterating damped Gauss-Newton steps on the reduced parameter
//! vector. Each outer iteration assembles the normal equations
//!
//! ```math
//! \left(J^T W J + \lambda \, \mathrm{diag}\,(J^T W J)\right) \Delta \vec{q}
//!   = J^T W \vec{r}
//! ```
//!
//! once and then retries the damped solve with growing `$\lambda$` until a
//! trial step lowers the total chi square or the retry budget runs out. This
//! is the classic damping strategy of (Marquardt 1963), with the diagonal
//! scaling making the damping invariant under rescaling of the parameters.

use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::{DVector, RealField, Scalar};
use num_traits::{Float, FromPrimitive};
use rayon::prelude::*;
use thiserror::Error as ThisError;

use crate::fit::{FailureReason, FitResult, FitStatus, TransientFit};
use crate::mapping::GlobalParameterMapper;
use crate::model::{errors::ModelError, DecayModel};
use crate::problem::{GlobalFitProblem, RestrainPolicy, Restraints};
use crate::statistics::{CastF64, FitStatistics, StatisticsError};

use self::state::{advance, FitPhase, StepOutcome};
use self::step::{assemble_normal_equations, evaluate_curve, CurveEval, NormalEquations};

mod state;
mod step;

/// Errors that abort a fit outright. Note that a fit that merely fails to
/// converge is *not* an error: it produces a [`FitResult`] whose transients
/// carry a failed [`FitStatus`].
#[derive(Debug, ThisError)]
pub enum FitError {
    /// The model could not be evaluated at an accepted parameter vector.
    /// Trial steps the model rejects are retried with increased damping
    /// instead, so this indicates a model that cannot even evaluate its
    /// starting point or its derivatives.
    #[error("Model evaluation failed: {}", source)]
    InvalidParameter {
        /// the underlying model error
        #[from]
        source: ModelError,
    },

    /// The damped normal equations could not be solved and the solver was
    /// configured to abort on singular systems.
    #[error("Damped normal equations not solvable at iteration {}.", iteration)]
    SingularSystem {
        /// the outer iteration at which the solve failed
        iteration: usize,
    },

    /// The fit was cancelled through its cancellation token.
    #[error("Fit was cancelled before completion.")]
    Cancelled,

    /// Calculating the requested fit statistics failed.
    #[error("Statistics calculation failed: {}", source)]
    Statistics {
        /// the underlying statistics error
        #[from]
        source: StatisticsError,
    },
}

/// A Levenberg-Marquardt solver for [`GlobalFitProblem`]s, configured with
/// sensible defaults for photon count transients.
///
/// # Usage
///
/// The solver is cheap to create and stateless across fits, so one instance
/// can fit any number of problems. Configuration uses chained setters:
///
/// ```no_run
/// # use flimfit::solvers::marquardt::MarquardtSolver;
/// let solver = MarquardtSolver::new()
///     .with_chisq_delta(1e-6)
///     .with_max_iterations(200)
///     .with_fitted_output(true);
/// # let _: MarquardtSolver<f64> = solver;
/// ```
///
/// # Dispatch
///
/// The solver picks its strategy from the problem's parameter layout. When
/// no parameter is shared (or free), the batch decouples and every transient
/// is fitted independently, so a diverging transient cannot drag the others
/// down with it. When free shared parameters exist, the whole batch is
/// fitted jointly: trial steps are accepted on the *summed* chi square of
/// all transients and every transient reports the same terminal status.
#[derive(Debug, Clone, PartialEq)]
pub struct MarquardtSolver<ScalarType>
where
    ScalarType: Scalar,
{
    chisq_delta: ScalarType,
    max_iterations: usize,
    max_step_retries: usize,
    initial_lambda: ScalarType,
    lambda_scale_up: ScalarType,
    lambda_scale_down: ScalarType,
    lambda_floor: ScalarType,
    lambda_ceiling: ScalarType,
    abort_on_singular: bool,
    output_parameters: bool,
    output_fitted: bool,
    output_residuals: bool,
}

/// The default configuration: convergence at a relative chi square
/// improvement below `1e-4`, at most `100` outer iterations with `16` trial
/// steps each, initial damping `1e-3`, no abort on singular systems, and
/// only the parameter output enabled.
impl<ScalarType> Default for MarquardtSolver<ScalarType>
where
    ScalarType: Scalar + Float + FromPrimitive,
{
    fn default() -> Self {
        let constant =
            |value: f64| ScalarType::from_f64(value).expect("converting constants must not fail");
        Self {
            chisq_delta: constant(1e-4),
            max_iterations: 100,
            max_step_retries: 16,
            initial_lambda: constant(1e-3),
            lambda_scale_up: constant(10.),
            lambda_scale_down: constant(0.1),
            lambda_floor: constant(1e-7),
            lambda_ceiling: constant(1e7),
            abort_on_singular: false,
            output_parameters: true,
            output_fitted: false,
            output_residuals: false,
        }
    }
}

impl<ScalarType> MarquardtSolver<ScalarType>
where
    ScalarType: Scalar + RealField + Float + FromPrimitive,
{
    /// a solver with the default configuration
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the convergence threshold on the relative chi square improvement
    /// of an accepted step. Negative values are taken by absolute value.
    pub fn with_chisq_delta(self, chisq_delta: ScalarType) -> Self {
        Self {
            chisq_delta: Float::abs(chisq_delta),
            ..self
        }
    }

    /// Set the maximum number of outer iterations before the fit is reported
    /// as non-converged.
    pub fn with_max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    /// Set the maximum number of trial steps per outer iteration. Each
    /// rejected trial raises the damping before the next attempt.
    pub fn with_max_step_retries(self, max_step_retries: usize) -> Self {
        Self {
            max_step_retries,
            ..self
        }
    }

    /// Set the initial damping parameter `$\lambda$`.
    pub fn with_initial_lambda(self, initial_lambda: ScalarType) -> Self {
        Self {
            initial_lambda,
            ..self
        }
    }

    /// Abort the whole fit with [`FitError::SingularSystem`] when the damped
    /// normal equations cannot be solved, instead of reporting the failure
    /// through the fit status.
    pub fn with_abort_on_singular(self, abort_on_singular: bool) -> Self {
        Self {
            abort_on_singular,
            ..self
        }
    }

    /// Enable or disable the fitted parameter vectors in the output.
    pub fn with_parameter_output(self, output_parameters: bool) -> Self {
        Self {
            output_parameters,
            ..self
        }
    }

    /// Enable or disable the fitted model curves in the output.
    pub fn with_fitted_output(self, output_fitted: bool) -> Self {
        Self {
            output_fitted,
            ..self
        }
    }

    /// Enable or disable the full-range residual vectors in the output.
    pub fn with_residual_output(self, output_residuals: bool) -> Self {
        Self {
            output_residuals,
            ..self
        }
    }

    /// Fit the given problem and return the per-transient results.
    ///
    /// # Errors
    ///
    /// Fails if the model cannot be evaluated at an accepted parameter
    /// vector, or on a singular system when
    /// [`with_abort_on_singular`](MarquardtSolver::with_abort_on_singular)
    /// was set. Non-convergence is reported through the [`FitStatus`] of the
    /// result, not as an error.
    pub fn fit<Model>(
        &self,
        problem: &GlobalFitProblem<Model>,
    ) -> Result<FitResult<ScalarType>, FitError>
    where
        Model: DecayModel<ScalarType = ScalarType>,
    {
        self.fit_impl(problem, None).map(|(result, _)| result)
    }

    /// Fit the given problem, checking the cancellation token between outer
    /// iterations. Setting the token to `true` makes the fit return
    /// [`FitError::Cancelled`] at the next check.
    pub fn fit_with_cancellation<Model>(
        &self,
        problem: &GlobalFitProblem<Model>,
        cancel: &AtomicBool,
    ) -> Result<FitResult<ScalarType>, FitError>
    where
        Model: DecayModel<ScalarType = ScalarType>,
    {
        self.fit_impl(problem, Some(cancel)).map(|(result, _)| result)
    }

    /// Fit the given problem and additionally calculate the
    /// [`FitStatistics`] of the solution, such as the covariance matrix and
    /// confidence intervals of the fitted parameters.
    pub fn fit_with_statistics<Model>(
        &self,
        problem: &GlobalFitProblem<Model>,
    ) -> Result<(FitResult<ScalarType>, FitStatistics<ScalarType>), FitError>
    where
        Model: DecayModel<ScalarType = ScalarType>,
        ScalarType: CastF64,
    {
        let (result, finals) = self.fit_impl(problem, None)?;
        let mapper =
            GlobalParameterMapper::new(problem.layout(), problem.free_mask(), problem.n_trans());
        let statistics = FitStatistics::try_calculate(
            problem,
            &mapper,
            &finals,
            result.chisq_global(),
            result.degrees_of_freedom(),
        )?;
        Ok((result, statistics))
    }

    /// Fit several independent problems in parallel on the rayon thread
    /// pool, returning one result per problem in the input order.
    pub fn fit_batches<Model>(
        &self,
        problems: &[GlobalFitProblem<Model>],
    ) -> Vec<Result<FitResult<ScalarType>, FitError>>
    where
        Model: DecayModel<ScalarType = ScalarType> + Sync,
        ScalarType: Send + Sync,
    {
        problems.par_iter().map(|problem| self.fit(problem)).collect()
    }

    /// Dispatch on the reduced layout and run the fit, returning the result
    /// together with the final full parameter vector of every transient.
    fn fit_impl<Model>(
        &self,
        problem: &GlobalFitProblem<Model>,
        cancel: Option<&AtomicBool>,
    ) -> Result<(FitResult<ScalarType>, Vec<DVector<ScalarType>>), FitError>
    where
        Model: DecayModel<ScalarType = ScalarType>,
    {
        let mapper =
            GlobalParameterMapper::new(problem.layout(), problem.free_mask(), problem.n_trans());
        let degrees_of_freedom = degrees_of_freedom(problem, &mapper);
        if mapper.reduced_len() == 0 {
            self.fit_all_fixed(problem, degrees_of_freedom)
        } else if mapper.free_global_count() == 0 {
            self.fit_independent(problem, degrees_of_freedom, cancel)
        } else {
            self.fit_joint(problem, &mapper, degrees_of_freedom, cancel)
        }
    }

    /// Every parameter is fixed, so there is nothing to optimize: evaluate
    /// each transient once at its initial guess and report it as converged
    /// after zero iterations.
    fn fit_all_fixed<Model>(
        &self,
        problem: &GlobalFitProblem<Model>,
        degrees_of_freedom: usize,
    ) -> Result<(FitResult<ScalarType>, Vec<DVector<ScalarType>>), FitError>
    where
        Model: DecayModel<ScalarType = ScalarType>,
    {
        let mut transients = Vec::with_capacity(problem.n_trans());
        let mut finals = Vec::with_capacity(problem.n_trans());
        let mut chisq_global = ScalarType::zero();
        for column in 0..problem.n_trans() {
            let parameters = problem.initial_guesses().column(column).clone_owned();
            let eval = evaluate_curve(
                problem.model(),
                &parameters,
                problem.transient(column),
                problem.fit_window(),
                problem.weights_of(column),
            )?;
            chisq_global += eval.chisq;
            transients.push(self.assemble_transient(
                problem,
                column,
                parameters.clone(),
                eval,
                FitStatus::Converged,
            ));
            finals.push(parameters);
        }
        let result = FitResult {
            transients,
            chisq_global,
            degrees_of_freedom,
            iterations: 0,
        };
        Ok((result, finals))
    }

    /// No free parameter is shared, so the batch decouples into independent
    /// single-transient fits. A transient that fails does not affect the
    /// others; the reported iteration count is the maximum over the batch.
    fn fit_independent<Model>(
        &self,
        problem: &GlobalFitProblem<Model>,
        degrees_of_freedom: usize,
        cancel: Option<&AtomicBool>,
    ) -> Result<(FitResult<ScalarType>, Vec<DVector<ScalarType>>), FitError>
    where
        Model: DecayModel<ScalarType = ScalarType>,
    {
        let single =
            GlobalParameterMapper::new(problem.layout(), problem.free_mask(), 1);
        let mut transients = Vec::with_capacity(problem.n_trans());
        let mut finals = Vec::with_capacity(problem.n_trans());
        let mut chisq_global = ScalarType::zero();
        let mut iterations = 0;
        for column in 0..problem.n_trans() {
            let run = self.run(problem, &single, &[column], cancel)?;
            let RunOutcome {
                status,
                finals: mut run_finals,
                evals: mut run_evals,
                iterations: run_iterations,
            } = run;
            let parameters = run_finals.remove(0);
            let eval = run_evals.remove(0);
            iterations = iterations.max(run_iterations);
            chisq_global += eval.chisq;
            transients.push(self.assemble_transient(
                problem,
                column,
                parameters.clone(),
                eval,
                status,
            ));
            finals.push(parameters);
        }
        let result = FitResult {
            transients,
            chisq_global,
            degrees_of_freedom,
            iterations,
        };
        Ok((result, finals))
    }

    /// At least one free parameter is shared, so all transients are fitted
    /// as one coupled system and share the terminal status.
    fn fit_joint<Model>(
        &self,
        problem: &GlobalFitProblem<Model>,
        mapper: &GlobalParameterMapper,
        degrees_of_freedom: usize,
        cancel: Option<&AtomicBool>,
    ) -> Result<(FitResult<ScalarType>, Vec<DVector<ScalarType>>), FitError>
    where
        Model: DecayModel<ScalarType = ScalarType>,
    {
        let columns: Vec<usize> = (0..problem.n_trans()).collect();
        let RunOutcome {
            status,
            finals,
            evals,
            iterations,
        } = self.run(problem, mapper, &columns, cancel)?;
        let chisq_global = evals
            .iter()
            .fold(ScalarType::zero(), |acc, eval| acc + eval.chisq);
        let transients = finals
            .iter()
            .zip(evals)
            .enumerate()
            .map(|(column, (parameters, eval))| {
                self.assemble_transient(problem, column, parameters.clone(), eval, status)
            })
            .collect();
        let result = FitResult {
            transients,
            chisq_global,
            degrees_of_freedom,
            iterations,
        };
        Ok((result, finals))
    }

    /// The iteration engine. Fits the transients in the given data columns
    /// as one coupled system described by the mapper, where batch slot `s`
    /// corresponds to data column `columns[s]`.
    fn run<Model>(
        &self,
        problem: &GlobalFitProblem<Model>,
        mapper: &GlobalParameterMapper,
        columns: &[usize],
        cancel: Option<&AtomicBool>,
    ) -> Result<RunOutcome<ScalarType>, FitError>
    where
        Model: DecayModel<ScalarType = ScalarType>,
    {
        let mut reduced = mapper.reduce_initial(problem.initial_guesses(), columns);
        let (mut params, mut evals, mut chisq_total) =
            evaluate_batch(problem, mapper, columns, &reduced)?;
        let mut lambda = self.initial_lambda;
        let mut iterations = 0;
        let status = loop {
            if let Some(token) = cancel {
                if token.load(Ordering::Relaxed) {
                    return Err(FitError::Cancelled);
                }
            }
            let normal = assemble_normal_equations(problem, mapper, columns, &params, &evals)?;
            let outcome = self.attempt_step(
                problem,
                mapper,
                columns,
                &normal,
                &mut lambda,
                &mut reduced,
                &mut params,
                &mut evals,
                &mut chisq_total,
            );
            let phase = advance(outcome, iterations, self.max_iterations, self.chisq_delta);
            iterations += 1;
            log::debug!(
                "iteration {}: total chi square {:?}, damping {:?}",
                iterations,
                chisq_total,
                lambda
            );
            if let FitPhase::Done(status) = phase {
                match status {
                    FitStatus::Converged => {
                        log::debug!("converged after {} iterations", iterations)
                    }
                    FitStatus::Failed(FailureReason::SingularSystem) => {
                        log::warn!(
                            "damped normal equations not solvable at iteration {}",
                            iterations
                        )
                    }
                    FitStatus::Failed(FailureReason::NonConvergence) => {
                        log::warn!("no convergence after {} iterations", iterations)
                    }
                }
                if self.abort_on_singular
                    && status == FitStatus::Failed(FailureReason::SingularSystem)
                {
                    return Err(FitError::SingularSystem {
                        iteration: iterations,
                    });
                }
                break status;
            }
        };
        Ok(RunOutcome {
            status,
            finals: params,
            evals,
            iterations,
        })
    }

    /// One outer iteration: retry the damped solve with growing damping
    /// until a trial step lowers the total chi square or the retry budget is
    /// exhausted. On acceptance the iteration state is updated in place and
    /// the damping is lowered for the next iteration.
    ///
    /// A trial step that the model refuses to evaluate (for example because
    /// it would make a lifetime nonpositive) counts as a rejected step.
    #[allow(clippy::too_many_arguments)]
    fn attempt_step<Model>(
        &self,
        problem: &GlobalFitProblem<Model>,
        mapper: &GlobalParameterMapper,
        columns: &[usize],
        normal: &NormalEquations<ScalarType>,
        lambda: &mut ScalarType,
        reduced: &mut DVector<ScalarType>,
        params: &mut Vec<DVector<ScalarType>>,
        evals: &mut Vec<CurveEval<ScalarType>>,
        chisq_total: &mut ScalarType,
    ) -> StepOutcome<ScalarType>
    where
        Model: DecayModel<ScalarType = ScalarType>,
    {
        let mut last_solve_failed = false;
        for _attempt in 0..self.max_step_retries {
            let Some(delta) = normal.solve_damped(*lambda) else {
                last_solve_failed = true;
                *lambda = self.raised_damping(*lambda);
                continue;
            };
            last_solve_failed = false;
            let mut trial = &*reduced + &delta;
            if !restrain_trial(problem.restraints(), mapper, &mut trial) {
                *lambda = self.raised_damping(*lambda);
                continue;
            }
            match evaluate_batch(problem, mapper, columns, &trial) {
                Ok((trial_params, trial_evals, trial_chisq)) if trial_chisq <= *chisq_total => {
                    let previous = *chisq_total;
                    *reduced = trial;
                    *params = trial_params;
                    *evals = trial_evals;
                    *chisq_total = trial_chisq;
                    *lambda = self.lowered_damping(*lambda);
                    return StepOutcome::Accepted {
                        previous,
                        current: trial_chisq,
                    };
                }
                Ok(_) | Err(_) => {
                    *lambda = self.raised_damping(*lambda);
                }
            }
        }
        if last_solve_failed {
            StepOutcome::SolveFailed
        } else {
            StepOutcome::RetriesExhausted
        }
    }

    fn raised_damping(&self, lambda: ScalarType) -> ScalarType {
        Float::min(lambda * self.lambda_scale_up, self.lambda_ceiling)
    }

    fn lowered_damping(&self, lambda: ScalarType) -> ScalarType {
        Float::max(lambda * self.lambda_scale_down, self.lambda_floor)
    }

    /// Assemble one transient's output, including only the vectors whose
    /// output flags are enabled. The residual output covers the full time
    /// range, unlike the windowed residuals used during iteration.
    fn assemble_transient<Model>(
        &self,
        problem: &GlobalFitProblem<Model>,
        column: usize,
        parameters: DVector<ScalarType>,
        eval: CurveEval<ScalarType>,
        status: FitStatus,
    ) -> TransientFit<ScalarType>
    where
        Model: DecayModel<ScalarType = ScalarType>,
    {
        let residuals = self.output_residuals.then(|| {
            DVector::from_fn(problem.n_data(), |k, _| {
                problem.transients()[(k, column)] - eval.fitted[k]
            })
        });
        TransientFit {
            parameters: self.output_parameters.then_some(parameters),
            fitted: self.output_fitted.then_some(eval.fitted),
            residuals,
            chisq: eval.chisq,
            status,
        }
    }
}

/// The per-run state the dispatch layer consumes: the shared terminal
/// status, the final full parameters and evaluation per batch slot and the
/// number of outer iterations performed.
struct RunOutcome<ScalarType>
where
    ScalarType: Scalar,
{
    status: FitStatus,
    finals: Vec<DVector<ScalarType>>,
    evals: Vec<CurveEval<ScalarType>>,
    iterations: usize,
}

/// The degrees of freedom of the problem: the number of fitted data points
/// minus the number of free parameters, counting each free shared parameter
/// once and each free local parameter once per transient. Clamped below at
/// one so that reduced chi squares stay well defined.
fn degrees_of_freedom<Model>(
    problem: &GlobalFitProblem<Model>,
    mapper: &GlobalParameterMapper,
) -> usize
where
    Model: DecayModel,
    Model::ScalarType: Scalar + RealField + Float,
{
    let fitted = mapper.free_global_count() + mapper.free_local_count() * mapper.n_trans();
    let observations = problem.active_len() * problem.n_trans();
    observations.saturating_sub(fitted).max(1)
}

/// Apply the problem's restraints to a trial reduced vector. Clamping
/// restraints project out-of-bounds entries onto the box and always accept;
/// rejecting restraints accept only if every entry lies inside the box.
/// Returns whether the (possibly clamped) trial may be evaluated.
fn restrain_trial<ScalarType>(
    restraints: Option<&Restraints<ScalarType>>,
    mapper: &GlobalParameterMapper,
    trial: &mut DVector<ScalarType>,
) -> bool
where
    ScalarType: Scalar + Float,
{
    let Some(restraints) = restraints else {
        return true;
    };
    match restraints.policy() {
        RestrainPolicy::Clamp => {
            for index in 0..trial.len() {
                trial[index] = restraints.clamped(mapper.full_position(index), trial[index]);
            }
            true
        }
        RestrainPolicy::Reject => (0..trial.len())
            .all(|index| restraints.contains(mapper.full_position(index), trial[index])),
    }
}

/// Expand the reduced vector for every batch slot and evaluate the model on
/// each transient, returning the full parameter vectors, the evaluations and
/// the total chi square of the batch.
#[allow(clippy::type_complexity)]
fn evaluate_batch<Model, ScalarType>(
    problem: &GlobalFitProblem<Model>,
    mapper: &GlobalParameterMapper,
    columns: &[usize],
    reduced: &DVector<ScalarType>,
) -> Result<
    (
        Vec<DVector<ScalarType>>,
        Vec<CurveEval<ScalarType>>,
        ScalarType,
    ),
    ModelError,
>
where
    Model: DecayModel<ScalarType = ScalarType>,
    ScalarType: Scalar + RealField + Float,
{
    let mut params = Vec::with_capacity(columns.len());
    let mut evals = Vec::with_capacity(columns.len());
    let mut total = ScalarType::zero();
    for (slot, &column) in columns.iter().enumerate() {
        let full = mapper.expand_for_slot(reduced, problem.initial_guesses().column(column), slot);
        let eval = evaluate_curve(
            problem.model(),
            &full,
            problem.transient(column),
            problem.fit_window(),
            problem.weights_of(column),
        )?;
        total += eval.chisq;
        params.push(full);
        evals.push(eval);
    }
    Ok((params, evals, total))
}
