use nalgebra::Scalar;
use num_traits::Float;

use crate::fit::{FailureReason, FitStatus};

/// The phase of an ongoing fit. The solver keeps iterating until the phase
/// becomes terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FitPhase {
    /// the fit has not reached a terminal state yet
    Iterating,
    /// the fit ended with the given status
    Done(FitStatus),
}

impl FitPhase {
    /// the terminal status, if the fit has ended
    pub(crate) fn status(self) -> Option<FitStatus> {
        match self {
            FitPhase::Iterating => None,
            FitPhase::Done(status) => Some(status),
        }
    }
}

/// What a single outer iteration of the solver achieved. One outer iteration
/// assembles the normal equations once and then retries the damped step with
/// increasing damping until a trial step is accepted or the retry budget is
/// exhausted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum StepOutcome<ScalarType>
where
    ScalarType: Scalar,
{
    /// a trial step was accepted, recording the chi square before and after
    Accepted {
        /// the chi square before the step
        previous: ScalarType,
        /// the chi square after the step
        current: ScalarType,
    },
    /// no trial step was accepted within the retry budget and the last
    /// attempt was a rejected step (the chi square did not improve)
    RetriesExhausted,
    /// no trial step was accepted within the retry budget and the last
    /// attempt failed because the damped normal equations could not be solved
    SolveFailed,
}

/// The transition function of the fit. Maps the outcome of the outer
/// iteration with the given zero-based index onto the next phase.
///
/// An accepted step whose relative chi square improvement falls below
/// `chisq_delta` ends the fit as converged; an exact fit (previous chi
/// square of zero) converges immediately. When the retry budget was
/// exhausted, the terminal status reports what the last attempt did: a
/// failed solve means the system is singular, a rejected step means the
/// fit does not converge. Reaching the iteration cap without convergence
/// also ends the fit as non-converged.
pub(crate) fn advance<ScalarType>(
    outcome: StepOutcome<ScalarType>,
    iteration: usize,
    max_iterations: usize,
    chisq_delta: ScalarType,
) -> FitPhase
where
    ScalarType: Scalar + Float,
{
    match outcome {
        StepOutcome::SolveFailed => FitPhase::Done(FitStatus::Failed(FailureReason::SingularSystem)),
        StepOutcome::RetriesExhausted => {
            FitPhase::Done(FitStatus::Failed(FailureReason::NonConvergence))
        }
        StepOutcome::Accepted { previous, current } => {
            let improvement = if previous > ScalarType::zero() {
                (previous - current) / previous
            } else {
                ScalarType::zero()
            };
            if improvement < chisq_delta {
                FitPhase::Done(FitStatus::Converged)
            } else if iteration + 1 >= max_iterations {
                FitPhase::Done(FitStatus::Failed(FailureReason::NonConvergence))
            } else {
                FitPhase::Iterating
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DELTA: f64 = 1e-4;

    #[test]
    fn large_improvements_keep_the_fit_iterating() {
        let phase = advance(
            StepOutcome::Accepted {
                previous: 100.,
                current: 50.,
            },
            3,
            100,
            DELTA,
        );
        assert_eq!(phase, FitPhase::Iterating);
    }

    #[test]
    fn small_relative_improvements_converge() {
        let phase = advance(
            StepOutcome::Accepted {
                previous: 100.,
                current: 100. - 100. * DELTA / 2.,
            },
            3,
            100,
            DELTA,
        );
        assert_eq!(phase, FitPhase::Done(FitStatus::Converged));
    }

    #[test]
    fn an_exact_fit_converges_immediately() {
        let phase = advance(
            StepOutcome::Accepted {
                previous: 0.,
                current: 0.,
            },
            0,
            100,
            DELTA,
        );
        assert_eq!(phase, FitPhase::Done(FitStatus::Converged));
    }

    #[test]
    fn improvement_right_at_the_threshold_keeps_iterating() {
        // the convergence test is a strict less-than; these values make the
        // improvement come out as exactly 0.25 in floating point
        let phase = advance(
            StepOutcome::Accepted {
                previous: 1.,
                current: 0.75,
            },
            0,
            100,
            0.25,
        );
        assert_eq!(phase, FitPhase::Iterating);
    }

    #[test]
    fn the_iteration_cap_fails_the_fit_as_nonconverged() {
        let phase = advance(
            StepOutcome::Accepted {
                previous: 100.,
                current: 50.,
            },
            99,
            100,
            DELTA,
        );
        assert_eq!(
            phase,
            FitPhase::Done(FitStatus::Failed(FailureReason::NonConvergence))
        );
    }

    #[test]
    fn convergence_wins_over_the_iteration_cap() {
        let phase = advance(
            StepOutcome::Accepted {
                previous: 100.,
                current: 100.,
            },
            99,
            100,
            DELTA,
        );
        assert_eq!(phase, FitPhase::Done(FitStatus::Converged));
    }

    #[test]
    fn exhausted_retries_report_what_the_last_attempt_did() {
        assert_eq!(
            advance::<f64>(StepOutcome::RetriesExhausted, 5, 100, DELTA),
            FitPhase::Done(FitStatus::Failed(FailureReason::NonConvergence))
        );
        assert_eq!(
            advance::<f64>(StepOutcome::SolveFailed, 5, 100, DELTA),
            FitPhase::Done(FitStatus::Failed(FailureReason::SingularSystem))
        );
    }
}
