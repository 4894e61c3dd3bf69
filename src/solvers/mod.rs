/// Contains the Levenberg-Marquardt solver for batch decay fitting.
///
/// This module provides implementations of optimization algorithms for
/// solving the global nonlinear least squares problem of batch decay
/// fitting. Currently, it only contains the [`marquardt`] module which
/// implements the classic Levenberg-Marquardt algorithm with Marquardt
/// damping.
pub mod marquardt;
