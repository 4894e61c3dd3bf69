use thiserror::Error as ThisError;

/// An error structure that contains error variants that occur when evaluating
/// a decay model or its partial derivatives.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ModelError {
    /// The parameter vector handed to the model has the wrong number of elements.
    #[error(
        "Model expects {} parameters, but {} were provided.",
        expected,
        provided
    )]
    ParameterCountMismatch {
        /// the number of parameters the model takes
        expected: usize,
        /// the number of parameters that were provided
        provided: usize,
    },

    /// A lifetime parameter was zero or negative. Exponential decays are only
    /// defined for positive lifetimes, so the model cannot be evaluated.
    #[error("Lifetime parameter at index {} must be positive.", index)]
    NonPositiveLifetime {
        /// the index of the offending lifetime inside the parameter vector
        index: usize,
    },

    /// A partial derivative was requested for a parameter index that the model
    /// does not have.
    #[error(
        "Derivative index {} is out of bounds for a model with {} parameters.",
        index,
        parameter_count
    )]
    DerivativeIndexOutOfBounds {
        /// the requested derivative index
        index: usize,
        /// the number of parameters the model takes
        parameter_count: usize,
    },
}
