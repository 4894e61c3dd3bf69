use crate::mapping::GlobalLayout;
use crate::model::{errors::ModelError, DecayModel};
use crate::noise::NoiseModel;
use crate::problem::{GlobalFitProblem, Restraints};
use crate::util::Weights;
use nalgebra::{DMatrix, DVector, Dyn, RealField, Scalar};
use num_traits::{Float, Zero};
use thiserror::Error as ThisError;

/// Errors pertaining to use errors of the [GlobalFitProblemBuilder]
#[derive(Debug, Clone, ThisError, PartialEq, Eq)]
pub enum GlobalFitBuilderError {
    /// the transient data was not given to the builder
    #[error("Transient data not provided")]
    TransientsMissing,

    /// no initial parameter guesses were given to the builder
    #[error("Initial parameter guesses not provided")]
    InitialGuessMissing,

    /// the transient matrix has no rows or no columns
    #[error("Transient matrix must have a nonzero number of rows and columns.")]
    ZeroLengthData,

    /// the model output length and the transient length disagree
    #[error(
        "Transients and model must have the same number of time bins. Model produces {} bins and transients have {} bins.",
        model_length,
        data_length
    )]
    InvalidLengthOfData {
        /// the number of time bins the model produces values for
        model_length: usize,
        /// the number of rows of the transient matrix
        data_length: usize,
    },

    /// the fit window is empty or exceeds the data range
    #[error(
        "Fit window [{}, {}) is invalid for transients with {} time bins.",
        fit_start,
        fit_end,
        n_data
    )]
    InvalidFitWindow {
        /// the first bin inside the window
        fit_start: usize,
        /// one past the last bin inside the window
        fit_end: usize,
        /// the number of time bins of the transients
        n_data: usize,
    },

    /// the model has a different number of parameters than the provided initial guesses
    #[error(
        "Initial guesses must have same length as parameters. Model has {} parameters and {} initial guesses were provided.",
        model_count,
        provided_count
    )]
    InvalidParameterCount {
        /// the number of parameters of the model
        model_count: usize,
        /// the number of rows of the provided guess matrix
        provided_count: usize,
    },

    /// the initial guess matrix has neither one column nor one column per transient
    #[error(
        "Initial guesses must have one column or one column per transient. The batch has {} transients, but {} guess columns were provided.",
        n_trans,
        provided_count
    )]
    InvalidInitialGuessCount {
        /// the number of transients in the batch
        n_trans: usize,
        /// the number of provided guess columns
        provided_count: usize,
    },

    /// the free mask and the parameter vector have different lengths
    #[error(
        "Free mask must have one entry per parameter. Model has {} parameters and {} mask entries were provided.",
        model_count,
        provided_count
    )]
    InvalidLengthOfMask {
        /// the number of parameters of the model
        model_count: usize,
        /// the number of provided mask entries
        provided_count: usize,
    },

    /// the layout was declared for a different parameter vector length
    #[error(
        "Layout was declared for {} parameters, but the model has {}.",
        layout_count,
        model_count
    )]
    InvalidLayout {
        /// the number of parameters of the model
        model_count: usize,
        /// the parameter count the layout was declared for
        layout_count: usize,
    },

    /// a sigma vector has the wrong length for the transients
    #[error(
        "Noise sigmas must cover the full time range of {} bins, but {} were provided.",
        data_length,
        provided_count
    )]
    InvalidLengthOfSigma {
        /// the number of time bins of the transients
        data_length: usize,
        /// the number of provided sigma values
        provided_count: usize,
    },

    /// a sigma value was zero or negative
    #[error("Noise sigma values must be positive.")]
    NonPositiveSigma,

    /// restraint bounds have the wrong length for the parameter vector
    #[error(
        "Restraints must have one bound pair per parameter. Model has {} parameters and {} bound pairs were provided.",
        model_count,
        provided_count
    )]
    InvalidLengthOfRestraints {
        /// the number of parameters of the model
        model_count: usize,
        /// the number of provided bound pairs
        provided_count: usize,
    },

    /// a lower restraint bound exceeds its upper bound
    #[error("Restraint lower bound exceeds upper bound at parameter position {}.", position)]
    InvalidRestraintBounds {
        /// the parameter position with crossed bounds
        position: usize,
    },

    /// the model cannot be evaluated at an initial guess
    #[error("Initial guess for transient {} is not evaluable: {}", column, source)]
    InvalidInitialGuess {
        /// the column of the offending guess
        column: usize,
        /// the model error describing what is wrong with the guess
        #[source]
        source: ModelError,
    },
}

/// A builder structure to create a [GlobalFitProblem](super::GlobalFitProblem),
/// which can be handed to a
/// [MarquardtSolver](crate::solvers::marquardt::MarquardtSolver) for fitting.
/// # Example
/// The following code creates a problem for fitting a single-exponential
/// decay model to a batch of transients with default settings, i.e. an
/// unweighted fit over the full time range with all parameters local and
/// free.
/// ```rust
/// use flimfit::prelude::*;
/// # use nalgebra::{DMatrix, DVector};
/// let model = MultiExpDecay::new(1, 0.1, 64);
/// # let transients = DMatrix::from_element(64, 4, 1.0);
/// let problem = GlobalFitProblemBuilder::new(model)
///     .transients(transients)
///     .initial_guess(DVector::from_column_slice(&[1., 80., 2.]))
///     .build()
///     .unwrap();
/// ```
///
/// # Building a Problem
///
/// A new builder is constructed with the [new](GlobalFitProblemBuilder::new)
/// constructor. It must be filled with content using the methods described in
/// the following. After all mandatory fields have been filled, the
/// [build](GlobalFitProblemBuilder::build) method can be called. This returns
/// a [Result](std::result::Result) type that contains the finished problem
/// iff all mandatory fields have been set with valid values. Otherwise it
/// contains an error variant.
#[derive(Clone)]
pub struct GlobalFitProblemBuilder<Model>
where
    Model: DecayModel,
    Model::ScalarType: Scalar + RealField + Float,
{
    /// Required: the measured transients we want to fit, one column per curve
    transients: Option<DMatrix<Model::ScalarType>>,
    /// Required: the decay model to be fitted to the transients
    model: Model,
    /// Optional: the active fit window, defaults to the full time range
    window: Option<(usize, usize)>,
    /// Required: the initial parameter guesses, either one column that is
    /// broadcast over the batch or one column per transient
    initial: Option<DMatrix<Model::ScalarType>>,
    /// Optional: free flags per parameter position, defaults to all free
    free_mask: Option<Vec<bool>>,
    /// Optional: the global/local partition, defaults to all local
    layout: Option<GlobalLayout>,
    /// Optional: the noise model, defaults to an unweighted fit
    noise: NoiseModel<Model::ScalarType>,
    /// Optional: box restraints on trial steps, defaults to none
    restraints: Option<Restraints<Model::ScalarType>>,
}

impl<Model> GlobalFitProblemBuilder<Model>
where
    Model: DecayModel,
    Model::ScalarType: Scalar + RealField + Float,
{
    /// Create a new builder based on the given decay model.
    pub fn new(model: Model) -> Self {
        Self {
            transients: None,
            model,
            window: None,
            initial: None,
            free_mask: None,
            layout: None,
            noise: NoiseModel::Unweighted,
            restraints: None,
        }
    }

    /// **Mandatory**: Set the measured transients to fit. The columns of the
    /// matrix are the individual photon count curves and the rows are the
    /// time bins, which must match the output length of the model.
    pub fn transients(self, transients: DMatrix<Model::ScalarType>) -> Self {
        Self {
            transients: Some(transients),
            ..self
        }
    }

    /// **Optional** Restrict the fit to the half open bin range
    /// `[fit_start, fit_end)`. Bins outside the window do not contribute
    /// residuals, but the model is still evaluated from bin zero onwards so
    /// that convolution with an instrument response sees the causal history
    /// of the curve.
    ///
    /// If this is not given, the full time range enters the fit.
    pub fn fit_window(self, fit_start: usize, fit_end: usize) -> Self {
        Self {
            window: Some((fit_start, fit_end)),
            ..self
        }
    }

    /// **Mandatory** (unless [initial_guesses](GlobalFitProblemBuilder::initial_guesses)
    /// is used): Set one initial parameter guess that is broadcast to every
    /// transient of the batch.
    pub fn initial_guess(self, guess: DVector<Model::ScalarType>) -> Self {
        let nrows = guess.nrows();
        Self {
            initial: Some(guess.reshape_generic(Dyn(nrows), Dyn(1))),
            ..self
        }
    }

    /// **Mandatory** (unless [initial_guess](GlobalFitProblemBuilder::initial_guess)
    /// is used): Set individual initial parameter guesses, one column per
    /// transient in the same order as the transient columns.
    pub fn initial_guesses(self, guesses: DMatrix<Model::ScalarType>) -> Self {
        Self {
            initial: Some(guesses),
            ..self
        }
    }

    /// **Optional** Mark parameter positions as free (`true`) or fixed
    /// (`false`). Fixed positions keep their initial guess value for each
    /// transient and are excluded from the optimization.
    ///
    /// If this is not given, all parameters are free.
    pub fn free_mask(self, free_mask: Vec<bool>) -> Self {
        Self {
            free_mask: Some(free_mask),
            ..self
        }
    }

    /// **Optional** Declare which parameter positions are shared across the
    /// batch, see [GlobalLayout].
    ///
    /// If this is not given, all parameters are local and each transient is
    /// fitted on its own.
    pub fn layout(self, layout: GlobalLayout) -> Self {
        Self {
            layout: Some(layout),
            ..self
        }
    }

    /// **Optional** Set the noise model of the transients, which determines
    /// the statistical weights of the residuals, see [NoiseModel].
    ///
    /// If this is not given, the fit is unweighted.
    pub fn noise(self, noise: NoiseModel<Model::ScalarType>) -> Self {
        Self { noise, ..self }
    }

    /// **Optional** Add box restraints on the parameters, see [Restraints].
    ///
    /// If this is not given, only the built-in positivity of lifetimes
    /// restricts the parameters.
    pub fn restraints(self, restraints: Restraints<Model::ScalarType>) -> Self {
        Self {
            restraints: Some(restraints),
            ..self
        }
    }

    /// build the fitting problem from the builder.
    /// # Prerequisites
    /// * All mandatory parameters have been set (see individual builder methods for details)
    /// * the transients and the model have the same number of time bins
    /// * the fit window lies inside the time range and is nonempty
    /// * guesses, mask, layout, sigmas and restraints are sized for the model
    /// * the model can be evaluated at every initial guess
    /// # Returns
    /// If all prerequisites are fulfilled, returns a
    /// [GlobalFitProblem](super::GlobalFitProblem) with the given content,
    /// otherwise returns an error variant.
    pub fn build(self) -> Result<GlobalFitProblem<Model>, GlobalFitBuilderError> {
        // and assign the defaults to the values we don't have
        let transients = self
            .transients
            .ok_or(GlobalFitBuilderError::TransientsMissing)?;
        let initial = self
            .initial
            .ok_or(GlobalFitBuilderError::InitialGuessMissing)?;
        let model = self.model;
        let noise = self.noise;

        // now do some sanity checks for the values and return
        // an error if they do not pass the test
        if transients.is_empty() {
            return Err(GlobalFitBuilderError::ZeroLengthData);
        }
        let n_data = transients.nrows();
        let n_trans = transients.ncols();

        if model.output_len() != n_data {
            return Err(GlobalFitBuilderError::InvalidLengthOfData {
                model_length: model.output_len(),
                data_length: n_data,
            });
        }

        let (fit_start, fit_end) = self.window.unwrap_or((0, n_data));
        if fit_start >= fit_end || fit_end > n_data {
            return Err(GlobalFitBuilderError::InvalidFitWindow {
                fit_start,
                fit_end,
                n_data,
            });
        }

        let param_count = model.parameter_count();
        if initial.nrows() != param_count {
            return Err(GlobalFitBuilderError::InvalidParameterCount {
                model_count: param_count,
                provided_count: initial.nrows(),
            });
        }

        let initial_guesses = if initial.ncols() == 1 {
            // broadcast a single guess over the batch
            DMatrix::from_fn(param_count, n_trans, |row, _| initial[(row, 0)])
        } else if initial.ncols() == n_trans {
            initial
        } else {
            return Err(GlobalFitBuilderError::InvalidInitialGuessCount {
                n_trans,
                provided_count: initial.ncols(),
            });
        };

        let free_mask = self.free_mask.unwrap_or_else(|| vec![true; param_count]);
        if free_mask.len() != param_count {
            return Err(GlobalFitBuilderError::InvalidLengthOfMask {
                model_count: param_count,
                provided_count: free_mask.len(),
            });
        }

        let layout = self
            .layout
            .unwrap_or_else(|| GlobalLayout::all_local(param_count));
        if layout.parameter_count() != param_count {
            return Err(GlobalFitBuilderError::InvalidLayout {
                model_count: param_count,
                layout_count: layout.parameter_count(),
            });
        }

        match &noise {
            NoiseModel::Const(sigma) => {
                if *sigma <= Model::ScalarType::zero() {
                    return Err(GlobalFitBuilderError::NonPositiveSigma);
                }
            }
            NoiseModel::Given(sigma) => {
                if sigma.len() != n_data {
                    return Err(GlobalFitBuilderError::InvalidLengthOfSigma {
                        data_length: n_data,
                        provided_count: sigma.len(),
                    });
                }
                if sigma.iter().any(|s| *s <= Model::ScalarType::zero()) {
                    return Err(GlobalFitBuilderError::NonPositiveSigma);
                }
            }
            NoiseModel::Unweighted | NoiseModel::Poisson => {}
        }

        if let Some(restraints) = &self.restraints {
            if restraints.lower().len() != param_count || restraints.upper().len() != param_count {
                return Err(GlobalFitBuilderError::InvalidLengthOfRestraints {
                    model_count: param_count,
                    provided_count: restraints.lower().len().min(restraints.upper().len()),
                });
            }
            for position in 0..param_count {
                if restraints.lower()[position] > restraints.upper()[position] {
                    return Err(GlobalFitBuilderError::InvalidRestraintBounds { position });
                }
            }
        }

        // the model must be evaluable at every starting point, which also
        // catches non-positive lifetime guesses early
        for column in 0..n_trans {
            let guess = initial_guesses.column(column).clone_owned();
            model
                .eval(&guess)
                .map_err(|source| GlobalFitBuilderError::InvalidInitialGuess { column, source })?;
        }

        // precompute the statistical weights over the active window
        let weights: Vec<Weights<Model::ScalarType>> = (0..n_trans)
            .map(|column| noise.weights_for(transients.column(column), fit_start, fit_end))
            .collect();

        Ok(GlobalFitProblem {
            transients,
            model,
            fit_start,
            fit_end,
            initial_guesses,
            free_mask,
            layout,
            noise,
            weights,
            restraints: self.restraints,
        })
    }
}
