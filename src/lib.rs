#![warn(missing_docs)]
//!
//! # Introduction
//!
//! Fluorescence lifetime imaging (FLIM) produces one photon count transient per
//! pixel: a histogram of photon arrival times that decays with the fluorescence
//! lifetimes of the fluorophores in that pixel. The purpose of this crate is to
//! fit multi-exponential decay models to large batches of such transients using
//! fast and robust algorithms, while providing a simple interface.
//!
//! Consider a transient `$\vec{y} = (y_1,\dots,y_{N_{data}})^T$` counted into
//! time bins of width `$\Delta t$`. The model fitted to each transient is a sum
//! of exponential decay components on a constant background,
//!
//! ```math
//! f_k(\vec{p}) = Z + \sum_{i=1}^{N_{comp}} A_i \exp\left(-t_k/\tau_i\right),
//! \quad t_k = k \, \Delta t,
//! ```
//!
//! with the parameter vector `$\vec{p} = (Z, A_1, \tau_1, \dots, A_{N_{comp}},
//! \tau_{N_{comp}})^T$`. When the excitation pulse and detector response are
//! not negligibly fast, the model curve is convolved with a measured
//! [instrument response function](crate::irf::InstrumentResponse) before it is
//! compared to the data.
//!
//! ## Global Analysis
//!
//! Photon budgets per pixel are small, so fitting every transient on its own
//! gives noisy lifetime estimates. Global analysis exploits that the lifetimes
//! are material constants which are *shared* across all pixels of an image,
//! while the amplitudes and background vary per pixel. Declaring the shared
//! subset couples the batch into one large least squares problem with far
//! fewer parameters per data point, which stabilizes the lifetime estimates
//! dramatically.
//!
//! ## What This Crate Computes
//!
//! For a batch of `$T$` transients `$\vec{y}^{(s)}$` this crate finds the
//! shared parameters and the per-transient parameters that minimize the total
//! weighted sum of squared residuals
//!
//! ```math
//! \arg\min \sum_{s=1}^{T}
//!   ||\mathbf{W}^{(s)}(\vec{y}^{(s)}-\vec{f}(\vec{p}^{(s)}))||_2^2,
//! ```
//!
//! where `$\mathbf{W}^{(s)}$` is a diagonal weight matrix derived from the
//! [noise model](crate::noise::NoiseModel) of the data and each full parameter
//! vector `$\vec{p}^{(s)}$` is assembled from the shared and the local
//! parameter values. The minimization uses the Levenberg-Marquardt algorithm
//! with the classic diagonal damping strategy of (Marquardt1963), iterating on
//! a reduced parameter vector in which every shared parameter appears exactly
//! once.
//!
//! # Usage and Workflow
//!
//! The workflow for fitting a batch of transients consists of the following
//! steps.
//! 1. Create a [MultiExpDecay](crate::model::MultiExpDecay) model (or
//!    implement the [DecayModel](crate::model::DecayModel) trait for a custom
//!    model), optionally attaching an
//!    [InstrumentResponse](crate::irf::InstrumentResponse).
//! 2. Describe the fit with the
//!    [GlobalFitProblemBuilder](crate::problem::GlobalFitProblemBuilder):
//!    the transient data, the initial guesses, and optionally the fit window,
//!    fixed parameters, the shared parameter
//!    [layout](crate::mapping::GlobalLayout), the noise model and parameter
//!    restraints.
//! 3. Fit the problem with a
//!    [MarquardtSolver](crate::solvers::marquardt::MarquardtSolver). Use
//!    [fit_with_statistics](crate::solvers::marquardt::MarquardtSolver::fit_with_statistics)
//!    to also obtain parameter uncertainties, or
//!    [fit_batches](crate::solvers::marquardt::MarquardtSolver::fit_batches)
//!    to fit many independent problems in parallel.
//! 4. Inspect the per-transient [results](crate::fit::FitResult). A transient
//!    that fails to converge is reported through its
//!    [status](crate::fit::FitStatus), not as an error, so one bad pixel
//!    never discards the rest of the batch.
//!
//! # Example
//!
//! Fitting a single synthetic transient:
//!
//! ```rust
//! use flimfit::prelude::*;
//! use nalgebra::{DVector, Dyn};
//!
//! // a single-exponential decay sampled into 64 bins of 0.1 ns
//! let model = MultiExpDecay::<f64>::new(1, 0.1, 64);
//! let truth = DVector::from_column_slice(&[0., 100., 2.0]);
//! let transient = model.eval(&truth).unwrap();
//!
//! let problem = GlobalFitProblemBuilder::new(model)
//!     .transients(transient.reshape_generic(Dyn(64), Dyn(1)))
//!     .initial_guess(DVector::from_column_slice(&[5., 80., 1.5]))
//!     .build()
//!     .unwrap();
//!
//! let result = MarquardtSolver::new().fit(&problem).unwrap();
//! assert!(result.all_converged());
//! let parameters = result.transient(0).parameters().unwrap();
//! // the lifetime of 2 ns is recovered
//! assert!((parameters[2] - 2.0).abs() < 1e-3);
//! ```
//!
//! Global fitting of a shared lifetime across two transients works the same
//! way, except that the builder additionally receives a layout declaring the
//! lifetime position as shared:
//!
//! ```rust
//! use flimfit::prelude::*;
//! use nalgebra::{DMatrix, DVector};
//!
//! let model = MultiExpDecay::new(1, 0.1, 64);
//! let bright = model.eval(&DVector::from_column_slice(&[0., 100., 2.0])).unwrap();
//! let dim = model.eval(&DVector::from_column_slice(&[0., 25., 2.0])).unwrap();
//!
//! // parameter layout is (Z, A, tau), the lifetime sits at position 2
//! let layout = GlobalLayout::with_global(3, &[2]).unwrap();
//! let problem = GlobalFitProblemBuilder::new(model)
//!     .transients(DMatrix::from_columns(&[bright, dim]))
//!     .initial_guess(DVector::from_column_slice(&[1., 50., 1.5]))
//!     .layout(layout)
//!     .build()
//!     .unwrap();
//!
//! let result = MarquardtSolver::new().fit(&problem).unwrap();
//! assert!(result.all_converged());
//! // both transients report the identical shared lifetime
//! let first = result.transient(0).parameters().unwrap()[2];
//! let second = result.transient(1).parameters().unwrap()[2];
//! assert_eq!(first, second);
//! ```
//!
//! # References and Further Reading
//!
//! (Marquardt1963) Marquardt, D.W. An Algorithm for Least-Squares Estimation
//! of Nonlinear Parameters. *J. Soc. Indust. Appl. Math.* **11**(2), 431-441
//! (1963). DOI: [10.1137/0111030](https://doi.org/10.1137/0111030)
//!
//! (Verveer2000) Verveer, P.J., Squire, A., Bastiaens, P.I.H. Global analysis
//! of fluorescence lifetime imaging microscopy data. *Biophys J* **78**(4),
//! 2127-2137 (2000). DOI:
//! [10.1016/S0006-3495(00)76759-2](https://doi.org/10.1016/S0006-3495(00)76759-2)

/// the per-transient and batch level results of a fit
pub mod fit;
/// instrument response functions and their convolution with model curves
pub mod irf;
/// declaring shared parameters and mapping between full and reduced vectors
pub mod mapping;
/// decay models that can be fitted to transients
pub mod model;
/// noise models that determine the statistical weights of the residuals
pub mod noise;
/// commonly useful imports
pub mod prelude;
/// describing and validating a batch fitting problem
pub mod problem;
/// solvers for the nonlinear minimization problem
pub mod solvers;
/// statistical information about completed fits
pub mod statistics;
/// helper functionality for weighted least squares
pub mod util;

#[cfg(test)]
pub mod test_helpers;
