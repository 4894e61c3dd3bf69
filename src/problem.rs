use crate::mapping::GlobalLayout;
use crate::model::DecayModel;
use crate::noise::NoiseModel;
use crate::util::Weights;
use nalgebra::{DMatrix, DVector, DVectorView, RealField, Scalar};
use num_traits::Float;

mod builder;

pub use builder::GlobalFitBuilderError;
pub use builder::GlobalFitProblemBuilder;

/// How box restraints react to a trial step that leaves the allowed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrainPolicy {
    /// project the offending parameters back onto the nearest bound
    Clamp,
    /// discard the trial step and retry with increased damping
    Reject,
}

/// Box restraints on the parameter vector, applied to every transient of the
/// batch.
///
/// Restraints act on trial steps of the solver: depending on the
/// [`RestrainPolicy`] an out-of-bounds candidate is either clamped onto the
/// box or rejected outright. Independently of any restraints, lifetimes are
/// always kept strictly positive because the decay model is not defined
/// otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct Restraints<ScalarType>
where
    ScalarType: Scalar,
{
    lower: DVector<ScalarType>,
    upper: DVector<ScalarType>,
    policy: RestrainPolicy,
}

impl<ScalarType> Restraints<ScalarType>
where
    ScalarType: Scalar + Float,
{
    /// restraints that clamp out-of-bounds parameters onto the box
    pub fn clamping(lower: DVector<ScalarType>, upper: DVector<ScalarType>) -> Self {
        Self {
            lower,
            upper,
            policy: RestrainPolicy::Clamp,
        }
    }

    /// restraints that reject trial steps leaving the box
    pub fn rejecting(lower: DVector<ScalarType>, upper: DVector<ScalarType>) -> Self {
        Self {
            lower,
            upper,
            policy: RestrainPolicy::Reject,
        }
    }

    /// the lower bounds, one per parameter position
    pub fn lower(&self) -> &DVector<ScalarType> {
        &self.lower
    }

    /// the upper bounds, one per parameter position
    pub fn upper(&self) -> &DVector<ScalarType> {
        &self.upper
    }

    /// the policy applied to out-of-bounds trial steps
    pub fn policy(&self) -> RestrainPolicy {
        self.policy
    }

    /// whether the parameter at this position lies inside the box
    pub(crate) fn contains(&self, position: usize, value: ScalarType) -> bool {
        value >= self.lower[position] && value <= self.upper[position]
    }

    /// the value projected onto the box at this position
    pub(crate) fn clamped(&self, position: usize, value: ScalarType) -> ScalarType {
        Float::min(Float::max(value, self.lower[position]), self.upper[position])
    }
}

/// The problem of fitting a decay model to a batch of measured transients,
/// with a shared (global) parameter subset across the batch.
///
/// # Construction
///
/// Use the [GlobalFitProblemBuilder](self::builder::GlobalFitProblemBuilder)
/// to create an instance of a fitting problem. The builder validates that
/// data, initial guesses, mask, layout, noise model and restraints are
/// structurally consistent, so a successfully built problem can always be
/// handed to the solver.
///
/// # Usage
///
/// Pass the problem to a
/// [MarquardtSolver](crate::solvers::marquardt::MarquardtSolver) to perform
/// the fit. The problem itself is immutable; the solver keeps all iteration
/// state internally, so the same problem value can be fitted repeatedly.
#[derive(Clone)]
pub struct GlobalFitProblem<Model>
where
    Model: DecayModel,
    Model::ScalarType: Scalar + RealField + Float,
{
    /// the measured transients, one column per curve
    pub(crate) transients: DMatrix<Model::ScalarType>,
    /// the decay model that is fitted to each transient
    pub(crate) model: Model,
    /// first time bin (inclusive) that enters the fit
    pub(crate) fit_start: usize,
    /// one past the last time bin that enters the fit
    pub(crate) fit_end: usize,
    /// initial parameter guesses, one column per transient
    pub(crate) initial_guesses: DMatrix<Model::ScalarType>,
    /// free flags per parameter position, false means fixed
    pub(crate) free_mask: Vec<bool>,
    /// the partition into shared and per-transient positions
    pub(crate) layout: GlobalLayout,
    /// the noise model the weights were derived from
    pub(crate) noise: NoiseModel<Model::ScalarType>,
    /// precomputed weights over the active window, one per transient
    pub(crate) weights: Vec<Weights<Model::ScalarType>>,
    /// optional box restraints on trial steps
    pub(crate) restraints: Option<Restraints<Model::ScalarType>>,
}

impl<Model> std::fmt::Debug for GlobalFitProblem<Model>
where
    Model: DecayModel,
    Model::ScalarType: Scalar + RealField + Float,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalFitProblem")
            .field("transients", &self.transients)
            .field("model", &"/* omitted */")
            .field("fit_start", &self.fit_start)
            .field("fit_end", &self.fit_end)
            .field("initial_guesses", &self.initial_guesses)
            .field("free_mask", &self.free_mask)
            .field("layout", &self.layout)
            .field("noise", &self.noise)
            .field("restraints", &self.restraints)
            .finish()
    }
}

impl<Model> GlobalFitProblem<Model>
where
    Model: DecayModel,
    Model::ScalarType: Scalar + RealField + Float,
{
    /// access the contained model immutably
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// the measured transients, one column per curve
    pub fn transients(&self) -> &DMatrix<Model::ScalarType> {
        &self.transients
    }

    /// one transient as a column view over the full time range
    pub(crate) fn transient(&self, index: usize) -> DVectorView<'_, Model::ScalarType> {
        self.transients.column(index)
    }

    /// the number of transients in the batch
    pub fn n_trans(&self) -> usize {
        self.transients.ncols()
    }

    /// the number of time bins of each transient
    pub fn n_data(&self) -> usize {
        self.transients.nrows()
    }

    /// the active fit window as the half open range `[fit_start, fit_end)`
    pub fn fit_window(&self) -> (usize, usize) {
        (self.fit_start, self.fit_end)
    }

    /// the number of time bins inside the active fit window
    pub fn active_len(&self) -> usize {
        self.fit_end - self.fit_start
    }

    /// the initial parameter guesses, one column per transient
    pub fn initial_guesses(&self) -> &DMatrix<Model::ScalarType> {
        &self.initial_guesses
    }

    /// the free flags per parameter position, false means fixed
    pub fn free_mask(&self) -> &[bool] {
        &self.free_mask
    }

    /// the partition into shared and per-transient parameter positions
    pub fn layout(&self) -> &GlobalLayout {
        &self.layout
    }

    /// the noise model of the transients
    pub fn noise(&self) -> &NoiseModel<Model::ScalarType> {
        &self.noise
    }

    /// the box restraints, if any were configured
    pub fn restraints(&self) -> Option<&Restraints<Model::ScalarType>> {
        self.restraints.as_ref()
    }

    /// the precomputed active-window weights of one transient
    pub(crate) fn weights_of(&self, index: usize) -> &Weights<Model::ScalarType> {
        &self.weights[index]
    }
}
