use nalgebra::{DVector, Scalar};
use num_traits::{Float, FromPrimitive};

use crate::irf::InstrumentResponse;

pub mod errors;

pub use errors::ModelError;

/// This trait describes a photon decay model that the solver can fit to
/// measured transients. A decay model knows how many parameters it takes,
/// on how many time bins it produces values, and how to evaluate both the
/// model curve and its partial derivatives at a given parameter vector.
///
/// The model is evaluated on the full time range of the transient even when
/// only a sub-window of it enters the fit, because convolution with an
/// instrument response needs the causal history of the curve from bin zero
/// onwards.
///
/// This crate ships [`MultiExpDecay`](self::MultiExpDecay) as the standard
/// implementation. Implement this trait yourself to fit a different decay
/// shape with the same solver machinery.
#[cfg_attr(any(test, doctest), mockall::automock(type ScalarType = f64;))]
pub trait DecayModel {
    /// the numeric type of the model, typically `f64` or `f32`
    type ScalarType: Scalar;

    /// the number of parameters the model takes
    fn parameter_count(&self) -> usize;

    /// the number of time bins the model produces values for, which must
    /// match the number of rows of the transient data
    fn output_len(&self) -> usize;

    /// Evaluate the model curve at the given parameter vector.
    ///
    /// # Errors
    ///
    /// An error indicates that the parameter vector is structurally invalid
    /// for this model, e.g. it has the wrong length or contains a
    /// non-positive lifetime.
    fn eval(
        &self,
        parameters: &DVector<Self::ScalarType>,
    ) -> Result<DVector<Self::ScalarType>, ModelError>;

    /// Evaluate the partial derivative of the model curve with respect to
    /// the parameter at the given index.
    ///
    /// # Errors
    ///
    /// Fails for the same structural reasons as [`eval`](DecayModel::eval)
    /// and additionally if the derivative index is out of bounds.
    fn eval_partial_deriv(
        &self,
        parameters: &DVector<Self::ScalarType>,
        index: usize,
    ) -> Result<DVector<Self::ScalarType>, ModelError>;
}

/// # A Multi-Exponential Decay Model
///
/// This is the standard model for fitting time-domain FLIM transients. With
/// $N$ exponential components it reads
///
/// ```math
/// f(t) = Z + \sum_{i=1}^{N} A_i \exp\left(-\frac{t}{\tau_i}\right),
/// ```
///
/// where $Z$ is a constant background offset, $A_i$ are the component
/// amplitudes and $\tau_i$ the component lifetimes. The parameter vector
/// uses the layout
///
/// ```math
/// \vec{p} = (Z, A_1, \tau_1, A_2, \tau_2, \dots, A_N, \tau_N),
/// ```
///
/// so the model takes $2N+1$ parameters in total. The curve is evaluated on
/// the uniform time grid $t_k = k \cdot \Delta t$ for $k=0,\dots,K-1$.
///
/// ## Partial Derivatives
///
/// The derivatives with respect to the parameters are
/// $\partial f / \partial Z = 1$,
/// $\partial f / \partial A_i = \exp(-t/\tau_i)$ and
/// $\partial f / \partial \tau_i = A_i \, t \, \tau_i^{-2} \exp(-t/\tau_i)$.
///
/// ## Instrument Response
///
/// When an [`InstrumentResponse`] is attached with
/// [`with_instrument_response`](MultiExpDecay::with_instrument_response),
/// the model curve and all partial derivatives are convolved with the kernel
/// before they are handed to the solver. Convolution is linear, so convolving
/// each derivative is the same as differentiating the convolved curve.
///
/// Lifetimes must be strictly positive. Evaluating the model with a zero or
/// negative lifetime fails with [`ModelError::NonPositiveLifetime`].
#[derive(Debug, Clone, PartialEq)]
pub struct MultiExpDecay<ScalarType>
where
    ScalarType: Scalar,
{
    /// the uniform time grid the model is evaluated on
    time: DVector<ScalarType>,
    /// the time increment between adjacent bins
    x_inc: ScalarType,
    /// the number of exponential components
    n_comp: usize,
    /// the optional instrument response the curve is convolved with
    irf: Option<InstrumentResponse<ScalarType>>,
}

impl<ScalarType> MultiExpDecay<ScalarType>
where
    ScalarType: Scalar + Float + FromPrimitive,
{
    /// Create a multi-exponential decay model with `n_comp` components on a
    /// time grid of `n_data` bins spaced `x_inc` apart.
    ///
    /// # Panics
    ///
    /// Panics if `x_inc` is not strictly positive or if `n_comp` or `n_data`
    /// is zero.
    pub fn new(n_comp: usize, x_inc: ScalarType, n_data: usize) -> Self {
        assert!(
            x_inc > ScalarType::zero(),
            "Time increment must be positive"
        );
        assert!(n_comp > 0, "Model must have at least one component");
        assert!(n_data > 0, "Time grid must have at least one bin");
        let time = DVector::from_fn(n_data, |k, _| {
            ScalarType::from_usize(k).expect("bin index must convert to scalar") * x_inc
        });
        Self {
            time,
            x_inc,
            n_comp,
            irf: None,
        }
    }

    /// Attach an instrument response. The model curve and its derivatives
    /// are convolved with this kernel on evaluation.
    pub fn with_instrument_response(self, irf: InstrumentResponse<ScalarType>) -> Self {
        Self {
            irf: Some(irf),
            ..self
        }
    }

    /// the number of exponential components
    pub fn n_comp(&self) -> usize {
        self.n_comp
    }

    /// the time increment between adjacent bins
    pub fn x_inc(&self) -> ScalarType {
        self.x_inc
    }

    /// the time grid the model is evaluated on
    pub fn time(&self) -> &DVector<ScalarType> {
        &self.time
    }

    /// the instrument response, if one is attached
    pub fn instrument_response(&self) -> Option<&InstrumentResponse<ScalarType>> {
        self.irf.as_ref()
    }

    /// check the structural validity of a parameter vector for this model
    fn check_parameters(&self, parameters: &DVector<ScalarType>) -> Result<(), ModelError> {
        let expected = 2 * self.n_comp + 1;
        if parameters.len() != expected {
            return Err(ModelError::ParameterCountMismatch {
                expected,
                provided: parameters.len(),
            });
        }
        for comp in 0..self.n_comp {
            let tau_index = 2 * comp + 2;
            if parameters[tau_index] <= ScalarType::zero() {
                return Err(ModelError::NonPositiveLifetime { index: tau_index });
            }
        }
        Ok(())
    }

    /// convolve with the instrument response if one is attached
    fn apply_irf(&self, curve: DVector<ScalarType>) -> DVector<ScalarType> {
        match &self.irf {
            Some(irf) => irf.convolve(&curve),
            None => curve,
        }
    }
}

impl<ScalarType> DecayModel for MultiExpDecay<ScalarType>
where
    ScalarType: Scalar + Float + FromPrimitive,
{
    type ScalarType = ScalarType;

    fn parameter_count(&self) -> usize {
        2 * self.n_comp + 1
    }

    fn output_len(&self) -> usize {
        self.time.len()
    }

    fn eval(
        &self,
        parameters: &DVector<Self::ScalarType>,
    ) -> Result<DVector<Self::ScalarType>, ModelError> {
        self.check_parameters(parameters)?;
        let offset = parameters[0];
        let mut curve = DVector::from_element(self.time.len(), offset);
        for comp in 0..self.n_comp {
            let amplitude = parameters[2 * comp + 1];
            let tau = parameters[2 * comp + 2];
            for (value, time) in curve.iter_mut().zip(self.time.iter()) {
                *value = *value + amplitude * Float::exp(-*time / tau);
            }
        }
        Ok(self.apply_irf(curve))
    }

    fn eval_partial_deriv(
        &self,
        parameters: &DVector<Self::ScalarType>,
        index: usize,
    ) -> Result<DVector<Self::ScalarType>, ModelError> {
        self.check_parameters(parameters)?;
        if index >= self.parameter_count() {
            return Err(ModelError::DerivativeIndexOutOfBounds {
                index,
                parameter_count: self.parameter_count(),
            });
        }
        let deriv = if index == 0 {
            // the offset contributes one to every bin
            DVector::from_element(self.time.len(), ScalarType::one())
        } else {
            let comp = (index - 1) / 2;
            let amplitude = parameters[2 * comp + 1];
            let tau = parameters[2 * comp + 2];
            let is_amplitude_deriv = (index - 1) % 2 == 0;
            if is_amplitude_deriv {
                self.time.map(|t| Float::exp(-t / tau))
            } else {
                self.time
                    .map(|t| amplitude * t / (tau * tau) * Float::exp(-t / tau))
            }
        };
        Ok(self.apply_irf(deriv))
    }
}
