use nalgebra::{DVector, Scalar};
use num_traits::Float;
use thiserror::Error as ThisError;

/// An error structure that contains error variants that occur when constructing
/// an instrument response.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum IrfError {
    /// The instrument response was constructed from an empty sample vector.
    #[error("Instrument response must contain at least one sample.")]
    EmptyInstrumentResponse,
}

/// The measured instrument response function (IRF) of a FLIM acquisition,
/// sampled on the same time grid as the transients.
///
/// The recorded photon arrival histogram is not the ideal decay itself but the
/// ideal decay smeared by the response of the excitation pulse and the
/// detection electronics. This type captures that response as a discrete
/// kernel $g_0,\dots,g_{M-1}$ and provides the causal convolution
///
/// ```math
/// (g * f)_k = \sum_{j=0}^{\min(k,\,M-1)} g_j \, f_{k-j},
/// ```
///
/// which treats the curve $f$ as zero before the start of the measurement
/// window and truncates the result to the length of $f$. Convolution is linear,
/// so the same kernel is applied to a model curve and to each of its partial
/// derivatives when fitting a convolved model.
///
/// The kernel is used exactly as given. In particular it is not normalized
/// internally, so a kernel that does not sum to one rescales the amplitudes
/// of the convolved model accordingly.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentResponse<ScalarType>
where
    ScalarType: Scalar,
{
    samples: DVector<ScalarType>,
}

impl<ScalarType> InstrumentResponse<ScalarType>
where
    ScalarType: Scalar + Float,
{
    /// Create an instrument response from the given kernel samples.
    ///
    /// # Errors
    ///
    /// Fails with [`IrfError::EmptyInstrumentResponse`] if the sample vector
    /// is empty.
    pub fn new(samples: DVector<ScalarType>) -> Result<Self, IrfError> {
        if samples.is_empty() {
            Err(IrfError::EmptyInstrumentResponse)
        } else {
            Ok(Self { samples })
        }
    }

    /// the number of kernel samples
    // a constructed instrument response is never empty
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// the kernel samples this instrument response was constructed from
    pub fn samples(&self) -> &DVector<ScalarType> {
        &self.samples
    }

    /// Convolve the given curve with this kernel.
    ///
    /// The result has the same length as `curve`. Samples of the curve before
    /// index zero are treated as zero, which makes the convolution causal: the
    /// value at bin $k$ only depends on curve values at bins $\leq k$.
    pub fn convolve(&self, curve: &DVector<ScalarType>) -> DVector<ScalarType> {
        let mut convolved = DVector::zeros(curve.len());
        for k in 0..curve.len() {
            let mut acc = ScalarType::zero();
            for j in 0..=k.min(self.samples.len() - 1) {
                acc = acc + self.samples[j] * curve[k - j];
            }
            convolved[k] = acc;
        }
        convolved
    }
}
