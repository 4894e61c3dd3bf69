//! This module includes helper functionality that is useful for testing across all modules

use crate::model::{DecayModel, MultiExpDecay};
use nalgebra::DVector;

/// evaluate the closed form multiexponential decay
/// ```math
/// f(t) = Z + \sum_j A_j \exp(-t/\tau_j)
/// ```
/// on a uniform time grid with the given increment. The components are
/// given as `(amplitude, lifetime)` pairs.
///
/// # Panics
/// Panics if any lifetime is not strictly positive.
pub fn reference_decay(
    baseline: f64,
    components: &[(f64, f64)],
    x_inc: f64,
    n_data: usize,
) -> DVector<f64> {
    for &(_, tau) in components {
        assert!(tau > 0f64, "Parameter tau must be greater than zero");
    }
    DVector::from_fn(n_data, |k, _| {
        let t = k as f64 * x_inc;
        baseline
            + components
                .iter()
                .map(|&(amplitude, tau)| amplitude * f64::exp(-t / tau))
                .sum::<f64>()
    })
}

/// evaluate the central difference quotient of the model curve with respect
/// to the parameter at the given index
pub fn numerical_deriv(
    model: &MultiExpDecay<f64>,
    parameters: &DVector<f64>,
    index: usize,
    step: f64,
) -> DVector<f64> {
    let mut upper = parameters.clone();
    upper[index] += step;
    let mut lower = parameters.clone();
    lower[index] -= step;
    let diff = model.eval(&upper).expect("eval at upper params must not fail")
        - model.eval(&lower).expect("eval at lower params must not fail");
    diff / (2. * step)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn reference_decay_evaluates_the_closed_form() {
        let curve = reference_decay(2., &[(10., 1.), (5., 0.5)], 0.5, 4);
        assert_eq!(curve.len(), 4);
        assert_relative_eq!(curve[0], 17.);
        assert_relative_eq!(
            curve[2],
            2. + 10. * f64::exp(-1.) + 5. * f64::exp(-2.),
            epsilon = 1e-12
        );
    }

    #[test]
    #[should_panic]
    fn reference_decay_panics_on_nonpositive_lifetimes() {
        let _ = reference_decay(0., &[(10., -1.)], 0.1, 8);
    }
}
