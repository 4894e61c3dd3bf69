#![warn(missing_docs)]
//! a helper crate which carries common code used by the benchtests and the
//! integration tests.
use flimfit::mapping::GlobalLayout;
use flimfit::model::MultiExpDecay;
use flimfit::problem::{GlobalFitProblem, GlobalFitProblemBuilder};
use nalgebra::{DMatrix, DVector, Scalar};
use num_traits::Float;
use rand::Rng;
use rand_distr::{Distribution, Poisson};

/// create a uniform time grid with `count` elements starting at zero,
/// spaced by `x_inc`
pub fn time_grid<ScalarType: Float + Scalar>(
    x_inc: ScalarType,
    count: usize,
) -> DVector<ScalarType> {
    DVector::from_iterator(
        count,
        (0..count).map(|k| {
            x_inc * ScalarType::from(k).expect("Could not convert usize to Float")
        }),
    )
}

/// multiexponential decay f(t) = Z + sum_j A_j exp(-t/tau_j), with the
/// components given as `(amplitude, lifetime)` pairs
pub fn multi_exp_decay<ScalarType: Float + Scalar>(
    tvec: &DVector<ScalarType>,
    baseline: ScalarType,
    components: &[(ScalarType, ScalarType)],
) -> DVector<ScalarType> {
    tvec.map(|t| {
        components
            .iter()
            .fold(baseline, |sum, &(amplitude, tau)| {
                sum + amplitude * (-t / tau).exp()
            })
    })
}

/// a gaussian instrument response on the model time grid, centered at
/// `center` with the given full width at half maximum, normalized to unit sum
pub fn gaussian_irf(x_inc: f64, count: usize, center: f64, fwhm: f64) -> DVector<f64> {
    let sigma = fwhm / (2. * f64::sqrt(2. * f64::ln(2.)));
    let kernel = time_grid(x_inc, count).map(|t| {
        let arg = (t - center) / sigma;
        f64::exp(-0.5 * arg * arg)
    });
    let sum = kernel.sum();
    kernel / sum
}

/// draw a poisson distributed photon count for every element of the
/// expected curve. Panics if an expectation value is not strictly positive.
pub fn add_poisson_noise(expected: &DVector<f64>, rng: &mut impl Rng) -> DVector<f64> {
    expected.map(|lambda| {
        Poisson::new(lambda)
            .expect("Poisson expectation values must be positive")
            .sample(rng)
    })
}

/// A helper function that returns the standard single exponential test
/// problem: an ideal transient with baseline 0, amplitude 100 and lifetime
/// 2.0 on a grid of 64 bins spaced by 0.1, to be fitted from the given
/// initial guess for (Z, A, tau)
pub fn single_exponential_problem(
    initial_guess: &[f64; 3],
) -> GlobalFitProblem<MultiExpDecay<f64>> {
    let x_inc = 0.1;
    let n_data = 64;
    let transient = multi_exp_decay(&time_grid(x_inc, n_data), 0., &[(100., 2.)]);
    GlobalFitProblemBuilder::new(MultiExpDecay::new(1, x_inc, n_data))
        .transients(DMatrix::from_columns(&[transient]))
        .initial_guess(DVector::from_column_slice(initial_guess))
        .build()
        .expect("single exponential problem builder should produce a valid problem")
}

/// A helper function that returns a batch fitting problem with `n_trans`
/// ideal transients which share the lifetime 2.0 but have individual
/// amplitudes. The lifetime is declared global and the initial guesses are
/// deliberately off the true values.
pub fn shared_lifetime_batch_problem(n_trans: usize) -> GlobalFitProblem<MultiExpDecay<f64>> {
    let x_inc = 0.1;
    let n_data = 64;
    let tvec = time_grid(x_inc, n_data);

    let transients = DMatrix::from_columns(
        &(0..n_trans)
            .map(|s| multi_exp_decay(&tvec, 0., &[(amplitude_of(s), 2.)]))
            .collect::<Vec<_>>(),
    );
    let guesses = DMatrix::from_columns(
        &(0..n_trans)
            .map(|s| DVector::from_column_slice(&[1., 0.8 * amplitude_of(s), 1.5]))
            .collect::<Vec<_>>(),
    );

    GlobalFitProblemBuilder::new(MultiExpDecay::new(1, x_inc, n_data))
        .transients(transients)
        .initial_guesses(guesses)
        .layout(GlobalLayout::with_global(3, &[2]).expect("lifetime position must be in bounds"))
        .build()
        .expect("batch problem builder should produce a valid problem")
}

/// amplitude of the transient at the given batch slot in the shared
/// lifetime test problem
pub fn amplitude_of(slot: usize) -> f64 {
    50. + 10. * slot as f64
}
