use approx::assert_relative_eq;
use assert_matches::assert_matches;
use flimfit::prelude::*;
use flimfit::problem::Restraints;
use flimfit::solvers::marquardt::FitError;
use nalgebra::DMatrix;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared_test_code::add_poisson_noise;
use shared_test_code::amplitude_of;
use shared_test_code::gaussian_irf;
use shared_test_code::multi_exp_decay;
use shared_test_code::shared_lifetime_batch_problem;
use shared_test_code::single_exponential_problem;
use shared_test_code::time_grid;
use std::sync::atomic::AtomicBool;

#[test]
fn single_exponential_fitting_without_noise_produces_accurate_results() {
    let problem = single_exponential_problem(&[5., 80., 1.5]);

    let result = MarquardtSolver::new()
        .fit(&problem)
        .expect("fit must complete successfully");

    assert!(result.all_converged(), "fit did not converge");
    assert!(result.iterations() >= 1);
    // one transient of 64 bins, three free parameters
    assert_eq!(result.degrees_of_freedom(), 61);
    assert!(result.chisq_global() < 1e-6);
    assert_relative_eq!(
        result.reduced_chisq_global(),
        result.chisq_global() / 61.
    );

    let params = result
        .transient(0)
        .parameters()
        .expect("parameter output must be on by default");
    assert_relative_eq!(params[0], 0., epsilon = 1e-3);
    assert_relative_eq!(params[1], 100., max_relative = 1e-3);
    assert_relative_eq!(params[2], 2., max_relative = 1e-3);
}

#[test]
fn double_exponential_fitting_without_noise_produces_accurate_results() {
    let x_inc = 0.05;
    let n_data = 256;
    // true parameters (Z, A1, tau1, A2, tau2)
    let transient = multi_exp_decay(&time_grid(x_inc, n_data), 1., &[(80., 3.), (20., 0.5)]);

    let problem = GlobalFitProblemBuilder::new(MultiExpDecay::new(2, x_inc, n_data))
        .transients(DMatrix::from_columns(&[transient]))
        .initial_guess(DVector::from_column_slice(&[0.8, 70., 2.5, 25., 0.6]))
        .build()
        .expect("building a valid problem must not fail");

    let result = MarquardtSolver::new()
        .fit(&problem)
        .expect("fit must complete successfully");

    assert!(result.all_converged(), "fit did not converge");
    assert!(result.chisq_global() < 1e-8);
    let params = result.transient(0).parameters().expect("parameters must be present");
    assert_relative_eq!(params[0], 1., max_relative = 1e-3);
    assert_relative_eq!(params[1], 80., max_relative = 1e-3);
    assert_relative_eq!(params[2], 3., max_relative = 1e-3);
    assert_relative_eq!(params[3], 20., max_relative = 1e-3);
    assert_relative_eq!(params[4], 0.5, max_relative = 1e-3);
}

#[test]
fn fitting_convolved_transients_recovers_parameters_through_the_instrument_response() {
    let x_inc = 0.1;
    let n_data = 64;
    let kernel = InstrumentResponse::new(gaussian_irf(x_inc, n_data, 0.8, 0.4))
        .expect("gaussian kernel must be a valid instrument response");
    let model = MultiExpDecay::new(1, x_inc, n_data).with_instrument_response(kernel);

    let truth = DVector::from_column_slice(&[0., 100., 2.]);
    let transient = model.eval(&truth).expect("model eval must not fail");

    let problem = GlobalFitProblemBuilder::new(model)
        .transients(DMatrix::from_columns(&[transient]))
        .initial_guess(DVector::from_column_slice(&[2., 70., 1.4]))
        .build()
        .expect("building a valid problem must not fail");

    let result = MarquardtSolver::new()
        .fit(&problem)
        .expect("fit must complete successfully");

    assert!(result.all_converged(), "fit did not converge");
    let params = result.transient(0).parameters().expect("parameters must be present");
    assert_relative_eq!(params[0], 0., epsilon = 1e-3);
    assert_relative_eq!(params[1], 100., max_relative = 1e-3);
    assert_relative_eq!(params[2], 2., max_relative = 1e-3);
}

#[test]
fn a_fit_window_excludes_corrupted_bins_from_the_fit() {
    let x_inc = 0.1;
    let n_data = 64;
    let mut transient: DVector<f64> = multi_exp_decay(&time_grid(x_inc, n_data), 0., &[(100., 2.)]);
    // scatter spike before the window, detector gating artifact after it
    for k in 0..4 {
        transient[k] += 500.;
    }
    for k in 60..64 {
        transient[k] = 0.;
    }

    let problem = GlobalFitProblemBuilder::new(MultiExpDecay::new(1, x_inc, n_data))
        .transients(DMatrix::from_columns(&[transient.clone()]))
        .fit_window(4, 60)
        .initial_guess(DVector::from_column_slice(&[5., 80., 1.5]))
        .build()
        .expect("building a valid problem must not fail");

    let result = MarquardtSolver::new()
        .with_fitted_output(true)
        .with_residual_output(true)
        .fit(&problem)
        .expect("fit must complete successfully");

    assert!(result.all_converged(), "fit did not converge");
    assert_eq!(result.degrees_of_freedom(), 56 - 3);
    let params = result.transient(0).parameters().expect("parameters must be present");
    assert_relative_eq!(params[1], 100., max_relative = 1e-3);
    assert_relative_eq!(params[2], 2., max_relative = 1e-3);

    // fitted curves and residuals cover the full time range, so the
    // corrupted bins show up as large residuals
    let fitted = result.transient(0).fitted().expect("fitted output was requested");
    let residuals = result.transient(0).residuals().expect("residual output was requested");
    assert_eq!(fitted.len(), n_data);
    assert_eq!(residuals.len(), n_data);
    assert!(residuals[0] > 100.);
    assert!(residuals[30].abs() < 1e-3);
    assert_relative_eq!(residuals[0], transient[0] - fitted[0]);
}

#[test]
fn poisson_noise_fits_recover_the_lifetime_within_tolerance() {
    let x_inc = 0.05;
    let n_data = 256;
    let expected = multi_exp_decay(&time_grid(x_inc, n_data), 10., &[(5000., 2.)]);
    let mut rng = StdRng::seed_from_u64(0xf117);
    let counts = add_poisson_noise(&expected, &mut rng);

    let problem = GlobalFitProblemBuilder::new(MultiExpDecay::new(1, x_inc, n_data))
        .transients(DMatrix::from_columns(&[counts]))
        .initial_guess(DVector::from_column_slice(&[5., 4000., 1.5]))
        .noise(NoiseModel::Poisson)
        .build()
        .expect("building a valid problem must not fail");

    let result = MarquardtSolver::new()
        .fit(&problem)
        .expect("fit must complete successfully");

    assert!(result.all_converged(), "fit did not converge");
    let params = result.transient(0).parameters().expect("parameters must be present");
    assert_relative_eq!(params[1], 5000., max_relative = 2e-2);
    assert_relative_eq!(params[2], 2., max_relative = 2e-2);
    // with per-bin poisson variances the reduced chi square must come out
    // near one
    let reduced = result.reduced_chisq_global();
    assert!(
        reduced > 0.7 && reduced < 1.4,
        "reduced chi square {} is not close to one",
        reduced
    );
}

#[test]
fn global_fitting_with_a_shared_lifetime_recovers_all_amplitudes() {
    let n_trans = 8;
    let problem = shared_lifetime_batch_problem(n_trans);

    let result = MarquardtSolver::new()
        .fit(&problem)
        .expect("fit must complete successfully");

    assert!(result.all_converged(), "fit did not converge");
    assert_eq!(result.len(), n_trans);
    // one shared lifetime plus a baseline and an amplitude per transient
    assert_eq!(result.degrees_of_freedom(), n_trans * 64 - (1 + 2 * n_trans));

    let shared_tau = result.transient(0).parameters().expect("parameters must be present")[2];
    assert_relative_eq!(shared_tau, 2., max_relative = 1e-3);
    for (slot, fit) in result.transients().iter().enumerate() {
        let params = fit.parameters().expect("parameters must be present");
        // the global lifetime is the same entry of the reduced vector for
        // every transient
        assert_eq!(params[2], shared_tau);
        assert_relative_eq!(params[0], 0., epsilon = 1e-3);
        assert_relative_eq!(params[1], amplitude_of(slot), max_relative = 1e-3);
    }
}

#[test]
fn a_shared_lifetime_settles_between_disagreeing_transients() {
    let x_inc = 0.1;
    let n_data = 64;
    let tvec = time_grid(x_inc, n_data);
    // the transients have genuinely different lifetimes, so a shared fit
    // cannot reach both and must settle on a compromise in between
    let fast = multi_exp_decay(&tvec, 0., &[(100., 1.5)]);
    let slow = multi_exp_decay(&tvec, 0., &[(100., 2.5)]);
    let guess = DVector::from_column_slice(&[0.5, 90., 2.]);
    let solver = MarquardtSolver::new();

    let mut independent_taus = Vec::new();
    let mut independent_chisq = 0.;
    for transient in [fast.clone(), slow.clone()] {
        let problem = GlobalFitProblemBuilder::new(MultiExpDecay::new(1, x_inc, n_data))
            .transients(DMatrix::from_columns(&[transient]))
            .initial_guess(guess.clone())
            .build()
            .expect("building a valid problem must not fail");
        let result = solver.fit(&problem).expect("fit must complete successfully");
        assert!(result.all_converged(), "fit did not converge");
        independent_taus.push(result.transient(0).parameters().unwrap()[2]);
        independent_chisq += result.chisq_global();
    }
    assert_relative_eq!(independent_taus[0], 1.5, max_relative = 1e-3);
    assert_relative_eq!(independent_taus[1], 2.5, max_relative = 1e-3);

    let joint = GlobalFitProblemBuilder::new(MultiExpDecay::new(1, x_inc, n_data))
        .transients(DMatrix::from_columns(&[fast, slow]))
        .initial_guess(guess)
        .layout(GlobalLayout::with_global(3, &[2]).expect("lifetime position must be in bounds"))
        .build()
        .expect("building a valid problem must not fail");
    let result = solver.fit(&joint).expect("fit must complete successfully");
    assert!(result.all_converged(), "fit did not converge");

    // the joint fit lands strictly between the individual lifetimes and
    // pays for the disagreement in summed chi square
    let shared_tau = result.transient(0).parameters().unwrap()[2];
    assert!(
        shared_tau > 1.55 && shared_tau < 2.45,
        "shared lifetime {} did not compromise between 1.5 and 2.5",
        shared_tau
    );
    assert!(result.chisq_global() > independent_chisq + 1.);
}

#[test]
fn all_local_joint_fits_match_fitting_each_transient_independently() {
    let x_inc = 0.1;
    let n_data = 64;
    let tvec = time_grid(x_inc, n_data);
    let first = multi_exp_decay(&tvec, 0., &[(120., 1.2)]);
    let second = multi_exp_decay(&tvec, 0., &[(60., 3.)]);
    let guess = DVector::from_column_slice(&[2., 100., 2.]);

    let batch = GlobalFitProblemBuilder::new(MultiExpDecay::new(1, x_inc, n_data))
        .transients(DMatrix::from_columns(&[first.clone(), second.clone()]))
        .initial_guess(guess.clone())
        .build()
        .expect("building a valid problem must not fail");

    let solver = MarquardtSolver::new();
    let batch_result = solver.fit(&batch).expect("fit must complete successfully");
    assert!(batch_result.all_converged(), "fit did not converge");

    for (slot, transient) in [first, second].into_iter().enumerate() {
        let single = GlobalFitProblemBuilder::new(MultiExpDecay::new(1, x_inc, n_data))
            .transients(DMatrix::from_columns(&[transient]))
            .initial_guess(guess.clone())
            .build()
            .expect("building a valid problem must not fail");
        let single_result = solver.fit(&single).expect("fit must complete successfully");

        // without shared parameters the transients are fitted one at a
        // time, so the batch fit must reproduce the individual fits
        assert_relative_eq!(
            batch_result.transient(slot).parameters().unwrap().clone_owned(),
            single_result.transient(0).parameters().unwrap().clone_owned(),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            batch_result.transient(slot).chisq(),
            single_result.chisq_global(),
            epsilon = 1e-12
        );
    }
}

#[test]
fn batch_fitting_returns_the_same_results_as_sequential_fits() {
    let problems = vec![
        shared_lifetime_batch_problem(4),
        single_exponential_problem(&[5., 80., 1.5]),
    ];

    let solver = MarquardtSolver::new();
    let parallel = solver.fit_batches(&problems);
    assert_eq!(parallel.len(), problems.len());

    for (result, problem) in parallel.iter().zip(problems.iter()) {
        let result = result.as_ref().expect("batch fit must complete successfully");
        let expected = solver.fit(problem).expect("fit must complete successfully");
        assert_eq!(result.iterations(), expected.iterations());
        assert_relative_eq!(result.chisq_global(), expected.chisq_global());
        for (fit, expected_fit) in result.transients().iter().zip(expected.transients()) {
            assert_relative_eq!(
                fit.parameters().unwrap().clone_owned(),
                expected_fit.parameters().unwrap().clone_owned()
            );
        }
    }
}

#[test]
fn a_preset_cancellation_token_aborts_the_fit_immediately() {
    let problem = single_exponential_problem(&[5., 80., 1.5]);
    let cancel = AtomicBool::new(true);

    let error = MarquardtSolver::new()
        .fit_with_cancellation(&problem, &cancel)
        .expect_err("a preset token must cancel the fit");
    assert_matches!(error, FitError::Cancelled);
}

#[test]
fn clamping_restraints_pin_the_lifetime_onto_the_feasible_box() {
    let x_inc = 0.1;
    let n_data = 64;
    // the true lifetime of 2.0 lies outside the feasible box, so the fit
    // must pin it onto the upper bound
    let transient = multi_exp_decay(&time_grid(x_inc, n_data), 0., &[(100., 2.)]);
    let restraints = Restraints::clamping(
        DVector::from_column_slice(&[-1e3, 0., 0.1]),
        DVector::from_column_slice(&[1e3, 1e3, 1.]),
    );

    let problem = GlobalFitProblemBuilder::new(MultiExpDecay::new(1, x_inc, n_data))
        .transients(DMatrix::from_columns(&[transient]))
        .initial_guess(DVector::from_column_slice(&[0., 90., 0.8]))
        .restraints(restraints)
        .build()
        .expect("building a valid problem must not fail");

    let result = MarquardtSolver::new()
        .fit(&problem)
        .expect("fit must complete successfully");

    assert_matches!(result.transient(0).status(), FitStatus::Converged);
    let tau = result.transient(0).parameters().expect("parameters must be present")[2];
    assert!(
        tau > 0.99 && tau <= 1. + 1e-12,
        "lifetime {} was not pinned onto the box",
        tau
    );
}

#[test]
fn fit_with_statistics_quantifies_the_parameter_uncertainties() {
    let x_inc = 0.05;
    let n_data = 256;
    let expected = multi_exp_decay(&time_grid(x_inc, n_data), 10., &[(5000., 2.)]);
    let mut rng = StdRng::seed_from_u64(0xacc4);
    let counts = add_poisson_noise(&expected, &mut rng);

    let problem = GlobalFitProblemBuilder::new(MultiExpDecay::new(1, x_inc, n_data))
        .transients(DMatrix::from_columns(&[counts]))
        .initial_guess(DVector::from_column_slice(&[5., 4000., 1.5]))
        .noise(NoiseModel::Poisson)
        .build()
        .expect("building a valid problem must not fail");

    let (result, statistics) = MarquardtSolver::new()
        .fit_with_statistics(&problem)
        .expect("fit must complete successfully");

    assert!(result.all_converged(), "fit did not converge");
    assert_eq!(statistics.degrees_of_freedom(), result.degrees_of_freedom());
    assert_eq!(statistics.covariance_matrix().nrows(), 3);
    assert_eq!(statistics.covariance_matrix().ncols(), 3);

    let variances = statistics.parameter_variances();
    assert!(variances.iter().all(|&variance| variance > 0.));

    // the 95% confidence radius scales the standard errors with the t
    // quantile, which is close to 1.97 for this many degrees of freedom
    let radius = statistics.confidence_radius(0.95);
    for k in 0..3 {
        let sigma = f64::sqrt(variances[k]);
        assert!(radius[k] > 1.9 * sigma && radius[k] < 2. * sigma);
    }

    let correlation = statistics.calculate_correlation_matrix();
    for k in 0..3 {
        assert_relative_eq!(correlation[(k, k)], 1., epsilon = 1e-12);
    }
    assert_relative_eq!(
        statistics.regression_standard_error(),
        f64::sqrt(statistics.reduced_chisq())
    );
}

#[test]
fn noise_models_scale_the_chi_square_accordingly() {
    let x_inc = 0.1;
    let n_data = 64;
    let truth = DVector::from_column_slice(&[0., 100., 2.]);
    let model = MultiExpDecay::new(1, x_inc, n_data);
    // offset data by one count per bin and keep all parameters fixed, so
    // the fit leaves a residual of exactly one everywhere
    let transient = model.eval(&truth).expect("model eval must not fail")
        + DVector::from_element(n_data, 1.);

    let chisq_of = |noise: NoiseModel<f64>| {
        let problem = GlobalFitProblemBuilder::new(MultiExpDecay::new(1, x_inc, n_data))
            .transients(DMatrix::from_columns(&[transient.clone()]))
            .initial_guess(truth.clone())
            .free_mask(vec![false, false, false])
            .noise(noise)
            .build()
            .expect("building a valid problem must not fail");
        let result = MarquardtSolver::new()
            .fit(&problem)
            .expect("fit must complete successfully");
        assert_eq!(result.iterations(), 0);
        result.chisq_global()
    };

    assert_relative_eq!(chisq_of(NoiseModel::Unweighted), 64., epsilon = 1e-9);
    assert_relative_eq!(chisq_of(NoiseModel::Const(2.)), 16., epsilon = 1e-9);
    assert_relative_eq!(
        chisq_of(NoiseModel::Given(DVector::from_element(n_data, 2.))),
        16.,
        epsilon = 1e-9
    );
}
