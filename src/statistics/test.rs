use super::*;
use crate::mapping::GlobalLayout;
use crate::model::MultiExpDecay;
use crate::problem::GlobalFitProblemBuilder;
use approx::assert_relative_eq;
use assert_matches::assert_matches;
use nalgebra::{DMatrix, DVector, Dyn};

#[test]
fn correlation_matrix_is_calculated_correctly_from_a_covariance_matrix() {
    // covariance matrix
    let cov = DMatrix::from_row_slice(2, 2, &[2., 3., 4., 5.]);
    // correlation matrix
    let corr = DMatrix::from_row_slice(2, 2, &[1.0, 3. / f64::sqrt(10.), 4. / f64::sqrt(10.), 1.0]);
    let calc = calc_correlation_matrix(&cov);
    assert_relative_eq!(corr, calc);
}

/// a single-curve problem whose transient is the exact model curve at the
/// given parameters
fn exact_problem(
    n_data: usize,
    parameters: &DVector<f64>,
    free_mask: Vec<bool>,
) -> crate::problem::GlobalFitProblem<MultiExpDecay<f64>> {
    let model = MultiExpDecay::new(1, 0.05, n_data);
    let curve = model.eval(parameters).expect("model eval must not fail");
    GlobalFitProblemBuilder::new(model)
        .transients(curve.reshape_generic(Dyn(n_data), Dyn(1)))
        .initial_guess(parameters.clone())
        .free_mask(free_mask)
        .build()
        .expect("building a valid problem must not fail")
}

#[test]
fn statistics_require_free_parameters() {
    let parameters = DVector::from_column_slice(&[1., 50., 2.]);
    let problem = exact_problem(16, &parameters, vec![false, false, false]);
    let mapper = GlobalParameterMapper::new(problem.layout(), problem.free_mask(), 1);

    let result =
        FitStatistics::try_calculate(&problem, &mapper, &[parameters], 1., 16);
    assert_matches!(result, Err(StatisticsError::NoFreeParameters));
}

#[test]
fn statistics_reject_underdetermined_fits() {
    let parameters = DVector::from_column_slice(&[1., 50., 2.]);
    let problem = exact_problem(2, &parameters, vec![true, true, true]);
    let mapper = GlobalParameterMapper::new(problem.layout(), problem.free_mask(), 1);

    let result =
        FitStatistics::try_calculate(&problem, &mapper, &[parameters], 1., 1);
    assert_matches!(
        result,
        Err(StatisticsError::Underdetermined {
            observations: 2,
            fitted_parameters: 3
        })
    );
}

#[test]
fn a_parameter_without_influence_makes_the_normal_matrix_singular() {
    // with a zero amplitude the lifetime has no effect on the curve
    let parameters = DVector::from_column_slice(&[1., 0., 2.]);
    let problem = exact_problem(32, &parameters, vec![false, false, true]);
    let mapper = GlobalParameterMapper::new(problem.layout(), problem.free_mask(), 1);

    let result =
        FitStatistics::try_calculate(&problem, &mapper, &[parameters], 1., 31);
    assert_matches!(result, Err(StatisticsError::SingularNormalMatrix));
}

#[test]
fn covariance_is_the_scaled_inverse_of_the_normal_matrix() {
    let parameters = DVector::from_column_slice(&[0.5, 40., 1.5]);
    let problem = exact_problem(32, &parameters, vec![true, true, true]);
    let mapper = GlobalParameterMapper::new(problem.layout(), problem.free_mask(), 1);
    let chisq = 3.2;
    let dof = 32 - 3;

    let stats =
        FitStatistics::try_calculate(&problem, &mapper, &[parameters.clone()], chisq, dof)
            .expect("statistics calculation must not fail");

    // assemble the unweighted normal matrix by hand from the model derivatives
    let mut jacobian = DMatrix::zeros(32, 3);
    for (col, position) in mapper.free_positions().enumerate() {
        let deriv = problem
            .model()
            .eval_partial_deriv(&parameters, position)
            .expect("derivative eval must not fail");
        jacobian.set_column(col, &deriv);
    }
    let normal = jacobian.tr_mul(&jacobian);
    let reduced_chisq = chisq / dof as f64;
    let expected_cov = normal.try_inverse().expect("normal matrix must be invertible")
        * reduced_chisq;

    assert_relative_eq!(*stats.covariance_matrix(), expected_cov, epsilon = 1e-10);
    assert_relative_eq!(stats.reduced_chisq(), reduced_chisq);
    assert_relative_eq!(stats.regression_standard_error(), reduced_chisq.sqrt());
    assert_eq!(stats.degrees_of_freedom(), dof);
    for index in 0..3 {
        assert_relative_eq!(
            stats.parameter_variances()[index],
            expected_cov[(index, index)],
            epsilon = 1e-12
        );
    }
}

#[test]
fn confidence_radius_scales_the_standard_errors_with_the_t_quantile() {
    let parameters = DVector::from_column_slice(&[0.5, 40., 1.5]);
    let problem = exact_problem(32, &parameters, vec![true, true, true]);
    let mapper = GlobalParameterMapper::new(problem.layout(), problem.free_mask(), 1);

    let stats = FitStatistics::try_calculate(&problem, &mapper, &[parameters], 3.2, 29)
        .expect("statistics calculation must not fail");
    let radius = stats.confidence_radius(0.95);
    let variances = stats.parameter_variances();

    // the two-sided 95% t quantile for 29 degrees of freedom is about 2.045
    for index in 0..3 {
        let quantile = radius[index] / variances[index].sqrt();
        assert!(
            quantile > 2.0 && quantile < 2.1,
            "quantile {} out of range",
            quantile
        );
    }
}

#[test]
#[should_panic]
fn confidence_radius_panics_for_probabilities_outside_the_unit_interval() {
    let parameters = DVector::from_column_slice(&[0.5, 40., 1.5]);
    let problem = exact_problem(32, &parameters, vec![true, true, true]);
    let mapper = GlobalParameterMapper::new(problem.layout(), problem.free_mask(), 1);
    let stats = FitStatistics::try_calculate(&problem, &mapper, &[parameters], 3.2, 29)
        .expect("statistics calculation must not fail");
    let _ = stats.confidence_radius(1.5);
}

#[test]
fn batch_statistics_cover_the_whole_reduced_space() {
    let n_data = 24;
    let model = MultiExpDecay::new(1, 0.1, n_data);
    let p0 = DVector::from_column_slice(&[0.2, 30., 2.0]);
    let p1 = DVector::from_column_slice(&[0.4, 60., 2.0]);
    let c0 = model.eval(&p0).expect("model eval must not fail");
    let c1 = model.eval(&p1).expect("model eval must not fail");
    let layout = GlobalLayout::with_global(3, &[2]).expect("valid layout must not fail");
    let problem = GlobalFitProblemBuilder::new(model)
        .transients(DMatrix::from_columns(&[c0, c1]))
        .initial_guesses(DMatrix::from_columns(&[p0.clone(), p1.clone()]))
        .layout(layout)
        .build()
        .expect("building a valid problem must not fail");
    let mapper = GlobalParameterMapper::new(problem.layout(), problem.free_mask(), 2);

    let dof = 2 * n_data - (1 + 2 * 2);
    let stats = FitStatistics::try_calculate(&problem, &mapper, &[p0, p1], 4.2, dof)
        .expect("statistics calculation must not fail");

    // one shared lifetime plus offset and amplitude per transient
    assert_eq!(stats.covariance_matrix().nrows(), 5);
    assert_eq!(stats.covariance_matrix().ncols(), 5);
    let correlation = stats.calculate_correlation_matrix();
    for index in 0..5 {
        assert_relative_eq!(correlation[(index, index)], 1.0, epsilon = 1e-12);
    }
}
