use crate::util::DiagMatrix;
use nalgebra::constraint::{SameNumberOfRows, ShapeConstraint};
use nalgebra::{DVector, Dim, Dyn, Matrix, RawStorageMut, RealField, Scalar};
use std::ops::Mul;

/// a variant for different weights that can be applied to a least squares problem
/// Right now covers only either unit weights (i.e. unweighted problem) or a diagonal
/// matrix for the weights. Can easily be extended in the future, because this structure
/// offers an interface for matrix-matrix multiplication and matrix-vector multiplication.
///
/// In this crate the diagonal entries are the reciprocals of the residual
/// variances, $w_k = 1/\sigma_k^2$, so that the weighted sum of squared
/// residuals is the familiar $\chi^2$ statistic. The weight matrix multiplies
/// residuals and jacobian rows when the normal equations are assembled.
#[derive(Debug, Clone, PartialEq)]
pub enum Weights<ScalarType>
where
    ScalarType: Scalar + RealField,
{
    /// unit weights, which means the problem is unweighted
    Unit,
    /// the weights are represented by a diagonal matrix
    Diagonal(DiagMatrix<ScalarType>),
}

impl<ScalarType> Weights<ScalarType>
where
    ScalarType: Scalar + RealField,
{
    /// create diagonal weights with the given diagonal elements of a matrix.
    /// The resulting diagonal matrix is a square matrix with the given diagonal
    /// elements and all off-diagonal elements set to zero
    /// Make sure that the dimensions of the weights match the data that they
    /// should be applied to
    pub fn diagonal(diagonal: DVector<ScalarType>) -> Self {
        Self::from(DiagMatrix::from(diagonal))
    }

    /// check that the weights are appropriately sized for the given data vector, so that
    /// they can be applied without panic. For unit weights this is always true, but for diagonal
    /// weights it is not.
    /// # Arguments
    /// * `data_len`: the number of elements in the data vector
    pub fn is_size_correct_for_data_length(&self, data_len: usize) -> bool {
        match self {
            Weights::Unit => true,
            Weights::Diagonal(diag) => diag.size() == data_len,
        }
    }

    /// The weighted sum of squared residuals $\chi^2 = \sum_k w_k r_k^2$.
    /// # Panics
    /// Panics if diagonal weights are not sized correctly for the residual vector.
    pub fn chisq(&self, residuals: &DVector<ScalarType>) -> ScalarType {
        match self {
            Weights::Unit => residuals
                .iter()
                .fold(ScalarType::zero(), |acc, r| acc + r.clone() * r.clone()),
            Weights::Diagonal(diag) => {
                assert_eq!(
                    diag.size(),
                    residuals.len(),
                    "Weight dimensions incorrect for chi square calculation."
                );
                diag.diagonal()
                    .iter()
                    .zip(residuals.iter())
                    .fold(ScalarType::zero(), |acc, (w, r)| {
                        acc + w.clone() * r.clone() * r.clone()
                    })
            }
        }
    }
}

/// Get a variant representing unit weights (i.e. unweighted problem)
impl<ScalarType> Default for Weights<ScalarType>
where
    ScalarType: Scalar + RealField,
{
    fn default() -> Self {
        Self::Unit
    }
}

/// create diagonal weights using the given diagonal matrix
impl<ScalarType> From<DiagMatrix<ScalarType>> for Weights<ScalarType>
where
    ScalarType: Scalar + RealField,
{
    fn from(diag: DiagMatrix<ScalarType>) -> Self {
        Self::Diagonal(diag)
    }
}

/// A convenience method that allows to multiply weights to a matrix from the left.
/// This performs the matrix multiplication corresponding to the weight matrix. However,
/// since the method knows e.g. if the weights are diagonal or unit it can take shortcuts
/// and make the operation more efficient. It is a no-op if the weights are unit.
/// # Panics
/// If the matrix matrix multiplication fails because of incorrect dimensions.
/// (unit weights never panic)
#[allow(non_snake_case)]
impl<ScalarType, R, C, S> Mul<Matrix<ScalarType, R, C, S>> for &Weights<ScalarType>
where
    ScalarType: Mul<ScalarType, Output = ScalarType> + Scalar + RealField,
    C: Dim,
    R: Dim,
    S: RawStorageMut<ScalarType, R, C>,
    ShapeConstraint: SameNumberOfRows<R, Dyn>,
{
    type Output = Matrix<ScalarType, R, C, S>;

    fn mul(self, rhs: Matrix<ScalarType, R, C, S>) -> Self::Output {
        match self {
            Weights::Unit => rhs,
            Weights::Diagonal(W) => W * rhs,
        }
    }
}

#[cfg(any(test, doctest))]
mod test {
    use crate::util::weights::Weights;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};

    #[test]
    #[allow(non_snake_case)]
    fn unit_weight_produce_correct_results_when_multiplied_to_matrix_or_vector() {
        let W = Weights::default();
        let v = DVector::from(vec![1., 3., 3., 7.]);
        let A = DMatrix::from_element(4, 4, 2.0);

        assert_eq!(&W * v.clone(), v);
        assert_eq!(&W * A.clone(), A);
    }

    #[test]
    #[allow(non_snake_case)]
    fn diagonal_weights_produce_correct_results_when_multiplied_to_matrix_or_vector() {
        let diagonal = DVector::from(vec![3., 78., 6., 5.]);
        let D = DMatrix::from_diagonal(&diagonal);
        let W = Weights::diagonal(diagonal);

        let v = DVector::from(vec![1., 3., 3., 7.]);
        let mut A = DMatrix::from_element(4, 2, 0.);
        A.set_column(0, &DVector::from(vec![32., 5., 86., 51.]));
        A.set_column(1, &DVector::from(vec![65., 46., 8., 85.]));

        assert_eq!(&D * &v, &W * v);
        assert_eq!(&D * &A, &W * A);
    }

    #[test]
    fn chisq_is_the_weighted_sum_of_squared_residuals() {
        let residuals = DVector::from(vec![1., -2., 3.]);

        let unit = Weights::default();
        assert_relative_eq!(unit.chisq(&residuals), 14.);

        let weighted = Weights::diagonal(DVector::from(vec![0.5, 2., 0.1]));
        assert_relative_eq!(weighted.chisq(&residuals), 0.5 + 8. + 0.9);
    }

    #[test]
    fn size_check_accepts_unit_weights_and_correctly_sized_diagonals() {
        let unit = Weights::<f64>::default();
        assert!(unit.is_size_correct_for_data_length(17));

        let weighted = Weights::diagonal(DVector::from(vec![1., 2., 3.]));
        assert!(weighted.is_size_correct_for_data_length(3));
        assert!(!weighted.is_size_correct_for_data_length(4));
    }
}
