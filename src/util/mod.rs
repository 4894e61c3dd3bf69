use nalgebra::constraint::{SameNumberOfRows, ShapeConstraint};
use nalgebra::{DVector, Dim, Dyn, Matrix, RawStorageMut, RealField, Scalar};
use std::ops::Mul;

mod weights;
pub use weights::Weights;

/// A square diagonal matrix with dynamic dimension. Off-diagonal entries are
/// assumed zero. This internally stores only the diagonal elements.
/// # Types
/// ScalarType: the numeric type of the matrix
#[derive(Debug, Clone, PartialEq)]
pub struct DiagMatrix<ScalarType>
where
    ScalarType: Scalar + RealField,
{
    diagonal: DVector<ScalarType>,
}

impl<ScalarType> DiagMatrix<ScalarType>
where
    ScalarType: Scalar + RealField,
{
    /// get the number of columns of the matrix
    /// The matrix is square, so this is equal to the number of rows
    pub fn ncols(&self) -> usize {
        self.size()
    }

    /// get the number of rows of the matrix
    /// The matrix is square, so this is equal to the number of columns
    pub fn nrows(&self) -> usize {
        self.size()
    }

    /// the size (i.e. number of rows == number of cols) of this square matrix
    pub fn size(&self) -> usize {
        self.diagonal.len()
    }

    /// the diagonal elements of this matrix
    pub fn diagonal(&self) -> &DVector<ScalarType> {
        &self.diagonal
    }
}

/// Generate a square diagonal matrix from the given diagonal vector.
impl<ScalarType> From<DVector<ScalarType>> for DiagMatrix<ScalarType>
where
    ScalarType: Scalar + RealField,
{
    fn from(diagonal: DVector<ScalarType>) -> Self {
        Self { diagonal }
    }
}

/// Multiply this diagonal matrix from the left to a dynamically sized matrix.
/// # Panics
/// Panics if the dimensions of the matrices do not fit for matrix multiplication
/// # Result
/// The result of the matrix multiplication as a new dynamically sized matrix
impl<ScalarType, R, C, S> Mul<Matrix<ScalarType, R, C, S>> for &DiagMatrix<ScalarType>
where
    ScalarType: Mul<ScalarType, Output = ScalarType> + Scalar + RealField,
    C: Dim,
    R: Dim,
    S: RawStorageMut<ScalarType, R, C>,
    ShapeConstraint: SameNumberOfRows<R, Dyn>,
{
    type Output = Matrix<ScalarType, R, C, S>;

    fn mul(self, mut rhs: Matrix<ScalarType, R, C, S>) -> Self::Output {
        assert_eq!(
            self.ncols(),
            rhs.nrows(),
            "Matrix dimensions incorrect for diagonal matrix multiplication."
        );
        rhs.column_iter_mut()
            .for_each(|mut col| col.component_mul_assign(&self.diagonal));
        rhs
    }
}
