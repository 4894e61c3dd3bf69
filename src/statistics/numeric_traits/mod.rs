/// A helper trait for floating point numbers that can be cast to and from
/// f64. This is only implemented for f32 and f64. It bridges the generic
/// scalar type of a fit to the f64-only distribution functions used for
/// confidence intervals. Casting f64 into f32 is typically associated with
/// a loss of precision.
pub trait CastF64 {
    /// make an f64 into a value of this type
    fn from_f64(value: f64) -> Self;

    /// make a value of this type into an f64
    fn into_f64(self) -> f64;
}

impl CastF64 for f64 {
    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }

    #[inline]
    fn into_f64(self) -> Self {
        self
    }
}

impl CastF64 for f32 {
    #[inline]
    fn from_f64(value: f64) -> Self {
        value as _
    }

    #[inline]
    fn into_f64(self) -> f64 {
        self as _
    }
}
