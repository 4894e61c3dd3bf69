pub use crate::fit::FailureReason;
pub use crate::fit::FitResult;
pub use crate::fit::FitStatus;
pub use crate::fit::TransientFit;
pub use crate::irf::InstrumentResponse;
pub use crate::mapping::GlobalLayout;
pub use crate::model::DecayModel;
pub use crate::model::MultiExpDecay;
pub use crate::noise::NoiseModel;
pub use crate::problem::GlobalFitProblemBuilder;
pub use crate::solvers::marquardt::MarquardtSolver;
