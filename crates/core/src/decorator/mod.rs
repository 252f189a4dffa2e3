//! Step-behavior decorators.
//!
//! Each decorator wraps an inner [`Step`](crate::step::Step) and exposes the
//! same capability surface, so the engine treats decorated and undecorated
//! steps identically. Composition happens at graph-build time, outside this
//! crate, in a fixed order: reporting (outermost), timeout, iteration
//! (innermost, closest to the concrete step).

mod iterative;
mod reporting;
mod timeout;
mod workflow;

pub use iterative::IterativeStep;
pub use reporting::ReportingStep;
pub use timeout::TimeoutStep;
pub use workflow::WorkflowStep;
