//! Vetting and running untrusted submissions.
//!
//! A submission passes through three stages: [`SourceAuditor`] rejects known
//! escape patterns without running anything, [`RestrictedRuntime`] runs the
//! definitions once on a dedicated execution unit, and [`Grader`] evaluates
//! each test expression against the resulting [`ExecutionContext`].
//!
//! Submissions run on an embedded RustPython interpreter whose builtins are
//! cut down to a whitelist and whose only importable module is `math`.

mod audit;
mod grader;
pub(crate) mod meter;
mod python;
mod runtime;

pub use audit::{AuditVerdict, SourceAuditor};
pub use grader::{Grader, GradingResult, TestOutcome};
pub use runtime::{EvalError, ExecutionContext, RestrictedRuntime};

use thiserror::Error;

/// The definition pass of a submission failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct CompilationFailure {
    pub reason: String,
}

/// An exercise whose test cases and solutions do not line up
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{tests} test cases but {expected} solutions")]
pub struct ConfigurationError {
    pub tests: usize,
    pub expected: usize,
}

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error(transparent)]
    Compilation(#[from] CompilationFailure),
    #[error("failed to start execution unit")]
    Spawn(#[source] std::io::Error),
    #[error("execution unit stopped during the definition pass")]
    UnitStopped,
}
