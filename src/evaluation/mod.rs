//! Evaluation: skip policy, oracle context and the bounded evaluation pool.

mod context;
mod orchestrator;
pub mod policy;

pub use context::ContextBuilder;
pub use orchestrator::{EvaluationOrchestrator, EvaluationOutcome, EvaluationRunSummary};
pub use policy::{Decision, EvaluationPolicy, SkipReason};
