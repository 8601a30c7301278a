//! Structured query model and execution planning (spec §4.4, §4.6, §4.7).
//!
//! Grounded on the *pattern* of the adjacent `neuroquantum-qsql` repo's
//! `optimizer.rs`/`query_plan.rs` (classify input → score cost → build a
//! plan → execute against the chosen storage) but no SQL text is parsed
//! here: `analyzer` classifies a structured [`spec::QuerySpec`] directly,
//! since a SQL front end is an explicit Non-goal.

pub mod analyzer;
pub mod plan;
pub mod spec;

pub use analyzer::{classify, Classification};
pub use plan::{ExecutionPlan, Strategy};
pub use spec::*;
