//! Domain models for the problem-list engine.

mod change_log;
mod encounter;
mod problem;
mod visit;

pub use change_log::*;
pub use encounter::*;
pub use problem::*;
pub use visit::*;

pub use problem_list_llm::{ChangeAction, DiagnosisCodeChange, ProblemChange};
