//! Supervised execution of the external analysis process.

pub mod error;
pub mod outcome;
pub mod supervisor;

pub use error::AnalysisError;
pub use outcome::{TaskOutcome, TaskStatus};
pub use supervisor::{resolve_executable, AnalysisRunner, TaskSupervisor};
