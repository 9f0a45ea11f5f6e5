//! Event chain orchestration and the long-running worker processes.

pub mod chain;
pub mod detector;
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod worker;

pub use chain::EventChain;
pub use detector::FileDetector;
pub use error::{ChainError, WorkerError};
pub use handlers::{AnalysisRequestedHandler, FileDetectedHandler};
pub use pipeline::PipelineWorker;
pub use worker::{Exit, Worker, WorkerRunner};
