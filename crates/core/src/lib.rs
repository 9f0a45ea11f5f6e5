pub mod config;
pub mod error;
pub mod events;
pub mod file_type;

pub use config::Config;
pub use error::ConfigError;
pub use events::{
    AnalysisCompleted, AnalysisRequested, AnalysisStatus, Event, EventKind, FileDetected,
};
pub use file_type::SupportedFileTypes;
