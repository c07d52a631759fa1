//! Job orchestration: orchestrator, progress channel, report store

pub mod channel;
pub mod orchestrator;
pub mod store;

pub use channel::ProgressChannel;
pub use orchestrator::Orchestrator;
pub use store::{ReportStore, StoreError};
