//! Fraud decision replay
//!
//! Recovers decision requests captured in service logs and replays them against the
//! fraud decision service, AF1001 before AF1002, to repair results that were never
//! applied downstream.

pub mod config;
pub mod errors;
pub mod orchestrator;
pub mod replay;

pub use config::{ClientConfig, ExtractionConfig, PoolConfig, ReplayConfig};
pub use errors::{PayloadParseError, ReplayError, RequestError};
pub use orchestrator::{run, run_with_service, RunContext, RunSummary, ScanStats};
