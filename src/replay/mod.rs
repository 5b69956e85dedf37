//! Extraction and prioritized replay engine
//!
//! - `extract`: finds captured request payloads in raw log text
//! - `classify`: parses payloads and keeps the last record per identity and flow point
//! - `scheduler`: replays flow points in priority order on a bounded worker pool
//! - `client`: one POST per record against the decision service
//! - `counters`: run-wide success/failure totals

pub mod classify;
pub mod client;
pub mod counters;
pub mod extract;
pub mod scheduler;

pub use classify::*;
pub use client::*;
pub use counters::*;
pub use extract::*;
pub use scheduler::*;
