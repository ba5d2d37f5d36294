//! carbonloop library crate
//!
//! Exposes the optimization core and its collaborators so the binary,
//! benchmarks and tests share one implementation.

pub mod config;
pub mod error;
pub mod extract;
pub mod llm;
pub mod optimize;
pub mod oracle;
pub mod report;
pub mod sandbox;
pub mod util;
