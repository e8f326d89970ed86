//! ci-triage library crate
//!
//! Exposes the pipeline stages so the binary, benchmarks and tests can drive
//! them without going through CLI startup.

pub mod config;
pub mod github;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod publish;
pub mod report;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;
