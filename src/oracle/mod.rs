//! Collaborator contracts
//!
//! The controller only talks to the outside world through these traits. The
//! binary wires in the LLM-backed and Python-sandbox implementations; tests
//! wire in deterministic fakes.

use crate::optimize::state::{FeedbackLog, FunctionUnit};
use async_trait::async_trait;
use std::path::Path;

/// Input to one improvement call.
#[derive(Debug, Clone, Copy)]
pub struct ImproveRequest<'a> {
    pub function_name: &'a str,
    /// Always the original source; candidates are not chained.
    pub code: &'a str,
    pub test_code: &'a str,
    pub feedback: &'a FeedbackLog,
}

/// Proposes a rewrite of a function.
#[async_trait]
pub trait Improver: Send + Sync {
    async fn improve(&self, request: ImproveRequest<'_>) -> anyhow::Result<String>;
}

/// Produces the test harness a function's candidates are validated against.
#[async_trait]
pub trait SpecResolver: Send + Sync {
    async fn resolve(
        &self,
        function: &FunctionUnit,
        existing_tests: Option<&str>,
    ) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFailure {
    /// Exception class name, or a sandbox condition such as `Timeout`.
    pub kind: String,
    pub message: String,
}

impl TestFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestVerdict {
    Passed,
    Failed(TestFailure),
}

/// Runs test code against an assembled source file in isolation.
#[async_trait]
pub trait TestOracle: Send + Sync {
    async fn validate(&self, full_context: &str, test_code: &str) -> anyhow::Result<TestVerdict>;
}

/// Input to one profiler run.
#[derive(Debug, Clone, Copy)]
pub struct ProfileRequest<'a> {
    pub full_context: &'a str,
    pub function_name: &'a str,
    pub iterations: u64,
    pub runtime: &'a Path,
}

/// Measures the scalar cost of calling a function `iterations` times.
#[async_trait]
pub trait CostProfiler: Send + Sync {
    async fn measure(&self, request: ProfileRequest<'_>) -> anyhow::Result<f64>;
}

/// The full set of collaborators a run needs.
pub struct Oracles {
    pub spec: Box<dyn SpecResolver>,
    pub improver: Box<dyn Improver>,
    pub tests: Box<dyn TestOracle>,
    pub profiler: Box<dyn CostProfiler>,
}

/// Hands every function the test file the user supplied, unchanged.
///
/// Useful offline: no model is consulted, so the file must already contain
/// `test_*` functions covering every function in the input.
#[derive(Debug, Clone, Default)]
pub struct ExistingTestsResolver;

#[async_trait]
impl SpecResolver for ExistingTestsResolver {
    async fn resolve(
        &self,
        function: &FunctionUnit,
        existing_tests: Option<&str>,
    ) -> anyhow::Result<String> {
        match existing_tests {
            Some(tests) if !tests.trim().is_empty() => Ok(tests.to_string()),
            _ => Err(anyhow::anyhow!(
                "No test file was supplied, so tests for '{}' cannot be reused",
                function.name
            )),
        }
    }
}
