//! LLM-backed improvement and test-resolution oracles

use super::client::OpenRouterClient;
use super::prompts::{improve_user_prompt, spec_user_prompt, IMPROVE_SYSTEM, SPEC_SYSTEM};
use crate::optimize::state::FunctionUnit;
use crate::oracle::{ImproveRequest, Improver, SpecResolver};
use crate::util::strip_code_fences;
use async_trait::async_trait;
use std::sync::Arc;

pub struct LlmImprover {
    client: Arc<OpenRouterClient>,
}

impl LlmImprover {
    pub fn new(client: Arc<OpenRouterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Improver for LlmImprover {
    async fn improve(&self, request: ImproveRequest<'_>) -> anyhow::Result<String> {
        let user = improve_user_prompt(&request);
        // Fences are stripped by the controller.
        let response = self.client.complete(IMPROVE_SYSTEM, &user).await?;
        Ok(response.content)
    }
}

pub struct LlmSpecResolver {
    client: Arc<OpenRouterClient>,
}

impl LlmSpecResolver {
    pub fn new(client: Arc<OpenRouterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SpecResolver for LlmSpecResolver {
    async fn resolve(
        &self,
        function: &FunctionUnit,
        existing_tests: Option<&str>,
    ) -> anyhow::Result<String> {
        let user = spec_user_prompt(&function.name, &function.source, existing_tests);
        let response = self.client.complete(SPEC_SYSTEM, &user).await?;
        ensure_has_tests(strip_code_fences(&response.content))
    }
}

/// A harness without any `test_` function would fail every candidate.
fn ensure_has_tests(code: String) -> anyhow::Result<String> {
    let has_test = code.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with("def test_") || line.starts_with("async def test_")
    });
    if has_test {
        Ok(code)
    } else {
        Err(anyhow::anyhow!("model response contained no test_ functions"))
    }
}
