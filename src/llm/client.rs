use super::models::{Model, Usage, UsageMeter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// OpenRouter direct API URL (BYOK mode)
pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000; // 2 seconds
const BACKOFF_MULTIPLIER: u64 = 2; // Exponential backoff

/// Response from LLM including content and usage stats
#[derive(Debug)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client shared by every LLM-backed oracle in a run.
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    url: String,
    model: Model,
    meter: Arc<UsageMeter>,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>, model: Model, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            url: OPENROUTER_URL.to_string(),
            model,
            meter: Arc::new(UsageMeter::default()),
        })
    }

    /// Point the client at another OpenRouter-compatible endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Usage totals for every call made through this client.
    pub fn meter(&self) -> Arc<UsageMeter> {
        Arc::clone(&self.meter)
    }

    /// Send one system+user exchange. Retries rate limits with exponential backoff.
    pub async fn complete(&self, system: &str, user: &str) -> anyhow::Result<LlmResponse> {
        let request = ChatRequest {
            model: self.model.id().to_string(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens: self.model.max_tokens(),
            stream: false,
        };

        let mut retry_count = 0;

        loop {
            let response = self
                .http
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("X-Title", "carbonloop")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        anyhow::anyhow!("OpenRouter request timed out")
                    } else {
                        anyhow::anyhow!("OpenRouter request failed: {}", e)
                    }
                })?;

            let status = response.status();
            let text = response.text().await?;

            if status.is_success() {
                let parsed = parse_chat_response(&text)?;
                self.meter.record(parsed.usage.clone());
                tracing::debug!(
                    model = %parsed.model,
                    tokens = parsed.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0),
                    "llm call complete"
                );
                return Ok(parsed);
            }

            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let retry_after = parse_retry_after(&text)
                    .unwrap_or_else(|| backoff_secs(retry_count));

                tracing::warn!(
                    retry_after,
                    attempt = retry_count,
                    max = MAX_RETRIES,
                    "OpenRouter rate limited; retrying"
                );
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            return Err(anyhow::anyhow!(
                "{}",
                status_error_message(status.as_u16(), &text, retry_count)
            ));
        }
    }
}

fn backoff_secs(retry_count: u32) -> u64 {
    (INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count.saturating_sub(1))) / 1000
}

fn parse_chat_response(text: &str) -> anyhow::Result<LlmResponse> {
    let parsed: ChatResponse = serde_json::from_str(text).map_err(|e| {
        anyhow::anyhow!(
            "Failed to parse OpenRouter response: {}\n{}",
            e,
            truncate_str(text, 500)
        )
    })?;

    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    if content.trim().is_empty() {
        return Err(anyhow::anyhow!("OpenRouter returned an empty response"));
    }

    Ok(LlmResponse {
        content,
        usage: parsed.usage,
        model: parsed.model.unwrap_or_default(),
    })
}

fn status_error_message(status: u16, body: &str, retry_count: u32) -> String {
    match status {
        401 => "Invalid API key. Run 'carbonloop set-key <KEY>' to update it.".to_string(),
        429 => format!(
            "Rate limited by OpenRouter after {} retries. Try again in a few minutes.",
            retry_count
        ),
        500..=599 => format!(
            "OpenRouter server error ({}). The service may be temporarily unavailable.",
            status
        ),
        _ => format!("API error {}: {}", status, truncate_str(body, 200)),
    }
}

/// Extract retry-after hint from OpenRouter response (if present)
fn parse_retry_after(text: &str) -> Option<u64> {
    // Look for patterns like "retry after X seconds"
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    let after_retry = &text_lower[pos..];
    for word in after_retry.split_whitespace().skip(1).take(5) {
        if let Ok(secs) = word
            .trim_matches(|c: char| !c.is_numeric())
            .parse::<u64>()
        {
            if secs > 0 && secs < 300 {
                return Some(secs);
            }
        }
    }
    None
}

/// Truncate a string for display (Unicode-safe)
pub(crate) fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}
