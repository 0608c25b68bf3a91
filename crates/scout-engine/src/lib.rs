//! Match engine adapter: turns a subscription's query text into a bounded
//! list of candidate items via an LLM-backed search endpoint.
//!
//! The adapter is fail-open by contract: network failures, timeouts and
//! malformed responses all degrade to an empty candidate list plus a logged
//! warning, so one subscription's outage never blocks the rest of a run.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use scout_core::Candidate;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "scout-engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
}

/// Capability interface the pipeline depends on. Infallible by design: the
/// adapter owns degradation, the caller only sees "candidates this cycle".
#[async_trait]
pub trait MatchEngine: Send + Sync {
    async fn find_matches(&self, query: &str) -> Vec<Candidate>;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_candidates: usize,
    pub backoff: BackoffPolicy,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: std::env::var("SCOUT_ENGINE_API_BASE")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: std::env::var("SCOUT_ENGINE_API_KEY").unwrap_or_default(),
            model: std::env::var("SCOUT_ENGINE_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            timeout: Duration::from_secs(
                std::env::var("SCOUT_ENGINE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            max_candidates: std::env::var("SCOUT_ENGINE_MAX_CANDIDATES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(25),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Chat-completions client for any OpenAI-compatible endpoint.
#[derive(Debug)]
pub struct LlmMatchEngine {
    client: reqwest::Client,
    config: EngineConfig,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    title: String,
    #[serde(alias = "external_id")]
    url: String,
    description: String,
}

/// What a model reply boiled down to. `Unparseable` is distinct from an empty
/// candidate list so that schema drift stays visible in the logs even though
/// both degrade to "no new matches this cycle".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedResponse {
    Candidates(Vec<Candidate>),
    Unparseable,
}

impl LlmMatchEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn prompt_for(query: &str) -> String {
        format!(
            "Search for items matching this description: {query}\n\
             Return the results as a JSON array with this structure:\n\
             [{{\"title\": \"Item title\", \"url\": \"URL to the item\", \
             \"description\": \"Brief description of the item\"}}]\n\
             Only include items that are currently available for purchase. \
             Respond with the JSON array only."
        )
    }

    async fn fetch_reply(&self, query: &str) -> Result<String, EngineError> {
        let url = format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": Self::prompt_for(query)}],
            "temperature": 0.2,
        });

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.config.backoff.max_retries {
            let resp_result = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: ChatResponse = resp.json().await?;
                        return Ok(parsed
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.message.content)
                            .unwrap_or_default());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(EngineError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(EngineError::Request(err));
                }
            }
        }

        Err(EngineError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

#[async_trait]
impl MatchEngine for LlmMatchEngine {
    async fn find_matches(&self, query: &str) -> Vec<Candidate> {
        let reply = match self.fetch_reply(query).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, query, "match engine fetch failed; treating as no matches");
                return Vec::new();
            }
        };

        match parse_candidates(&reply, self.config.max_candidates) {
            ParsedResponse::Candidates(candidates) => candidates,
            ParsedResponse::Unparseable => {
                warn!(
                    query,
                    reply_len = reply.len(),
                    "unparseable match engine response; treating as no matches"
                );
                Vec::new()
            }
        }
    }
}

/// Extracts up to `max` validated candidates from a model reply.
///
/// Replies arrive as a bare JSON array, a fenced ```json block, or an array
/// embedded in prose; everything else is `Unparseable`. Records with empty
/// fields are dropped, not treated as parse failures.
pub fn parse_candidates(reply: &str, max: usize) -> ParsedResponse {
    let stripped = strip_code_fences(reply);
    let items: Vec<RawItem> = match serde_json::from_str(stripped) {
        Ok(items) => items,
        Err(_) => match outermost_array(stripped) {
            Some(slice) => match serde_json::from_str(slice) {
                Ok(items) => items,
                Err(_) => return ParsedResponse::Unparseable,
            },
            None => return ParsedResponse::Unparseable,
        },
    };

    let candidates = items
        .iter()
        .filter_map(|item| Candidate::validated(&item.url, &item.title, &item.description))
        .take(max)
        .collect();
    ParsedResponse::Candidates(candidates)
}

fn strip_code_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the optional language tag on the opening fence.
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches(['\r', '\n'])
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

fn outermost_array(reply: &str) -> Option<&str> {
    let start = reply.find('[')?;
    let end = reply.rfind(']')?;
    if end <= start {
        return None;
    }
    Some(&reply[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEM: &str = r#"{"title": "Camera A", "url": "https://x/u1", "description": "Nice"}"#;

    fn single(parsed: ParsedResponse) -> Candidate {
        match parsed {
            ParsedResponse::Candidates(mut c) => {
                assert_eq!(c.len(), 1);
                c.remove(0)
            }
            ParsedResponse::Unparseable => panic!("expected candidates"),
        }
    }

    #[test]
    fn parses_a_bare_json_array() {
        let candidate = single(parse_candidates(&format!("[{ITEM}]"), 25));
        assert_eq!(candidate.external_id, "https://x/u1");
        assert_eq!(candidate.title, "Camera A");
    }

    #[test]
    fn parses_a_fenced_json_array() {
        let reply = format!("```json\n[{ITEM}]\n```");
        let candidate = single(parse_candidates(&reply, 25));
        assert_eq!(candidate.external_id, "https://x/u1");
    }

    #[test]
    fn parses_an_array_embedded_in_prose() {
        let reply = format!("Here is what I found:\n[{ITEM}]\nLet me know!");
        let candidate = single(parse_candidates(&reply, 25));
        assert_eq!(candidate.title, "Camera A");
    }

    #[test]
    fn empty_array_is_a_legitimate_no_match_reply() {
        assert_eq!(
            parse_candidates("[]", 25),
            ParsedResponse::Candidates(Vec::new())
        );
    }

    #[test]
    fn non_json_prose_is_unparseable() {
        assert_eq!(
            parse_candidates("I could not find anything matching that.", 25),
            ParsedResponse::Unparseable
        );
        assert_eq!(parse_candidates("", 25), ParsedResponse::Unparseable);
    }

    #[test]
    fn records_with_empty_fields_are_dropped() {
        let reply = format!(
            r#"[{ITEM}, {{"title": "", "url": "https://x/u2", "description": "d"}}]"#
        );
        let candidate = single(parse_candidates(&reply, 25));
        assert_eq!(candidate.external_id, "https://x/u1");
    }

    #[test]
    fn candidate_list_is_bounded() {
        let items: Vec<String> = (0..40)
            .map(|i| {
                format!(r#"{{"title": "T{i}", "url": "https://x/{i}", "description": "d"}}"#)
            })
            .collect();
        let reply = format!("[{}]", items.join(","));
        match parse_candidates(&reply, 25) {
            ParsedResponse::Candidates(c) => assert_eq!(c.len(), 25),
            ParsedResponse::Unparseable => panic!("expected candidates"),
        }
    }

    #[test]
    fn external_id_alias_is_accepted() {
        let reply = r#"[{"title": "T", "external_id": "https://x/alias", "description": "d"}]"#;
        let candidate = single(parse_candidates(reply, 25));
        assert_eq!(candidate.external_id, "https://x/alias");
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
