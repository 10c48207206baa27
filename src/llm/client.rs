use crate::config::TokenPricing;
use crate::error::{ExtractionError, Result};
use crate::llm::types::{OracleReply, OracleRequest, PipelineEvent, TokenUsage};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::Sender;

/// Failure reported by an oracle backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("oracle did not answer in time")]
    Timeout,

    #[error("oracle reply could not be used: {0}")]
    Malformed(String),

    #[error("oracle unreachable: {0}")]
    Unavailable(String),
}

/// The external reasoning service.
///
/// Implementations must be safe to call from several documents at once.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn complete(&self, request: &OracleRequest) -> std::result::Result<OracleReply, OracleError>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct OracleUsage {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Only present when token pricing is configured.
    #[serde(default)]
    pub estimated_cost_usd: Option<f64>,
}

impl OracleUsage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Default)]
pub struct UsageTracker {
    calls: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl UsageTracker {
    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    fn record_tokens(&self, usage: TokenUsage) {
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pricing: Option<TokenPricing>) -> OracleUsage {
        let prompt_tokens = self.prompt_tokens.load(Ordering::Relaxed);
        let completion_tokens = self.completion_tokens.load(Ordering::Relaxed);
        OracleUsage {
            calls: self.calls.load(Ordering::Relaxed),
            prompt_tokens,
            completion_tokens,
            estimated_cost_usd: pricing.map(|p| p.cost_usd(prompt_tokens, completion_tokens)),
        }
    }
}

/// Wraps an [`Oracle`] with the bounded wait, the single retry and usage accounting.
#[derive(Clone)]
pub struct OracleCaller {
    oracle: Arc<dyn Oracle>,
    timeout: Duration,
    usage: Arc<UsageTracker>,
    pricing: Option<TokenPricing>,
    progress: Option<Sender<PipelineEvent>>,
}

impl OracleCaller {
    pub fn new(oracle: Arc<dyn Oracle>, timeout: Duration) -> Self {
        Self {
            oracle,
            timeout,
            usage: Arc::new(UsageTracker::default()),
            pricing: None,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Option<Sender<PipelineEvent>>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_pricing(mut self, pricing: Option<TokenPricing>) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn usage(&self) -> OracleUsage {
        self.usage.snapshot(self.pricing)
    }

    /// One oracle call under the configured timeout.
    pub async fn call(&self, request: &OracleRequest) -> Result<String> {
        self.usage.record_call();
        debug!(
            "Oracle call ({:?}): {} chars of user prompt",
            request.purpose,
            request.user.len()
        );

        match tokio::time::timeout(self.timeout, self.oracle.complete(request)).await {
            Err(_) | Ok(Err(OracleError::Timeout)) => {
                Err(ExtractionError::OracleTimeout(self.timeout.as_secs()))
            }
            Ok(Err(OracleError::Malformed(msg))) => Err(ExtractionError::OracleMalformedOutput(msg)),
            Ok(Err(OracleError::Unavailable(msg))) => Err(ExtractionError::OracleUnavailable(msg)),
            Ok(Ok(reply)) => {
                if let Some(usage) = reply.usage {
                    self.usage.record_tokens(usage);
                }
                Ok(reply.text)
            }
        }
    }

    /// Calls and parses, retrying once with the identical request on a timeout
    /// or malformed reply. `OracleUnavailable` is returned straight away.
    pub async fn call_parsed<T, F>(&self, request: &OracleRequest, parse: F) -> Result<T>
    where
        F: Fn(&str) -> Result<T>,
    {
        match self.attempt(request, &parse).await {
            Err(e) if e.is_field_scoped() => {
                warn!("Oracle {:?} call failed ({}), retrying once", request.purpose, e);
                self.send_event(PipelineEvent::Retry {
                    stage: request.purpose,
                    attempt: 2,
                    error: e.to_string(),
                })
                .await;
                self.attempt(request, &parse).await
            }
            other => other,
        }
    }

    async fn attempt<T, F>(&self, request: &OracleRequest, parse: &F) -> Result<T>
    where
        F: Fn(&str) -> Result<T>,
    {
        let text = self.call(request).await?;
        parse(&text)
    }

    pub(crate) async fn send_event(&self, event: PipelineEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedOracle;
    use crate::llm::types::OraclePurpose;

    struct Sleeper;

    #[async_trait]
    impl Oracle for Sleeper {
        async fn complete(
            &self,
            _request: &OracleRequest,
        ) -> std::result::Result<OracleReply, OracleError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(OracleReply::text("{}"))
        }
    }

    fn caller(replies: Vec<std::result::Result<OracleReply, OracleError>>) -> OracleCaller {
        OracleCaller::new(Arc::new(ScriptedOracle::new(replies)), Duration::from_secs(5))
    }

    fn parse_number(text: &str) -> Result<u32> {
        text.trim()
            .parse()
            .map_err(|_| ExtractionError::OracleMalformedOutput(text.to_string()))
    }

    fn request() -> OracleRequest {
        OracleRequest::new(OraclePurpose::Match, "sys", "user")
    }

    #[tokio::test]
    async fn test_malformed_reply_is_retried_once() {
        let caller = caller(vec![Ok(OracleReply::text("nope")), Ok(OracleReply::text("42"))]);
        let value = caller.call_parsed(&request(), parse_number).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(caller.usage().calls, 2);
    }

    #[tokio::test]
    async fn test_second_failure_is_returned() {
        let caller = caller(vec![
            Err(OracleError::Malformed("bad".into())),
            Ok(OracleReply::text("still bad")),
        ]);
        let err = caller.call_parsed(&request(), parse_number).await.unwrap_err();
        assert!(matches!(err, ExtractionError::OracleMalformedOutput(_)));
        assert_eq!(caller.usage().calls, 2);
    }

    #[tokio::test]
    async fn test_unavailable_is_not_retried() {
        let caller = caller(vec![Err(OracleError::Unavailable("down".into()))]);
        let err = caller.call_parsed(&request(), parse_number).await.unwrap_err();
        assert!(matches!(err, ExtractionError::OracleUnavailable(_)));
        assert_eq!(caller.usage().calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_oracle_times_out() {
        let caller = OracleCaller::new(Arc::new(Sleeper), Duration::from_secs(60));
        let err = caller.call(&request()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::OracleTimeout(60)));
    }

    #[tokio::test]
    async fn test_token_usage_is_accumulated() {
        let reply = OracleReply {
            text: "7".to_string(),
            usage: Some(TokenUsage {
                prompt_tokens: 120,
                completion_tokens: 30,
            }),
        };
        let caller = caller(vec![Ok(reply)]);
        caller.call_parsed(&request(), parse_number).await.unwrap();

        let usage = caller.usage();
        assert_eq!(usage.calls, 1);
        assert_eq!(usage.total_tokens(), 150);
        assert_eq!(usage.estimated_cost_usd, None);
    }

    #[tokio::test]
    async fn test_priced_usage_reports_cost() {
        let reply = OracleReply {
            text: "7".to_string(),
            usage: Some(TokenUsage {
                prompt_tokens: 2000,
                completion_tokens: 1000,
            }),
        };
        let caller = caller(vec![Ok(reply)]).with_pricing(Some(TokenPricing::GPT_4O_MINI));
        caller.call_parsed(&request(), parse_number).await.unwrap();

        let cost = caller.usage().estimated_cost_usd.unwrap();
        assert!((cost - 0.0009).abs() < 1e-12);
    }
}
