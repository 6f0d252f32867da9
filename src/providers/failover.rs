//! Provider failover: typed error classification, cooldowns, and the
//! ordered fallback chain.
//!
//! The chain tries each `(provider, model)` candidate at most once per call.
//! Rate-limit and overload failures put a candidate on a short cooldown so
//! the next call skips it; a non-retriable `format` failure aborts the chain
//! immediately because the same request would fail identically everywhere.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::Provider;
use crate::protocol::{ChatOptions, LLMResponse, Message, ToolDefinition};

/// Cooldown applied after a rate-limit or overload failure.
const COOLDOWN: Duration = Duration::from_secs(30);

/// Why a provider call failed, coarse enough to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailoverReason {
    #[error("auth")]
    Auth,
    #[error("rate_limit")]
    RateLimit,
    #[error("billing")]
    Billing,
    #[error("timeout")]
    Timeout,
    #[error("format")]
    Format,
    #[error("overloaded")]
    Overloaded,
    #[error("unknown")]
    Unknown,
}

impl FailoverReason {
    /// Only `format` is non-retriable: a malformed request fails the same
    /// way on every back-end.
    pub fn retriable(&self) -> bool {
        !matches!(self, FailoverReason::Format)
    }

    pub fn cooldown(&self) -> Option<Duration> {
        match self {
            FailoverReason::RateLimit | FailoverReason::Overloaded => Some(COOLDOWN),
            _ => None,
        }
    }
}

/// Classify a provider error from its text. HTTP status codes embedded in
/// adapter error messages participate in the match.
pub fn classify_error(text: &str) -> FailoverReason {
    let lower = text.to_lowercase();

    if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
    {
        return FailoverReason::Auth;
    }
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        return FailoverReason::RateLimit;
    }
    if lower.contains("billing")
        || lower.contains("insufficient credit")
        || lower.contains("quota exceeded")
        || lower.contains("payment")
    {
        return FailoverReason::Billing;
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return FailoverReason::Timeout;
    }
    if lower.contains("529") || lower.contains("overloaded") || lower.contains("503") {
        return FailoverReason::Overloaded;
    }
    if lower.contains("400")
        || lower.contains("invalid request")
        || lower.contains("invalid_request")
        || lower.contains("schema")
    {
        return FailoverReason::Format;
    }
    FailoverReason::Unknown
}

/// Candidate cooldown deadlines, shared across all agents so a rate-limited
/// back-end is avoided process-wide.
#[derive(Default)]
pub struct CooldownTracker {
    deadlines: Mutex<HashMap<String, Instant>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cooling(&self, key: &str) -> bool {
        let deadlines = self.deadlines.lock().expect("cooldown lock poisoned");
        deadlines
            .get(key)
            .map(|deadline| Instant::now() < *deadline)
            .unwrap_or(false)
    }

    pub fn set(&self, key: &str, duration: Duration) {
        let mut deadlines = self.deadlines.lock().expect("cooldown lock poisoned");
        deadlines.insert(key.to_string(), Instant::now() + duration);
    }

    pub fn clear(&self, key: &str) {
        let mut deadlines = self.deadlines.lock().expect("cooldown lock poisoned");
        deadlines.remove(key);
    }
}

#[derive(Clone)]
pub struct Candidate {
    pub provider: Arc<dyn Provider>,
    pub model: String,
}

impl Candidate {
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider.name(), self.model)
    }
}

/// One failed attempt, reported alongside the eventual response.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub candidate: String,
    pub reason: FailoverReason,
    pub error: String,
}

pub struct FallbackChain {
    candidates: Vec<Candidate>,
    cooldowns: Arc<CooldownTracker>,
}

impl FallbackChain {
    pub fn new(candidates: Vec<Candidate>, cooldowns: Arc<CooldownTracker>) -> Self {
        Self {
            candidates,
            cooldowns,
        }
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn primary(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    /// Try candidates in order until one succeeds. Returns the response and
    /// the failed attempts that preceded it.
    pub async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &ChatOptions,
    ) -> Result<(LLMResponse, Vec<Attempt>)> {
        if self.candidates.is_empty() {
            anyhow::bail!("No model candidates configured");
        }

        // Cooldowns are an optimization: when every candidate is cooling,
        // try them all anyway rather than fail without an attempt.
        let all_cooling = self
            .candidates
            .iter()
            .all(|c| self.cooldowns.is_cooling(&c.key()));

        let mut attempts: Vec<Attempt> = Vec::new();

        for candidate in &self.candidates {
            let key = candidate.key();
            if !all_cooling && self.cooldowns.is_cooling(&key) {
                debug!("Skipping {} (cooling down)", key);
                continue;
            }

            match candidate
                .provider
                .chat(messages, tools, &candidate.model, opts)
                .await
            {
                Ok(response) => {
                    self.cooldowns.clear(&key);
                    if !attempts.is_empty() {
                        info!(
                            "Fell back to {} after {} failed attempt(s)",
                            key,
                            attempts.len()
                        );
                    }
                    return Ok((response, attempts));
                }
                Err(e) => {
                    let text = format!("{:#}", e);
                    let reason = classify_error(&text);
                    warn!("Candidate {} failed ({}): {}", key, reason, text);

                    if let Some(cooldown) = reason.cooldown() {
                        self.cooldowns.set(&key, cooldown);
                    }
                    attempts.push(Attempt {
                        candidate: key,
                        reason,
                        error: text,
                    });

                    if !reason.retriable() {
                        break;
                    }
                }
            }
        }

        let last = attempts
            .last()
            .map(|a| a.error.clone())
            .unwrap_or_else(|| "all candidates cooling down".to_string());
        anyhow::bail!("All model candidates failed. Last error: {}", last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProvider {
        name: &'static str,
        error: Option<&'static str>,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedProvider {
        fn ok(name: &'static str) -> (Arc<Self>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Arc::new(Self {
                    name,
                    error: None,
                    calls: Arc::clone(&calls),
                }),
                calls,
            )
        }

        fn failing(name: &'static str, error: &'static str) -> (Arc<Self>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Arc::new(Self {
                    name,
                    error: Some(error),
                    calls: Arc::clone(&calls),
                }),
                calls,
            )
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn chat(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
            _model: &str,
            _opts: &ChatOptions,
        ) -> Result<LLMResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.error {
                Some(e) => anyhow::bail!("{}", e),
                None => Ok(LLMResponse::text("ok")),
            }
        }
    }

    fn chain(candidates: Vec<Candidate>) -> FallbackChain {
        FallbackChain::new(candidates, Arc::new(CooldownTracker::new()))
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify_error("401 unauthorized"), FailoverReason::Auth);
        assert_eq!(classify_error("HTTP 429 rate limit"), FailoverReason::RateLimit);
        assert_eq!(classify_error("quota exceeded"), FailoverReason::Billing);
        assert_eq!(classify_error("request timed out"), FailoverReason::Timeout);
        assert_eq!(classify_error("server overloaded"), FailoverReason::Overloaded);
        assert_eq!(classify_error("400 invalid request"), FailoverReason::Format);
        assert_eq!(classify_error("something odd"), FailoverReason::Unknown);
        assert!(!FailoverReason::Format.retriable());
        assert!(FailoverReason::RateLimit.retriable());
    }

    #[tokio::test]
    async fn test_falls_through_to_second_candidate() {
        let (bad, bad_calls) = ScriptedProvider::failing("alpha", "server overloaded");
        let (good, good_calls) = ScriptedProvider::ok("beta");

        let chain = chain(vec![
            Candidate {
                provider: bad,
                model: "m1".to_string(),
            },
            Candidate {
                provider: good,
                model: "m2".to_string(),
            },
        ]);

        let (response, attempts) = chain.chat(&[], &[], &ChatOptions::default()).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].reason, FailoverReason::Overloaded);
        assert_eq!(bad_calls.load(Ordering::SeqCst), 1);
        assert_eq!(good_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_each_candidate_tried_at_most_once() {
        let (a, a_calls) = ScriptedProvider::failing("alpha", "boom");
        let (b, b_calls) = ScriptedProvider::failing("beta", "boom");

        let chain = chain(vec![
            Candidate {
                provider: a,
                model: "m1".to_string(),
            },
            Candidate {
                provider: b,
                model: "m2".to_string(),
            },
        ]);

        let err = chain
            .chat(&[], &[], &ChatOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_format_error_stops_the_chain() {
        let (a, _) = ScriptedProvider::failing("alpha", "400 invalid request: bad schema");
        let (b, b_calls) = ScriptedProvider::ok("beta");

        let chain = chain(vec![
            Candidate {
                provider: a,
                model: "m1".to_string(),
            },
            Candidate {
                provider: b,
                model: "m2".to_string(),
            },
        ]);

        assert!(chain.chat(&[], &[], &ChatOptions::default()).await.is_err());
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cooldown_skips_candidate_on_next_call() {
        let (a, a_calls) = ScriptedProvider::failing("alpha", "429 rate limit");
        let (b, b_calls) = ScriptedProvider::ok("beta");

        let cooldowns = Arc::new(CooldownTracker::new());
        let chain = FallbackChain::new(
            vec![
                Candidate {
                    provider: a,
                    model: "m1".to_string(),
                },
                Candidate {
                    provider: b,
                    model: "m2".to_string(),
                },
            ],
            Arc::clone(&cooldowns),
        );

        // First call: alpha fails with rate limit and starts cooling.
        chain.chat(&[], &[], &ChatOptions::default()).await.unwrap();
        assert!(cooldowns.is_cooling("alpha/m1"));

        // Second call: alpha skipped entirely.
        chain.chat(&[], &[], &ChatOptions::default()).await.unwrap();
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_all_cooling_still_attempts() {
        let (a, a_calls) = ScriptedProvider::ok("alpha");
        let cooldowns = Arc::new(CooldownTracker::new());
        cooldowns.set("alpha/m1", Duration::from_secs(60));

        let chain = FallbackChain::new(
            vec![Candidate {
                provider: a,
                model: "m1".to_string(),
            }],
            Arc::clone(&cooldowns),
        );

        let (response, _) = chain.chat(&[], &[], &ChatOptions::default()).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        // Success clears the cooldown
        assert!(!cooldowns.is_cooling("alpha/m1"));
    }
}
