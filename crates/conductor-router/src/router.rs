use crate::cache::{CachedCompletion, ResponseCache};
use crate::config::{compute_backoff, with_jitter, RouterPolicy};
use crate::error::ProviderError;
use crate::health::{Candidate, HealthTracker};
use crate::provider::{CompletionRequest, Provider};
use chrono::Utc;
use conductor_core::{
    Alert, AlertSeverity, AlertType, ConductorError, ConductorResult, ProviderHealth,
};
use conductor_store::HealthStore;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{info, warn};

/// Injectable sleep, used by tests to skip real backoff delays.
pub type SleepFn = Arc<dyn Fn(u64) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Where a routed answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    /// A provider answered this call.
    Provider,
    /// Every provider failed; an earlier answer to an equivalent request was reused.
    Cache,
    /// Every provider failed and nothing was cached.
    Fallback,
}

/// The router's answer. Always produced, never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedCompletion {
    pub text: String,
    /// `true` unless a provider answered this call.
    pub degraded: bool,
    pub source: CompletionSource,
    /// Provider that produced `text`, including for cached answers.
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Provider calls made for this request.
    pub attempts: u32,
    /// One line per failed call, in order.
    pub failures: Vec<String>,
}

/// Routes completion requests across providers ranked by health.
///
/// Transient failures retry the same provider with jittered exponential
/// backoff, authentication failures quarantine it, rate limits skip it. When
/// every provider fails the caller still gets a [`RoutedCompletion`], marked
/// degraded.
pub struct ProviderRouter {
    providers: Vec<Arc<dyn Provider>>,
    policy: RouterPolicy,
    health: HealthTracker,
    cache: ResponseCache,
    store: Option<Arc<dyn HealthStore>>,
    sleep_fn: Option<SleepFn>,
}

impl ProviderRouter {
    /// Create a router over `providers`, all starting at full health.
    pub fn new(providers: Vec<Arc<dyn Provider>>, policy: RouterPolicy) -> ConductorResult<Self> {
        policy.validate()?;
        let mut seen = HashSet::new();
        for p in &providers {
            if !seen.insert(p.id().to_string()) {
                return Err(ConductorError::Config(format!(
                    "duplicate provider id '{}'",
                    p.id()
                )));
            }
        }
        let ids = providers.iter().map(|p| p.id().to_string()).collect();
        Ok(Self {
            health: HealthTracker::new(ids, Vec::new()),
            cache: ResponseCache::new(policy.cache_capacity),
            providers,
            policy,
            store: None,
            sleep_fn: None,
        })
    }

    /// Load persisted scores from `store` and persist every later change to it.
    pub async fn with_health_store(mut self, store: Arc<dyn HealthStore>) -> ConductorResult<Self> {
        let persisted = store.load_health().await?;
        let ids = self.providers.iter().map(|p| p.id().to_string()).collect();
        self.health = HealthTracker::new(ids, persisted);
        for h in self.health.snapshot() {
            info!(provider = %h.provider_id, score = h.score, "Loaded provider health");
        }
        self.store = Some(store);
        Ok(self)
    }

    /// Replace the real sleep used between retries.
    pub fn with_sleep_fn(mut self, sleep_fn: SleepFn) -> Self {
        self.sleep_fn = Some(sleep_fn);
        self
    }

    /// The active policy.
    pub fn policy(&self) -> &RouterPolicy {
        &self.policy
    }

    /// Health records in configuration order.
    pub fn health_snapshot(&self) -> Vec<ProviderHealth> {
        self.health.snapshot()
    }

    /// Run `request` against the healthiest available provider.
    pub async fn complete(&self, request: &CompletionRequest) -> RoutedCompletion {
        let fingerprint = request.fingerprint();
        let plan = {
            let mut rng = rand::thread_rng();
            self.health
                .plan(&self.policy, Utc::now(), || rng.gen::<f64>())
        };

        let mut attempts = 0u32;
        let mut failures = Vec::new();

        for candidate in &plan {
            let Some(provider) = self.provider(&candidate.provider_id) else {
                continue;
            };
            if let Some(routed) = self
                .try_provider(provider, candidate, request, &mut attempts, &mut failures)
                .await
            {
                self.cache.insert(
                    fingerprint,
                    CachedCompletion {
                        provider_id: candidate.provider_id.clone(),
                        completion: crate::provider::Completion {
                            text: routed.text.clone(),
                            model: routed.model.clone(),
                        },
                    },
                );
                return RoutedCompletion {
                    attempts,
                    failures,
                    ..routed
                };
            }
        }

        self.exhausted(&fingerprint, plan.len(), attempts, failures)
            .await
    }

    async fn try_provider(
        &self,
        provider: &Arc<dyn Provider>,
        candidate: &Candidate,
        request: &CompletionRequest,
        attempts: &mut u32,
        failures: &mut Vec<String>,
    ) -> Option<RoutedCompletion> {
        let id = candidate.provider_id.as_str();
        let timeout = self.policy.request_timeout();

        for attempt in 0..self.policy.max_attempts {
            *attempts += 1;
            let outcome = match tokio::time::timeout(timeout, provider.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(timeout)),
            };

            let err = match outcome {
                Ok(completion) => {
                    let health = self.health.record_success(id, &self.policy, candidate.probe);
                    info!(
                        provider = %id,
                        attempt,
                        probe = candidate.probe,
                        score = health.as_ref().map(|h| h.score),
                        "Provider call succeeded"
                    );
                    self.persist(health).await;
                    return Some(RoutedCompletion {
                        text: completion.text,
                        degraded: false,
                        source: CompletionSource::Provider,
                        provider: Some(id.to_string()),
                        model: completion.model,
                        attempts: 0,
                        failures: Vec::new(),
                    });
                }
                Err(err) => err,
            };
            failures.push(format!("{id}: {err}"));

            match &err {
                ProviderError::Auth(_) => {
                    let until = Utc::now() + self.policy.quarantine();
                    let health = self.health.quarantine(id, until);
                    warn!(
                        provider = %id,
                        until = %until,
                        error = %err,
                        "Authentication failed, quarantining provider"
                    );
                    self.persist(health).await;
                    self.alert(
                        Alert::new(
                            AlertType::ProviderQuarantined,
                            AlertSeverity::Warning,
                            format!("Provider {id} quarantined"),
                            format!("Authentication failed; excluded until {until}: {err}"),
                        ),
                    )
                    .await;
                    return None;
                }
                ProviderError::RateLimit { retry_after, .. } => {
                    warn!(
                        provider = %id,
                        retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                        "Rate limited, moving to next provider"
                    );
                    return None;
                }
                ProviderError::Rejected(_) => {
                    let health = self.health.record_failure(id, &self.policy);
                    warn!(provider = %id, error = %err, "Request rejected, moving to next provider");
                    self.persist(health).await;
                    return None;
                }
                ProviderError::Transient(_) | ProviderError::Timeout(_) => {
                    let health = self.health.record_failure(id, &self.policy);
                    self.persist(health).await;
                    if attempt + 1 < self.policy.max_attempts {
                        let delay = {
                            let mut rng = rand::thread_rng();
                            with_jitter(
                                compute_backoff(&self.policy, attempt),
                                self.policy.jitter_ratio,
                                &mut rng,
                            )
                        };
                        info!(
                            provider = %id,
                            attempt,
                            delay_ms = delay,
                            error = %err,
                            "Retryable error, backing off"
                        );
                        self.do_sleep(delay).await;
                    } else {
                        warn!(
                            provider = %id,
                            attempts = self.policy.max_attempts,
                            error = %err,
                            "Retries exhausted, moving to next provider"
                        );
                    }
                }
            }
        }
        None
    }

    async fn exhausted(
        &self,
        fingerprint: &str,
        candidates: usize,
        attempts: u32,
        failures: Vec<String>,
    ) -> RoutedCompletion {
        warn!(
            candidates,
            attempts,
            fingerprint = %&fingerprint[..12.min(fingerprint.len())],
            "All providers failed, returning degraded answer"
        );
        self.alert(Alert::new(
            AlertType::ProviderExhausted,
            AlertSeverity::Error,
            "All providers failed",
            format!(
                "{candidates} provider(s) tried, {attempts} call(s) made: {}",
                if failures.is_empty() {
                    "no provider available".to_string()
                } else {
                    failures.join("; ")
                }
            ),
        ))
        .await;

        match self.cache.get(fingerprint) {
            Some(cached) => RoutedCompletion {
                text: cached.completion.text,
                degraded: true,
                source: CompletionSource::Cache,
                provider: Some(cached.provider_id),
                model: cached.completion.model,
                attempts,
                failures,
            },
            None => RoutedCompletion {
                text: fallback_text(fingerprint),
                degraded: true,
                source: CompletionSource::Fallback,
                provider: None,
                model: None,
                attempts,
                failures,
            },
        }
    }

    fn provider(&self, id: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.id() == id)
    }

    async fn persist(&self, health: Option<ProviderHealth>) {
        let (Some(store), Some(health)) = (&self.store, health) else {
            return;
        };
        if let Err(e) = store.save_health(&health).await {
            warn!(provider = %health.provider_id, error = %e, "Failed to persist provider health");
        }
    }

    async fn alert(&self, alert: Alert) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.record_alert(&alert).await {
            warn!(alert_type = %alert.alert_type, error = %e, "Failed to record alert");
        }
    }

    /// Perform a sleep for the given duration in milliseconds.
    async fn do_sleep(&self, ms: u64) {
        if let Some(f) = &self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}

/// Deterministic answer used when no provider and no cache can serve a request.
pub fn fallback_text(fingerprint: &str) -> String {
    format!(
        "All providers are currently unavailable; request {} could not be completed. \
         Retry later.",
        &fingerprint[..12.min(fingerprint.len())]
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::provider::Completion;
    use async_trait::async_trait;
    use conductor_store::MemoryWorkflowStore;
    use conductor_store::WorkflowStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// A mock provider that returns a sequence of results.
    struct MockProvider {
        id: String,
        /// Results to return in order; the last one repeats.
        results: parking_lot::Mutex<Vec<Result<Completion, ProviderError>>>,
        call_count: AtomicU32,
    }

    impl MockProvider {
        fn new(id: &str, results: Vec<Result<Completion, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                results: parking_lot::Mutex::new(results),
                call_count: AtomicU32::new(0),
            })
        }

        fn ok(id: &str, text: &str) -> Arc<Self> {
            Self::new(id, vec![Ok(Completion::text(text))])
        }

        fn failing(id: &str, err: ProviderError) -> Arc<Self> {
            Self::new(id, vec![Err(err)])
        }

        fn calls(&self) -> u32 {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn id(&self) -> &str {
            &self.id
        }

        async fn complete(&self, _: &CompletionRequest) -> Result<Completion, ProviderError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock();
            if results.len() > 1 {
                results.remove(0)
            } else {
                results[0].clone()
            }
        }
    }

    fn instant_policy() -> RouterPolicy {
        RouterPolicy {
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            probe_probability: 0.0,
            ..RouterPolicy::default()
        }
    }

    fn router(providers: Vec<Arc<MockProvider>>) -> ProviderRouter {
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn Provider>)
            .collect();
        ProviderRouter::new(providers, instant_policy())
            .unwrap()
            .with_sleep_fn(Arc::new(|_| Box::pin(async {})))
    }

    fn transient() -> ProviderError {
        ProviderError::Transient("HTTP 503".into())
    }

    fn score(router: &ProviderRouter, id: &str) -> u8 {
        router.health.get(id).unwrap().score
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_same_provider() {
        let a = MockProvider::new(
            "a",
            vec![Err(transient()), Ok(Completion::text("ok"))],
        );
        let b = MockProvider::ok("b", "from b");
        let r = router(vec![a.clone(), b.clone()]);

        let out = r.complete(&CompletionRequest::new("q")).await;
        assert_eq!(out.text, "ok");
        assert!(!out.degraded);
        assert_eq!(out.provider.as_deref(), Some("a"));
        assert_eq!(out.attempts, 2);
        assert_eq!(b.calls(), 0);
        // 100 - 15 + 5
        assert_eq!(score(&r, "a"), 90);
    }

    #[tokio::test]
    async fn test_transient_exhausts_attempt_cap_then_fails_over() {
        let a = MockProvider::failing("a", transient());
        let b = MockProvider::ok("b", "from b");
        let r = router(vec![a.clone(), b.clone()]);

        let out = r.complete(&CompletionRequest::new("q")).await;
        assert_eq!(out.text, "from b");
        assert_eq!(a.calls(), 3);
        assert_eq!(out.attempts, 4);
        assert_eq!(out.failures.len(), 3);
        assert_eq!(score(&r, "a"), 55);
    }

    #[tokio::test]
    async fn test_rate_limit_skips_without_penalty() {
        let a = MockProvider::failing(
            "a",
            ProviderError::RateLimit {
                message: "slow down".into(),
                retry_after: Some(Duration::from_secs(1)),
            },
        );
        let b = MockProvider::ok("b", "from b");
        let r = router(vec![a.clone(), b]);

        let out = r.complete(&CompletionRequest::new("q")).await;
        assert_eq!(out.provider.as_deref(), Some("b"));
        assert_eq!(a.calls(), 1);
        assert_eq!(score(&r, "a"), 100);
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried() {
        let a = MockProvider::failing("a", ProviderError::Rejected("HTTP 400".into()));
        let b = MockProvider::ok("b", "from b");
        let r = router(vec![a.clone(), b]);

        r.complete(&CompletionRequest::new("q")).await;
        assert_eq!(a.calls(), 1);
        assert_eq!(score(&r, "a"), 85);
    }

    #[tokio::test]
    async fn test_auth_failure_quarantines_and_records_alert() {
        let store = MemoryWorkflowStore::new();
        let a = MockProvider::failing("a", ProviderError::Auth("HTTP 401".into()));
        let b = MockProvider::ok("b", "from b");
        let r = router(vec![a.clone(), b.clone()])
            .with_health_store(Arc::new(store.clone()))
            .await
            .unwrap();

        let out = r.complete(&CompletionRequest::new("q")).await;
        assert_eq!(out.provider.as_deref(), Some("b"));
        assert_eq!(a.calls(), 1);

        let health = r.health.get("a").unwrap();
        assert_eq!(health.score, 0);
        assert!(health.is_quarantined(Utc::now()));

        // Excluded on the next call even though it is first in config order.
        r.complete(&CompletionRequest::new("q")).await;
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 2);

        let persisted = store.load_health().await.unwrap();
        assert_eq!(persisted.iter().find(|h| h.provider_id == "a").unwrap().score, 0);
        let alerts = store.list_alerts(None, 10).await.unwrap();
        assert!(alerts
            .iter()
            .any(|a| a.alert_type == AlertType::ProviderQuarantined));
    }

    #[tokio::test]
    async fn test_all_fail_returns_fallback() {
        let a = MockProvider::failing("a", transient());
        let b = MockProvider::failing("b", ProviderError::Timeout(Duration::from_secs(1)));
        let r = router(vec![a, b]);

        let out = r.complete(&CompletionRequest::new("q")).await;
        assert!(out.degraded);
        assert_eq!(out.source, CompletionSource::Fallback);
        assert!(!out.text.is_empty());
        assert_eq!(out.attempts, 6);

        let again = r.complete(&CompletionRequest::new("q")).await;
        assert_eq!(again.text, out.text);
    }

    #[tokio::test]
    async fn test_exhaustion_prefers_cached_answer() {
        let a = MockProvider::new(
            "a",
            vec![Ok(Completion::text("first answer")), Err(transient())],
        );
        let r = router(vec![a]);

        let fresh = r.complete(&CompletionRequest::new("same q")).await;
        assert!(!fresh.degraded);

        let cached = r.complete(&CompletionRequest::new("same q ")).await;
        assert!(cached.degraded);
        assert_eq!(cached.source, CompletionSource::Cache);
        assert_eq!(cached.text, "first answer");
        assert_eq!(cached.provider.as_deref(), Some("a"));

        let other = r.complete(&CompletionRequest::new("different q")).await;
        assert_eq!(other.source, CompletionSource::Fallback);
    }

    #[tokio::test]
    async fn test_no_providers_is_degraded_not_error() {
        let r = router(vec![]);
        let out = r.complete(&CompletionRequest::new("q")).await;
        assert!(out.degraded);
        assert_eq!(out.attempts, 0);
    }

    #[tokio::test]
    async fn test_probe_success_earns_bonus() {
        let weak = MockProvider::ok("weak", "recovered");
        let providers: Vec<Arc<dyn Provider>> = vec![weak.clone()];
        let store = MemoryWorkflowStore::new();
        let mut low = ProviderHealth::healthy("weak");
        low.score = 10;
        store.save_health(&low).await.unwrap();

        let r = ProviderRouter::new(providers, instant_policy())
            .unwrap()
            .with_health_store(Arc::new(store))
            .await
            .unwrap();

        // Only candidate, so it is tried as a last resort probe.
        let out = r.complete(&CompletionRequest::new("q")).await;
        assert_eq!(out.text, "recovered");
        assert_eq!(score(&r, "weak"), 30);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let providers: Vec<Arc<dyn Provider>> =
            vec![MockProvider::ok("a", "1"), MockProvider::ok("a", "2")];
        assert!(ProviderRouter::new(providers, RouterPolicy::default()).is_err());
    }

    #[test]
    fn test_fallback_text_is_deterministic() {
        let fp = CompletionRequest::new("x").fingerprint();
        assert_eq!(fallback_text(&fp), fallback_text(&fp));
        assert!(fallback_text("").contains("unavailable"));
    }
}
