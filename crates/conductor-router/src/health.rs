use crate::config::RouterPolicy;
use chrono::{DateTime, Utc};
use conductor_core::ProviderHealth;
use parking_lot::Mutex;
use std::collections::HashMap;

/// One provider slot in a call's plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub provider_id: String,
    /// Chosen despite low health; a success earns the probe bonus.
    pub probe: bool,
}

/// Shared health-score map.
///
/// Every update happens under one lock and returns the new record, so each
/// provider's score changes atomically and the caller can persist exactly
/// what was applied.
pub struct HealthTracker {
    /// Configuration order, used to break score ties.
    order: Vec<String>,
    scores: Mutex<HashMap<String, ProviderHealth>>,
}

impl HealthTracker {
    /// Track `provider_ids`, seeding from persisted records where present.
    ///
    /// Persisted records for providers no longer configured are ignored.
    pub fn new(provider_ids: Vec<String>, persisted: Vec<ProviderHealth>) -> Self {
        let mut persisted: HashMap<String, ProviderHealth> = persisted
            .into_iter()
            .map(|h| (h.provider_id.clone(), h))
            .collect();
        let scores = provider_ids
            .iter()
            .map(|id| {
                let health = persisted
                    .remove(id)
                    .unwrap_or_else(|| ProviderHealth::healthy(id.clone()));
                (id.clone(), health)
            })
            .collect();
        Self {
            order: provider_ids,
            scores: Mutex::new(scores),
        }
    }

    /// Current records in configuration order.
    pub fn snapshot(&self) -> Vec<ProviderHealth> {
        let scores = self.scores.lock();
        self.order
            .iter()
            .filter_map(|id| scores.get(id).cloned())
            .collect()
    }

    /// One provider's record.
    pub fn get(&self, provider_id: &str) -> Option<ProviderHealth> {
        self.scores.lock().get(provider_id).cloned()
    }

    /// Order providers for one call.
    ///
    /// Quarantined providers are left out. Healthy providers come first by
    /// descending score; a low-health provider joins when `draw()` falls below
    /// the probe probability, or unconditionally when nothing healthy remains.
    pub fn plan(
        &self,
        policy: &RouterPolicy,
        now: DateTime<Utc>,
        mut draw: impl FnMut() -> f64,
    ) -> Vec<Candidate> {
        let scores = self.scores.lock();
        let mut eligible: Vec<(usize, u8)> = self
            .order
            .iter()
            .enumerate()
            .filter_map(|(idx, id)| {
                let h = scores.get(id)?;
                (!h.is_quarantined(now)).then_some((idx, h.score))
            })
            .collect();
        // Stable: equal scores keep configuration order.
        eligible.sort_by(|a, b| b.1.cmp(&a.1));

        let (healthy, low): (Vec<_>, Vec<_>) = eligible
            .into_iter()
            .partition(|(_, score)| *score >= policy.low_health_threshold);

        let last_resort = healthy.is_empty();
        let mut plan: Vec<Candidate> = healthy
            .into_iter()
            .map(|(idx, _)| Candidate {
                provider_id: self.order[idx].clone(),
                probe: false,
            })
            .collect();
        for (idx, _) in low {
            if last_resort || draw() < policy.probe_probability {
                plan.push(Candidate {
                    provider_id: self.order[idx].clone(),
                    probe: true,
                });
            }
        }
        plan
    }

    /// Apply a success. Probes earn the bonus instead of the normal delta.
    pub fn record_success(
        &self,
        provider_id: &str,
        policy: &RouterPolicy,
        probe: bool,
    ) -> Option<ProviderHealth> {
        let delta = if probe {
            policy.probe_success_bonus
        } else {
            policy.success_delta
        };
        self.update(provider_id, |h| {
            h.quarantine_until = None;
            h.adjust(i16::from(delta));
        })
    }

    /// Apply one failed attempt.
    pub fn record_failure(&self, provider_id: &str, policy: &RouterPolicy) -> Option<ProviderHealth> {
        self.update(provider_id, |h| h.adjust(-i16::from(policy.failure_penalty)))
    }

    /// Force the score to zero and exclude the provider until `until`.
    pub fn quarantine(&self, provider_id: &str, until: DateTime<Utc>) -> Option<ProviderHealth> {
        self.update(provider_id, |h| {
            h.score = 0;
            h.quarantine_until = Some(until);
            h.updated_at = Utc::now();
        })
    }

    fn update(
        &self,
        provider_id: &str,
        f: impl FnOnce(&mut ProviderHealth),
    ) -> Option<ProviderHealth> {
        let mut scores = self.scores.lock();
        let health = scores.get_mut(provider_id)?;
        f(health);
        Some(health.clone())
    }
}
