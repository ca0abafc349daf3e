//! Adaptive threshold learning.
//!
//! Tracks acceptance outcomes per domain in rolling windows and nudges each
//! domain's confidence threshold toward a target acceptance rate. Every
//! `min_samples` new outcomes the window's acceptance rate is compared with
//! the target band; drift outside it moves the adjustment one step, clamped
//! to ±0.15. The effective threshold handed to the scorer is always clamped
//! to [0.20, 0.90].
//!
//! An optional hard-query memory stores embeddings of queries whose draft was
//! rejected *and* contradicted by the verifier; a later query similar to one
//! of them routes straight to the verifier, skipping the drafter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::classify::Domain;
use crate::config::AdaptiveSettings;
use crate::scorer::{cosine_similarity, Embedder};

/// Hard floor/ceiling for any effective threshold.
const THRESHOLD_FLOOR: f64 = 0.20;
const THRESHOLD_CEILING: f64 = 0.90;
/// Bound on the cumulative per-domain adjustment.
const MAX_ADJUSTMENT: f64 = 0.15;
/// Acceptance-rate band half-width around the target.
const RATE_BAND: f64 = 0.10;

/// A single recorded acceptance outcome.
#[derive(Debug, Clone)]
pub struct OutcomeRecord {
    pub domain: Domain,
    pub confidence: f64,
    pub accepted: bool,
    pub verifier_agreed: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct DomainWindow {
    outcomes: VecDeque<OutcomeRecord>,
    /// Total outcomes ever seen for this domain; drives the adjustment cadence
    /// even once the window is full.
    seen: u64,
}

/// Per-domain learning snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainStats {
    pub acceptance_rate: f64,
    pub samples: usize,
    pub adjustment: f64,
}

/// Controller-wide snapshot for the metrics layer.
#[derive(Debug, Clone)]
pub struct AdaptiveStats {
    pub total_records: u64,
    pub total_adjustments: u64,
    pub target_rate: f64,
    pub domains: Vec<(Domain, DomainStats)>,
    pub hard_queries_stored: usize,
}

/// Rolling-window acceptance tracker with per-domain threshold adjustments.
///
/// Windows are single-writer per domain (the map shards give exclusive access
/// on insert); the adjustment map is read on every scoring decision.
pub struct AdaptiveController {
    settings: AdaptiveSettings,
    windows: DashMap<Domain, DomainWindow>,
    adjustments: DashMap<Domain, f64>,
    total_records: AtomicU64,
    total_adjustments: AtomicU64,
    embedder: Option<Arc<dyn Embedder>>,
    hard_queries: RwLock<VecDeque<(Vec<f32>, Domain)>>,
}

impl AdaptiveController {
    pub fn new(settings: AdaptiveSettings) -> Self {
        Self {
            settings,
            windows: DashMap::new(),
            adjustments: DashMap::new(),
            total_records: AtomicU64::new(0),
            total_adjustments: AtomicU64::new(0),
            embedder: None,
            hard_queries: RwLock::new(VecDeque::new()),
        }
    }

    /// Enable the hard-query memory by plugging in an embedder.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Record one acceptance outcome. When the embedder is configured and the
    /// verifier contradicted a rejected draft, the query embedding is stored
    /// as a confirmed hard query.
    pub async fn record(
        &self,
        domain: Domain,
        confidence: f64,
        accepted: bool,
        verifier_agreed: Option<bool>,
        query: Option<&str>,
    ) {
        let outcome = OutcomeRecord {
            domain,
            confidence,
            accepted,
            verifier_agreed,
            timestamp: Utc::now(),
        };

        {
            let mut window = self.windows.entry(domain).or_default();
            if window.outcomes.len() == self.settings.window_size {
                window.outcomes.pop_front();
            }
            window.outcomes.push_back(outcome);
            window.seen += 1;

            if window.seen % self.settings.min_samples as u64 == 0
                && window.outcomes.len() >= self.settings.min_samples
            {
                self.adjust(domain, &window.outcomes);
            }
        }
        self.total_records.fetch_add(1, Ordering::Relaxed);

        if !accepted && verifier_agreed == Some(false) {
            if let Some(query) = query {
                self.store_hard_query(query, domain).await;
            }
        }
    }

    /// Effective threshold for a domain: `clamp(0.20, 0.90, base + adjustment)`.
    pub fn threshold(&self, domain: Domain, base: f64) -> f64 {
        let adjustment = self.adjustments.get(&domain).map(|a| *a).unwrap_or(0.0);
        (base + adjustment).clamp(THRESHOLD_FLOOR, THRESHOLD_CEILING)
    }

    /// Current adjustment for a domain, for introspection.
    pub fn adjustment(&self, domain: Domain) -> f64 {
        self.adjustments.get(&domain).map(|a| *a).unwrap_or(0.0)
    }

    /// Whether a query resembles one that historically needed the verifier.
    pub async fn is_likely_hard(&self, query: &str) -> bool {
        let Some(embedder) = &self.embedder else {
            return false;
        };
        if self.hard_queries.read().expect("hard-query lock poisoned").is_empty() {
            return false;
        }
        let query_vec = match embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "hard-query embedding failed");
                return false;
            }
        };
        let stored = self.hard_queries.read().expect("hard-query lock poisoned");
        stored
            .iter()
            .any(|(vec, _)| cosine_similarity(&query_vec, vec) >= self.settings.hard_query_similarity)
    }

    pub fn stats(&self) -> AdaptiveStats {
        let mut domains = Vec::new();
        for entry in self.windows.iter() {
            let window = entry.value();
            let total = window.outcomes.len();
            let accepted = window.outcomes.iter().filter(|o| o.accepted).count();
            let rate = if total > 0 { accepted as f64 / total as f64 } else { 0.0 };
            domains.push((
                *entry.key(),
                DomainStats {
                    acceptance_rate: rate,
                    samples: total,
                    adjustment: self.adjustment(*entry.key()),
                },
            ));
        }
        AdaptiveStats {
            total_records: self.total_records.load(Ordering::Relaxed),
            total_adjustments: self.total_adjustments.load(Ordering::Relaxed),
            target_rate: self.settings.target_acceptance_rate,
            domains,
            hard_queries_stored: self
                .hard_queries
                .read()
                .expect("hard-query lock poisoned")
                .len(),
        }
    }

    fn adjust(&self, domain: Domain, outcomes: &VecDeque<OutcomeRecord>) {
        let accepted = outcomes.iter().filter(|o| o.accepted).count();
        let rate = accepted as f64 / outcomes.len() as f64;
        let target = self.settings.target_acceptance_rate;
        let step = self.settings.adjustment_step;

        let mut entry = self.adjustments.entry(domain).or_insert(0.0);
        let current = *entry;

        let new = if rate > target + RATE_BAND {
            tracing::info!(
                domain = %domain,
                rate,
                target,
                "acceptance rate above band, tightening threshold"
            );
            current + step
        } else if rate < target - RATE_BAND {
            tracing::info!(
                domain = %domain,
                rate,
                target,
                "acceptance rate below band, loosening threshold"
            );
            current - step
        } else {
            return;
        };

        *entry = new.clamp(-MAX_ADJUSTMENT, MAX_ADJUSTMENT);
        self.total_adjustments.fetch_add(1, Ordering::Relaxed);
    }

    async fn store_hard_query(&self, query: &str, domain: Domain) {
        let Some(embedder) = &self.embedder else {
            return;
        };
        match embedder.embed(query).await {
            Ok(vec) => {
                let mut stored = self.hard_queries.write().expect("hard-query lock poisoned");
                if stored.len() >= self.settings.hard_query_capacity {
                    stored.pop_front();
                }
                stored.push_back((vec, domain));
            }
            Err(e) => {
                tracing::debug!(error = %e, "storing hard query failed");
            }
        }
    }
}
