//! Pull-style metrics for the cascade core.
//!
//! Counters and histograms are updated on every finalized request and exposed
//! through a passive, read-only interface — the core owns no HTTP endpoint.
//! Family names are wire-stable:
//!
//! - `cf_requests_total{strategy,domain}`
//! - `cf_draft_accepted_total{domain}`
//! - `cf_cost_usd_total{model}`
//! - `cf_latency_ms{stage}` histogram, `stage ∈ draft|verify|total`

use dashmap::DashMap;

use crate::classify::Domain;
use crate::router::Strategy;

/// Histogram bucket upper bounds, milliseconds.
const LATENCY_BUCKETS_MS: [f64; 12] = [
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0,
];

/// Latency stage labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyStage {
    Draft,
    Verify,
    Total,
}

impl LatencyStage {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Verify => "verify",
            Self::Total => "total",
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Histogram {
    bucket_counts: [u64; LATENCY_BUCKETS_MS.len()],
    count: u64,
    sum: f64,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if value <= *bound {
                self.bucket_counts[i] += 1;
            }
        }
        self.count += 1;
        self.sum += value;
    }

    /// Approximate quantile from bucket boundaries.
    fn quantile(&self, q: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let rank = (q * self.count as f64).ceil() as u64;
        for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if self.bucket_counts[i] >= rank {
                return *bound;
            }
        }
        LATENCY_BUCKETS_MS[LATENCY_BUCKETS_MS.len() - 1]
    }
}

/// Shared metrics registry. Cheap to clone behind an `Arc`.
#[derive(Default)]
pub struct MetricsRegistry {
    requests: DashMap<(Strategy, Domain), u64>,
    draft_accepted: DashMap<Domain, u64>,
    cost_usd: DashMap<String, f64>,
    latency: DashMap<LatencyStage, Histogram>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, strategy: Strategy, domain: Domain) {
        *self.requests.entry((strategy, domain)).or_insert(0) += 1;
    }

    pub fn record_draft_accepted(&self, domain: Domain) {
        *self.draft_accepted.entry(domain).or_insert(0) += 1;
    }

    pub fn record_cost(&self, model: &str, cost: f64) {
        if cost > 0.0 {
            *self.cost_usd.entry(model.to_string()).or_insert(0.0) += cost;
        }
    }

    pub fn record_latency(&self, stage: LatencyStage, millis: f64) {
        self.latency.entry(stage).or_default().observe(millis);
    }

    pub fn requests_total(&self) -> u64 {
        self.requests.iter().map(|e| *e.value()).sum()
    }

    pub fn draft_accepted_total(&self, domain: Domain) -> u64 {
        self.draft_accepted.get(&domain).map(|v| *v).unwrap_or(0)
    }

    pub fn cost_total(&self) -> f64 {
        self.cost_usd.iter().map(|e| *e.value()).sum()
    }

    /// Approximate latency quantile for a stage (p in [0, 1]).
    pub fn latency_quantile(&self, stage: LatencyStage, p: f64) -> f64 {
        self.latency
            .get(&stage)
            .map(|h| h.quantile(p))
            .unwrap_or(0.0)
    }

    /// Render the registry in Prometheus text exposition format. Rows are
    /// sorted by label so scrapes are diff-stable.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        out.push_str("# HELP cf_requests_total Requests processed, by strategy and domain.\n");
        out.push_str("# TYPE cf_requests_total counter\n");
        let mut request_rows: Vec<(String, u64)> = self
            .requests
            .iter()
            .map(|e| {
                let ((strategy, domain), count) = (e.key().clone(), *e.value());
                (
                    format!(
                        "cf_requests_total{{strategy=\"{}\",domain=\"{}\"}}",
                        strategy.as_str(),
                        domain.as_str()
                    ),
                    count,
                )
            })
            .collect();
        request_rows.sort();
        for (label, count) in request_rows {
            out.push_str(&format!("{label} {count}\n"));
        }
        out.push('\n');

        out.push_str("# HELP cf_draft_accepted_total Drafts accepted without verification, by domain.\n");
        out.push_str("# TYPE cf_draft_accepted_total counter\n");
        let mut accepted_rows: Vec<(String, u64)> = self
            .draft_accepted
            .iter()
            .map(|e| {
                (
                    format!("cf_draft_accepted_total{{domain=\"{}\"}}", e.key().as_str()),
                    *e.value(),
                )
            })
            .collect();
        accepted_rows.sort();
        for (label, count) in accepted_rows {
            out.push_str(&format!("{label} {count}\n"));
        }
        out.push('\n');

        out.push_str("# HELP cf_cost_usd_total Cumulative spend in USD, by model.\n");
        out.push_str("# TYPE cf_cost_usd_total counter\n");
        let mut cost_rows: Vec<(String, f64)> = self
            .cost_usd
            .iter()
            .map(|e| {
                (
                    format!("cf_cost_usd_total{{model=\"{}\"}}", e.key()),
                    *e.value(),
                )
            })
            .collect();
        cost_rows.sort_by(|a, b| a.0.cmp(&b.0));
        for (label, value) in cost_rows {
            out.push_str(&format!("{label} {value:.6}\n"));
        }
        out.push('\n');

        out.push_str("# HELP cf_latency_ms Stage latency in milliseconds.\n");
        out.push_str("# TYPE cf_latency_ms histogram\n");
        let mut stages: Vec<LatencyStage> = self.latency.iter().map(|e| *e.key()).collect();
        stages.sort_by_key(|s| s.as_str());
        for stage in stages {
            let Some(histogram) = self.latency.get(&stage) else { continue };
            let stage_label = stage.as_str();
            for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
                out.push_str(&format!(
                    "cf_latency_ms_bucket{{stage=\"{stage_label}\",le=\"{bound}\"}} {}\n",
                    histogram.bucket_counts[i]
                ));
            }
            out.push_str(&format!(
                "cf_latency_ms_bucket{{stage=\"{stage_label}\",le=\"+Inf\"}} {}\n",
                histogram.count
            ));
            out.push_str(&format!(
                "cf_latency_ms_sum{{stage=\"{stage_label}\"}} {}\n",
                histogram.sum
            ));
            out.push_str(&format!(
                "cf_latency_ms_count{{stage=\"{stage_label}\"}} {}\n",
                histogram.count
            ));
        }

        out
    }
}
