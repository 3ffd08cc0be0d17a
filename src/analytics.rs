//! Governance KPI aggregation.
//!
//! Read-side queries over usage and trace records: cost breakdowns, token
//! efficiency, blocking stats, and anomaly flags. Purely derivative — this
//! module never writes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::llm::UsageRecord;
use crate::models::trace::TraceStatus;
use crate::ports::{RequestTracing, StoreResult, UsageRepository};

/// Same `(app, feature)` pair in more than this many of the last
/// [`RETRY_LOOP_WINDOW`] requests flags a retry loop.
const RETRY_LOOP_THRESHOLD: usize = 50;
const RETRY_LOOP_WINDOW: usize = 100;
/// Current-period cost above `baseline × 3` flags a cost spike.
const COST_SPIKE_FACTOR: i64 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct CostBreakdown {
    pub by_app: HashMap<String, Decimal>,
    pub by_feature: HashMap<String, Decimal>,
    pub by_model: HashMap<String, Decimal>,
    pub by_environment: HashMap<String, Decimal>,
    pub total_usd: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenEfficiency {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Output tokens per input token; how much each prompt token yields.
    pub output_per_input: f64,
    pub cost_per_1k_output_usd: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockingStats {
    pub total_requests: usize,
    pub blocked: usize,
    pub errors: usize,
    pub timeouts: usize,
    pub block_rate: f64,
    pub reasons: HashMap<String, usize>,
    pub cost_avoided_usd: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub kind: String,
    pub subject: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernanceReport {
    pub window_hours: i64,
    pub cost: CostBreakdown,
    pub efficiency: TokenEfficiency,
    pub blocking: BlockingStats,
    pub anomalies: Vec<Anomaly>,
}

pub struct GovernanceAnalytics {
    usage: Arc<dyn UsageRepository>,
    tracer: Arc<dyn RequestTracing>,
    /// Error-rate threshold above which the anomaly flag fires.
    pub error_rate_threshold: f64,
}

impl GovernanceAnalytics {
    pub fn new(usage: Arc<dyn UsageRepository>, tracer: Arc<dyn RequestTracing>) -> Self {
        GovernanceAnalytics {
            usage,
            tracer,
            error_rate_threshold: 0.1,
        }
    }

    pub async fn report(&self, window_hours: i64) -> StoreResult<GovernanceReport> {
        let now = Utc::now();
        let window_start = now - Duration::hours(window_hours);
        let baseline_start = window_start - Duration::hours(window_hours);

        let records = self.usage.list_since(baseline_start).await?;
        let traces = self.tracer.list_since(window_start).await?;

        let (current, baseline): (Vec<&UsageRecord>, Vec<&UsageRecord>) =
            records.iter().partition(|r| r.created_at >= window_start);

        let cost = Self::cost_breakdown(&current);
        let efficiency = Self::token_efficiency(&current, cost.total_usd);
        let blocking = Self::blocking_stats(&traces);
        let anomalies = self.anomalies(&current, &baseline, &traces, cost.total_usd);

        Ok(GovernanceReport {
            window_hours,
            cost,
            efficiency,
            blocking,
            anomalies,
        })
    }

    fn cost_breakdown(records: &[&UsageRecord]) -> CostBreakdown {
        let mut by_app: HashMap<String, Decimal> = HashMap::new();
        let mut by_feature: HashMap<String, Decimal> = HashMap::new();
        let mut by_model: HashMap<String, Decimal> = HashMap::new();
        let mut by_environment: HashMap<String, Decimal> = HashMap::new();
        let mut total = Decimal::ZERO;

        for record in records {
            total += record.cost_usd;
            *by_app.entry(record.app_id.clone()).or_default() += record.cost_usd;
            let feature = record.feature.clone().unwrap_or_else(|| "(none)".to_string());
            *by_feature.entry(feature).or_default() += record.cost_usd;
            *by_model.entry(record.model.clone()).or_default() += record.cost_usd;
            *by_environment.entry(record.environment.clone()).or_default() += record.cost_usd;
        }

        CostBreakdown {
            by_app,
            by_feature,
            by_model,
            by_environment,
            total_usd: total,
        }
    }

    fn token_efficiency(records: &[&UsageRecord], total_cost: Decimal) -> TokenEfficiency {
        let total_input: u64 = records.iter().map(|r| r.input_tokens as u64).sum();
        let total_output: u64 = records.iter().map(|r| r.output_tokens as u64).sum();

        let output_per_input = if total_input > 0 {
            total_output as f64 / total_input as f64
        } else {
            0.0
        };
        let cost_per_1k_output = if total_output > 0 {
            total_cost * Decimal::from(1000) / Decimal::from(total_output)
        } else {
            Decimal::ZERO
        };

        TokenEfficiency {
            total_input_tokens: total_input,
            total_output_tokens: total_output,
            output_per_input,
            cost_per_1k_output_usd: cost_per_1k_output,
        }
    }

    fn blocking_stats(traces: &[crate::models::trace::RequestTrace]) -> BlockingStats {
        let mut blocked = 0;
        let mut errors = 0;
        let mut timeouts = 0;
        let mut reasons: HashMap<String, usize> = HashMap::new();
        let mut cost_avoided = Decimal::ZERO;

        for trace in traces {
            match trace.status {
                TraceStatus::Blocked => {
                    blocked += 1;
                    cost_avoided += trace.estimated_cost_avoided;
                    for reason in &trace.decision_reasons {
                        // Reasons are "step: detail"; aggregate on the step
                        let key = reason
                            .split(':')
                            .next()
                            .unwrap_or("unknown")
                            .trim()
                            .to_string();
                        *reasons.entry(key).or_default() += 1;
                    }
                }
                TraceStatus::Error => errors += 1,
                TraceStatus::Timeout => timeouts += 1,
                _ => {}
            }
        }

        let total = traces.len();
        BlockingStats {
            total_requests: total,
            blocked,
            errors,
            timeouts,
            block_rate: if total > 0 { blocked as f64 / total as f64 } else { 0.0 },
            reasons,
            cost_avoided_usd: cost_avoided,
        }
    }

    fn anomalies(
        &self,
        current: &[&UsageRecord],
        baseline: &[&UsageRecord],
        traces: &[crate::models::trace::RequestTrace],
        current_cost: Decimal,
    ) -> Vec<Anomaly> {
        let mut anomalies = vec![];

        // Cost spike: current period > 3× previous period of equal length
        let baseline_cost: Decimal = baseline.iter().map(|r| r.cost_usd).sum();
        if baseline_cost > Decimal::ZERO && current_cost > baseline_cost * Decimal::from(COST_SPIKE_FACTOR)
        {
            anomalies.push(Anomaly {
                kind: "cost_spike".to_string(),
                subject: "gateway".to_string(),
                detail: format!(
                    "current cost ${} exceeds {}x baseline ${}",
                    current_cost, COST_SPIKE_FACTOR, baseline_cost
                ),
            });
        }

        // Retry loop: same (app, feature) dominating the recent requests
        let mut recent: Vec<&&UsageRecord> = current.iter().collect();
        recent.sort_by_key(|r| r.created_at);
        let tail: Vec<&&UsageRecord> = recent.iter().rev().take(RETRY_LOOP_WINDOW).copied().collect();
        let mut pair_counts: HashMap<(String, String), usize> = HashMap::new();
        for record in &tail {
            let key = (
                record.app_id.clone(),
                record.feature.clone().unwrap_or_default(),
            );
            *pair_counts.entry(key).or_default() += 1;
        }
        for ((app, feature), count) in pair_counts {
            if count > RETRY_LOOP_THRESHOLD {
                anomalies.push(Anomaly {
                    kind: "retry_loop".to_string(),
                    subject: format!("{}/{}", app, feature),
                    detail: format!("{} of the last {} requests", count, tail.len()),
                });
            }
        }

        // High error rate over the window
        let total = traces.len();
        if total > 0 {
            let errors = traces
                .iter()
                .filter(|t| t.status == TraceStatus::Error)
                .count();
            let rate = errors as f64 / total as f64;
            if rate > self.error_rate_threshold {
                anomalies.push(Anomaly {
                    kind: "high_error_rate".to_string(),
                    subject: "gateway".to_string(),
                    detail: format!("{:.1}% of {} traces errored", rate * 100.0, total),
                });
            }
        }

        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn record(app: &str, feature: Option<&str>, model: &str, cost: &str, ago: Duration) -> UsageRecord {
        UsageRecord {
            request_id: uuid::Uuid::new_v4().to_string(),
            app_id: app.into(),
            feature: feature.map(String::from),
            environment: "production".into(),
            provider: "openai".into(),
            model: model.into(),
            input_tokens: 100,
            output_tokens: 50,
            cost_usd: d(cost),
            latency_ms: 200,
            created_at: Utc::now() - ago,
        }
    }

    async fn seed(store: &InMemoryStore, records: Vec<UsageRecord>) {
        for r in records {
            crate::ports::UsageRepository::record(store, &r).await.unwrap();
        }
    }

    fn analytics(store: Arc<InMemoryStore>) -> GovernanceAnalytics {
        GovernanceAnalytics::new(store.clone(), store)
    }

    #[tokio::test]
    async fn test_cost_breakdown() {
        let store = Arc::new(InMemoryStore::new());
        seed(
            &store,
            vec![
                record("app-a", Some("chat"), "gpt-4o", "1.00", Duration::minutes(5)),
                record("app-a", Some("search"), "gpt-4o-mini", "0.25", Duration::minutes(10)),
                record("app-b", None, "claude-3-opus", "2.00", Duration::minutes(15)),
            ],
        )
        .await;

        let report = analytics(store).report(1).await.unwrap();
        assert_eq!(report.cost.total_usd, d("3.25"));
        assert_eq!(report.cost.by_app["app-a"], d("1.25"));
        assert_eq!(report.cost.by_app["app-b"], d("2.00"));
        assert_eq!(report.cost.by_feature["(none)"], d("2.00"));
        assert_eq!(report.cost.by_model["gpt-4o"], d("1.00"));
    }

    #[tokio::test]
    async fn test_token_efficiency() {
        let store = Arc::new(InMemoryStore::new());
        seed(
            &store,
            vec![record("app-a", None, "gpt-4o", "1.00", Duration::minutes(5))],
        )
        .await;

        let report = analytics(store).report(1).await.unwrap();
        assert_eq!(report.efficiency.total_input_tokens, 100);
        assert_eq!(report.efficiency.total_output_tokens, 50);
        assert!((report.efficiency.output_per_input - 0.5).abs() < 1e-9);
        assert_eq!(report.efficiency.cost_per_1k_output_usd, d("20"));
    }

    #[tokio::test]
    async fn test_cost_spike_anomaly() {
        let store = Arc::new(InMemoryStore::new());
        seed(
            &store,
            vec![
                // Baseline period: cheap
                record("app-a", None, "gpt-4o", "0.10", Duration::minutes(90)),
                // Current period: 10x
                record("app-a", None, "gpt-4o", "1.00", Duration::minutes(10)),
            ],
        )
        .await;

        let report = analytics(store).report(1).await.unwrap();
        assert!(report.anomalies.iter().any(|a| a.kind == "cost_spike"));
    }

    #[tokio::test]
    async fn test_no_spike_when_stable() {
        let store = Arc::new(InMemoryStore::new());
        seed(
            &store,
            vec![
                record("app-a", None, "gpt-4o", "1.00", Duration::minutes(90)),
                record("app-a", None, "gpt-4o", "1.10", Duration::minutes(10)),
            ],
        )
        .await;

        let report = analytics(store).report(1).await.unwrap();
        assert!(report.anomalies.iter().all(|a| a.kind != "cost_spike"));
    }

    #[tokio::test]
    async fn test_retry_loop_anomaly() {
        let store = Arc::new(InMemoryStore::new());
        let mut records = vec![];
        for _ in 0..60 {
            records.push(record("app-a", Some("chat"), "gpt-4o-mini", "0.01", Duration::minutes(5)));
        }
        seed(&store, records).await;

        let report = analytics(store).report(1).await.unwrap();
        let loop_anomaly = report
            .anomalies
            .iter()
            .find(|a| a.kind == "retry_loop")
            .unwrap();
        assert_eq!(loop_anomaly.subject, "app-a/chat");
    }

    #[tokio::test]
    async fn test_empty_window() {
        let store = Arc::new(InMemoryStore::new());
        let report = analytics(store).report(1).await.unwrap();
        assert_eq!(report.cost.total_usd, Decimal::ZERO);
        assert_eq!(report.blocking.total_requests, 0);
        assert!(report.anomalies.is_empty());
    }
}
