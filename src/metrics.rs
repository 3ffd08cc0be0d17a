//! Prometheus metrics recorder.
//!
//! Exposes request counters, decision counters by source, token/cost
//! counters, and a latency histogram. All recording is non-blocking and
//! best-effort; a metrics failure never surfaces to the client.

use prometheus::{
    opts, register_counter_vec, register_histogram_vec, register_int_gauge_vec, CounterVec,
    Encoder, HistogramVec, IntGaugeVec, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::ports::MetricsSink;

pub struct PrometheusRecorder {
    requests_total: CounterVec,
    decisions_total: CounterVec,
    tokens_total: CounterVec,
    cost_usd_total: CounterVec,
    errors_total: CounterVec,
    timeouts_total: CounterVec,
    request_duration_seconds: HistogramVec,
    in_flight: IntGaugeVec,
}

impl PrometheusRecorder {
    pub fn new() -> Self {
        let requests_total = register_counter_vec!(
            opts!("gateway_requests_total", "Total requests by app, model, and status"),
            &["app", "model", "status"]
        )
        .expect("failed to register gateway_requests_total");

        let decisions_total = register_counter_vec!(
            opts!("gateway_decisions_total", "Governance decisions by outcome and source"),
            &["app", "decision", "source"]
        )
        .expect("failed to register gateway_decisions_total");

        let tokens_total = register_counter_vec!(
            opts!("gateway_tokens_total", "Total tokens by model and direction"),
            &["model", "type"]
        )
        .expect("failed to register gateway_tokens_total");

        let cost_usd_total = register_counter_vec!(
            opts!("gateway_cost_usd_total", "Total committed cost in USD"),
            &["app", "model"]
        )
        .expect("failed to register gateway_cost_usd_total");

        let errors_total = register_counter_vec!(
            opts!("gateway_errors_total", "Errors by app and kind"),
            &["app", "kind"]
        )
        .expect("failed to register gateway_errors_total");

        let timeouts_total = register_counter_vec!(
            opts!("gateway_timeouts_total", "Provider timeouts by app and model"),
            &["app", "model"]
        )
        .expect("failed to register gateway_timeouts_total");

        let request_duration_seconds = register_histogram_vec!(
            prometheus::histogram_opts!(
                "gateway_request_duration_seconds",
                "Request latency in seconds",
                vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
            ),
            &["model", "status"]
        )
        .expect("failed to register gateway_request_duration_seconds");

        let in_flight = register_int_gauge_vec!(
            opts!("gateway_in_flight_requests", "Requests currently being processed"),
            &["app"]
        )
        .expect("failed to register gateway_in_flight_requests");

        PrometheusRecorder {
            requests_total,
            decisions_total,
            tokens_total,
            cost_usd_total,
            errors_total,
            timeouts_total,
            request_duration_seconds,
            in_flight,
        }
    }
}

impl Default for PrometheusRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PrometheusRecorder {
    fn request_started(&self, app_id: &str) {
        self.in_flight.with_label_values(&[app_id]).inc();
    }

    fn request_finished(&self, app_id: &str) {
        self.in_flight.with_label_values(&[app_id]).dec();
    }

    fn record_request(
        &self,
        app_id: &str,
        model: &str,
        status: &str,
        latency_seconds: f64,
        input_tokens: u32,
        output_tokens: u32,
        cost_usd: Decimal,
    ) {
        self.requests_total
            .with_label_values(&[app_id, model, status])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[model, status])
            .observe(latency_seconds);
        if input_tokens > 0 {
            self.tokens_total
                .with_label_values(&[model, "input"])
                .inc_by(input_tokens as f64);
        }
        if output_tokens > 0 {
            self.tokens_total
                .with_label_values(&[model, "output"])
                .inc_by(output_tokens as f64);
        }
        if let Some(cost) = cost_usd.to_f64() {
            if cost > 0.0 {
                self.cost_usd_total
                    .with_label_values(&[app_id, model])
                    .inc_by(cost);
            }
        }
    }

    fn record_decision(&self, app_id: &str, decision: &str, source: &str) {
        self.decisions_total
            .with_label_values(&[app_id, decision, source])
            .inc();
    }

    fn record_error(&self, app_id: &str, kind: &str) {
        self.errors_total.with_label_values(&[app_id, kind]).inc();
    }

    fn record_timeout(&self, app_id: &str, model: &str) {
        self.timeouts_total
            .with_label_values(&[app_id, model])
            .inc();
    }
}

/// Encode all registered metrics as Prometheus text, for the `/metrics`
/// endpoint.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics_is_text() {
        let output = encode_metrics();
        assert!(output.is_ascii() || output.is_empty());
    }
}
