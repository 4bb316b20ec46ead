//! Prometheus metrics behind an explicit `Registry` (not a global
//! `lazy_static!` one) -- the canceler's `server.rs::Metrics` shape rather
//! than the operator's global registry, since an explicit registry is
//! easier to construct fresh per test. Metric *names* are ambient
//! infrastructure; per-route labels are out of scope (that's the HTTP
//! router's business, not this crate's).

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    pub registry: Registry,
    pub deposits_credited: IntCounter,
    pub risk_blocks: IntCounter,
    pub risk_warns: IntCounter,
    pub active_streams: IntGauge,
    pub active_escrows: IntGauge,
    pub gateway_calls: IntCounter,
    pub scheduler_tick_failures: IntCounter,
    pub call_latency_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let deposits_credited = IntCounter::new("alancoin_deposits_credited_total", "Deposits credited by the watcher").unwrap();
        let risk_blocks = IntCounter::new("alancoin_risk_blocks_total", "Transactions blocked by the risk engine").unwrap();
        let risk_warns = IntCounter::new("alancoin_risk_warns_total", "Transactions flagged warn by the risk engine").unwrap();
        let active_streams = IntGauge::new("alancoin_active_streams", "Currently open streaming payments").unwrap();
        let active_escrows = IntGauge::new("alancoin_active_escrows", "Currently open escrow locks").unwrap();
        let gateway_calls = IntCounter::new("alancoin_gateway_calls_total", "Gateway proxy calls forwarded").unwrap();
        let scheduler_tick_failures = IntCounter::new("alancoin_scheduler_tick_failures_total", "Failed scheduler ticks").unwrap();
        let call_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "alancoin_gateway_call_latency_seconds",
            "Gateway proxy call latency",
        ))
        .unwrap();

        registry.register(Box::new(deposits_credited.clone())).unwrap();
        registry.register(Box::new(risk_blocks.clone())).unwrap();
        registry.register(Box::new(risk_warns.clone())).unwrap();
        registry.register(Box::new(active_streams.clone())).unwrap();
        registry.register(Box::new(active_escrows.clone())).unwrap();
        registry.register(Box::new(gateway_calls.clone())).unwrap();
        registry.register(Box::new(scheduler_tick_failures.clone())).unwrap();
        registry.register(Box::new(call_latency_seconds.clone())).unwrap();

        Metrics {
            registry,
            deposits_credited,
            risk_blocks,
            risk_warns,
            active_streams,
            active_escrows,
            gateway_calls,
            scheduler_tick_failures,
            call_latency_seconds,
        }
    }

    pub fn encode(&self) -> String {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf).expect("prometheus encoding cannot fail for well-formed metrics");
        String::from_utf8(buf).expect("prometheus text output is always valid utf8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_registered_metric_names() {
        let metrics = Metrics::new();
        metrics.deposits_credited.inc();
        metrics.risk_blocks.inc_by(3);
        let text = metrics.encode();
        assert!(text.contains("alancoin_deposits_credited_total 1"));
        assert!(text.contains("alancoin_risk_blocks_total 3"));
    }
}
