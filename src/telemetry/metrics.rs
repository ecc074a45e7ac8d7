//! Prometheus counters for decoded CDRs.
//!
//! One registry per process, created by the supervisor before any worker
//! starts. Label combinations are created lazily on first observation.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::cdr::Cdr;

const NAMESPACE: &str = "yaacc";

const DIRECTION_INBOUND: &str = "inbound";
const DIRECTION_OUTBOUND: &str = "outbound";

/// CDR counter set and its registry.
#[derive(Clone)]
pub struct CdrMetrics {
    registry: Registry,
    cdr_count: IntCounterVec,
    vdn_count: IntCounterVec,
    vdn_duration: IntCounterVec,
    trunk_count: IntCounterVec,
    trunk_duration: IntCounterVec,
    err_count: IntCounterVec,
    store_err_count: IntCounterVec,
    connections_total: IntCounterVec,
    connections_active: IntGauge,
}

impl CdrMetrics {
    /// Create the counter set on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let metrics = Self {
            cdr_count: counter_vec("cdr_count", "Decoded CDRs per source", &["source"])?,
            vdn_count: counter_vec(
                "cdr_vdn_count",
                "Calls through a VDN",
                &["source", "trunk", "vdn"],
            )?,
            vdn_duration: counter_vec(
                "cdr_vdn_duration",
                "Seconds of calls through a VDN",
                &["source", "trunk", "vdn"],
            )?,
            trunk_count: counter_vec(
                "cdr_trunk_count",
                "Calls per trunk and direction",
                &["source", "trunk", "direction"],
            )?,
            trunk_duration: counter_vec(
                "cdr_trunk_duration",
                "Seconds of calls per trunk and direction",
                &["source", "trunk", "direction"],
            )?,
            err_count: counter_vec("cdr_err_count", "Lines that failed to decode", &["source"])?,
            store_err_count: counter_vec(
                "cdr_store_err_count",
                "CDRs the store failed to persist",
                &["source"],
            )?,
            connections_total: counter_vec(
                "connections_total",
                "PBX connections accepted",
                &["source"],
            )?,
            connections_active: IntGauge::with_opts(
                Opts::new("connections_active", "PBX connections currently open")
                    .namespace(NAMESPACE),
            )?,
            registry,
        };

        metrics.register_all()?;
        Ok(metrics)
    }

    fn register_all(&self) -> Result<(), prometheus::Error> {
        for counter in [
            &self.cdr_count,
            &self.vdn_count,
            &self.vdn_duration,
            &self.trunk_count,
            &self.trunk_duration,
            &self.err_count,
            &self.store_err_count,
            &self.connections_total,
        ] {
            self.registry.register(Box::new(counter.clone()))?;
        }
        self.registry
            .register(Box::new(self.connections_active.clone()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Update counters for one decoded record.
    pub fn observe(&self, cdr: &Cdr) {
        let source = cdr.source.as_str();
        let duration = u64::from(cdr.duration);

        self.cdr_count.with_label_values(&[source]).inc();

        if !cdr.vdn.is_empty() {
            let labels = [source, cdr.in_trk.as_str(), cdr.vdn.as_str()];
            self.vdn_count.with_label_values(&labels).inc();
            self.vdn_duration.with_label_values(&labels).inc_by(duration);
        }

        if !cdr.code_used.is_empty() {
            let labels = [source, cdr.code_used.as_str(), DIRECTION_OUTBOUND];
            self.trunk_count.with_label_values(&labels).inc();
            self.trunk_duration.with_label_values(&labels).inc_by(duration);
        }

        if !cdr.in_trk.is_empty() {
            let labels = [source, cdr.in_trk.as_str(), DIRECTION_INBOUND];
            self.trunk_count.with_label_values(&labels).inc();
            self.trunk_duration.with_label_values(&labels).inc_by(duration);
        }
    }

    pub fn decode_error(&self, source: &str) {
        self.err_count.with_label_values(&[source]).inc();
    }

    pub fn store_error(&self, source: &str) {
        self.store_err_count.with_label_values(&[source]).inc();
    }

    pub fn connection_opened(&self, source: &str) {
        self.connections_total.with_label_values(&[source]).inc();
        self.connections_active.inc();
    }

    pub fn connection_closed(&self) {
        self.connections_active.dec();
    }

    /// Current value of a sample, `None` if the series does not exist yet.
    ///
    /// `name` is the full metric name; `labels` must match the series
    /// exactly.
    pub fn sample(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric())
            .find(|metric| {
                let pairs = metric.get_label();
                pairs.len() == labels.len()
                    && labels.iter().all(|(k, v)| {
                        pairs
                            .iter()
                            .any(|p| p.get_name() == *k && p.get_value() == *v)
                    })
            })
            .map(|metric| {
                if metric.has_counter() {
                    metric.get_counter().get_value() as u64
                } else {
                    metric.get_gauge().get_value() as u64
                }
            })
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec, prometheus::Error> {
    IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
}
