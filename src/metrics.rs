//! Prometheus metrics for the hub, on a registry owned by the process rather than the global one.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub const DROP_OFFLINE: &str = "offline";
pub const DROP_SLOW_CONSUMER: &str = "slow_consumer";
pub const DROP_CLOSED: &str = "closed";

#[derive(Clone)]
pub struct HubMetrics {
    registry: Registry,
    pub connections: IntGauge,
    pub frames_delivered: IntCounter,
    pub frames_dropped: IntCounterVec,
    pub slow_consumer_disconnects: IntCounter,
    pub protocol_errors: IntCounter,
    pub persistence_failures: IntCounter,
}

impl HubMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let connections = IntGauge::new("hub_connections", "Live hub connections")?;
        let frames_delivered = IntCounter::new(
            "hub_frames_delivered_total",
            "Frames enqueued onto an outbound queue",
        )?;
        let frames_dropped = IntCounterVec::new(
            Opts::new("hub_frames_dropped_total", "Live deliveries that were dropped"),
            &["reason"],
        )?;
        let slow_consumer_disconnects = IntCounter::new(
            "hub_slow_consumer_disconnects_total",
            "Connections torn down because their outbound queue was full",
        )?;
        let protocol_errors =
            IntCounter::new("hub_protocol_errors_total", "Inbound frames rejected")?;
        let persistence_failures = IntCounter::new(
            "hub_persistence_failures_total",
            "Storage calls from the hub that failed",
        )?;

        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(frames_delivered.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(slow_consumer_disconnects.clone()))?;
        registry.register(Box::new(protocol_errors.clone()))?;
        registry.register(Box::new(persistence_failures.clone()))?;

        Ok(Self {
            registry,
            connections,
            frames_delivered,
            frames_dropped,
            slow_consumer_disconnects,
            protocol_errors,
            persistence_failures,
        })
    }

    pub fn dropped(&self, reason: &str) {
        self.frames_dropped.with_label_values(&[reason]).inc();
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
