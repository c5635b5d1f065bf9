//! Prometheus metrics for the gateway, served as text at `GET /metrics`.
//!
//! Counters and the session gauge are updated where things happen. Pool and
//! slot gauges are sampled when the registry is scraped.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use super::pool::PoolStats;

// -----------------------------------------------------------------------------
// ----- GatewayMetrics --------------------------------------------------------

#[derive(Clone)]
pub struct GatewayMetrics {
    /// HTTP requests by route and status code.
    pub http_requests_total: IntCounterVec,
    pub sessions_active: IntGauge,
    /// Finished sessions by how they ended.
    pub sessions_ended_total: IntCounterVec,
    /// Refused admissions: `busy` (429) or `backend` (503).
    pub admission_rejections_total: IntCounterVec,
    pub pool_idle_connections: IntGauge,
    pub pool_dials_total: IntGauge,
    pub slots_free: IntGauge,
    registry: Registry,
}

// -----------------------------------------------------------------------------
// ----- GatewayMetrics: Static ------------------------------------------------

impl GatewayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let http_requests_total = IntCounterVec::new(
            Opts::new("voicegate_http_requests_total", "HTTP requests handled"),
            &["path", "status"],
        )?;

        let sessions_active =
            IntGauge::new("voicegate_sessions_active", "Sessions currently relaying")?;

        let sessions_ended_total = IntCounterVec::new(
            Opts::new("voicegate_sessions_ended_total", "Sessions finished, by cause"),
            &["reason"],
        )?;

        let admission_rejections_total = IntCounterVec::new(
            Opts::new(
                "voicegate_admission_rejections_total",
                "Session requests refused before upgrade",
            ),
            &["reason"],
        )?;

        let pool_idle_connections = IntGauge::new(
            "voicegate_pool_idle_connections",
            "Backend connections waiting in the pool",
        )?;

        let pool_dials_total = IntGauge::new(
            "voicegate_pool_dials_total",
            "Backend connections dialed since start",
        )?;

        let slots_free = IntGauge::new("voicegate_slots_free", "Slots not held by a session")?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(sessions_ended_total.clone()))?;
        registry.register(Box::new(admission_rejections_total.clone()))?;
        registry.register(Box::new(pool_idle_connections.clone()))?;
        registry.register(Box::new(pool_dials_total.clone()))?;
        registry.register(Box::new(slots_free.clone()))?;

        Ok(Self {
            http_requests_total,
            sessions_active,
            sessions_ended_total,
            admission_rejections_total,
            pool_idle_connections,
            pool_dials_total,
            slots_free,
            registry,
        })
    }
}

// -----------------------------------------------------------------------------
// ----- GatewayMetrics: Public ------------------------------------------------

impl GatewayMetrics {
    pub fn record_request(&self, path: &str, status: u16) {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[path, status.as_str()])
            .inc();
    }

    pub fn record_rejection(&self, reason: &str) {
        self.admission_rejections_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn record_session_start(&self) {
        self.sessions_active.inc();
    }

    pub fn record_session_end(&self, reason: &str) {
        self.sessions_active.dec();
        self.sessions_ended_total.with_label_values(&[reason]).inc();
    }

    /// Samples the resource gauges and encodes everything in the text format.
    pub fn render(&self, pool: &PoolStats, slots_free: usize) -> Result<String, prometheus::Error> {
        self.pool_idle_connections.set(pool.idle as i64);
        self.pool_dials_total.set(pool.dialed as i64);
        self.slots_free.set(slots_free as i64);

        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(idle: usize, dialed: u64) -> PoolStats {
        PoolStats {
            target: "memory://backend".to_string(),
            capacity: 2,
            idle,
            dialed,
        }
    }

    #[test]
    fn renders_recorded_values() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_request("/api/healthz", 200);
        metrics.record_request("/api/healthz", 200);
        metrics.record_rejection("busy");
        metrics.record_session_start();
        metrics.record_session_start();
        metrics.record_session_end("client_closed");

        let text = metrics.render(&stats(1, 3), 4).unwrap();

        assert!(text.contains(r#"voicegate_http_requests_total{path="/api/healthz",status="200"} 2"#));
        assert!(text.contains(r#"voicegate_admission_rejections_total{reason="busy"} 1"#));
        assert!(text.contains(r#"voicegate_sessions_ended_total{reason="client_closed"} 1"#));
        assert!(text.contains("voicegate_sessions_active 1"));
        assert!(text.contains("voicegate_pool_idle_connections 1"));
        assert!(text.contains("voicegate_pool_dials_total 3"));
        assert!(text.contains("voicegate_slots_free 4"));
    }

    #[test]
    fn registries_are_independent() {
        let a = GatewayMetrics::new().unwrap();
        let b = GatewayMetrics::new().unwrap();
        a.record_rejection("backend");

        let text = b.render(&stats(0, 0), 0).unwrap();
        assert!(!text.contains("voicegate_admission_rejections_total{"));
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
