use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub fleet_connected_sessions: Gauge,
    pub fleet_connect_total: CounterVec,
    pub fleet_discover_errors_total: Counter,
    pub fleet_polls_total: CounterVec,
    pub fleet_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let fleet_connected_sessions = Gauge::with_opts(opts!(
            "fleet_connected_sessions",
            "Number of hosts currently in the session registry"
        ))?;
        let fleet_connect_total = CounterVec::new(
            opts!(
                "fleet_connect_total",
                "Connect attempts by outcome (connected, rejected)"
            ),
            &["outcome"],
        )?;
        let fleet_discover_errors_total = Counter::with_opts(opts!(
            "fleet_discover_errors_total",
            "Failed discovery requests"
        ))?;
        let fleet_polls_total = CounterVec::new(
            opts!(
                "fleet_polls_total",
                "Completed polls by result class (snapshot, not_connected, remote_fetch, unknown)"
            ),
            &["result"],
        )?;
        let fleet_scrape_count_total = Counter::with_opts(opts!(
            "fleet_scrape_count_total",
            "Prometheus scrapes served"
        ))?;

        register(&registry, &fleet_connected_sessions)?;
        register(&registry, &fleet_connect_total)?;
        register(&registry, &fleet_discover_errors_total)?;
        register(&registry, &fleet_polls_total)?;
        register(&registry, &fleet_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            fleet_connected_sessions,
            fleet_connect_total,
            fleet_discover_errors_total,
            fleet_polls_total,
            fleet_scrape_count_total,
        }))
    }

    pub fn set_connected_sessions(&self, count: usize) {
        self.fleet_connected_sessions.set(count as f64);
    }

    pub fn inc_connect(&self, outcome: &str) {
        self.fleet_connect_total.with_label_values(&[outcome]).inc();
    }

    pub fn inc_discover_error(&self) {
        self.fleet_discover_errors_total.inc();
    }

    pub fn inc_poll(&self, result: &str) {
        self.fleet_polls_total.with_label_values(&[result]).inc();
    }

    pub fn inc_scrape_count(&self) {
        self.fleet_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
