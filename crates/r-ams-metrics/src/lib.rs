//! ---
//! ams_section: "03-observability"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Metrics collection and export utilities."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder, TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "r_amsd_starts_total",
            "Total number of times the R-AMS daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "r_amsd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }
}

/// Metrics describing the agent linking service.
#[derive(Clone, Debug)]
pub struct LinkingMetrics {
    registry: SharedRegistry,
    running_agents: IntGauge,
    agent_starts: IntCounterVec,
    linked_attributes: IntGaugeVec,
    actuator_writes: IntCounterVec,
    discovery_tasks: IntCounterVec,
}

impl LinkingMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let running_agents = IntGauge::with_opts(Opts::new(
            "r_ams_running_agents",
            "Number of agents with an active protocol instance",
        ))?;
        registry.register(Box::new(running_agents.clone()))?;

        let agent_starts = IntCounterVec::new(
            Opts::new(
                "r_ams_agent_starts_total",
                "Protocol instance start attempts by agent kind and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(agent_starts.clone()))?;

        let linked_attributes = IntGaugeVec::new(
            Opts::new(
                "r_ams_linked_attributes",
                "Attributes currently linked to each agent",
            ),
            &["agent"],
        )?;
        registry.register(Box::new(linked_attributes.clone()))?;

        let actuator_writes = IntCounterVec::new(
            Opts::new(
                "r_ams_actuator_writes_total",
                "Attribute writes routed to a protocol instance",
            ),
            &["agent"],
        )?;
        registry.register(Box::new(actuator_writes.clone()))?;

        let discovery_tasks = IntCounterVec::new(
            Opts::new(
                "r_ams_discovery_tasks_total",
                "Discovery and import tasks by kind and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(discovery_tasks.clone()))?;

        Ok(Self {
            registry,
            running_agents,
            agent_starts,
            linked_attributes,
            actuator_writes,
            discovery_tasks,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn set_running_agents(&self, count: usize) {
        self.running_agents.set(count as i64);
    }

    pub fn record_start(&self, kind: &str, outcome: &str) {
        self.agent_starts.with_label_values(&[kind, outcome]).inc();
    }

    pub fn set_linked_attributes(&self, agent: &str, count: usize) {
        self.linked_attributes
            .with_label_values(&[agent])
            .set(count as i64);
    }

    /// Drop the per-agent series once an agent is stopped.
    pub fn clear_agent(&self, agent: &str) {
        let _ = self.linked_attributes.remove_label_values(&[agent]);
    }

    pub fn record_actuator_write(&self, agent: &str) {
        self.actuator_writes.with_label_values(&[agent]).inc();
    }

    pub fn record_discovery(&self, kind: &str, outcome: &str) {
        self.discovery_tasks.with_label_values(&[kind, outcome]).inc();
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linking_metrics_register_and_update() {
        let registry = new_registry();
        let metrics = LinkingMetrics::new(registry.clone()).unwrap();
        metrics.set_running_agents(2);
        metrics.record_start("MockAgent", "started");
        metrics.set_linked_attributes("agent-1", 3);
        metrics.record_discovery("asset", "completed");

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        assert!(names.contains(&"r_ams_running_agents".to_owned()));
        assert!(names.contains(&"r_ams_agent_starts_total".to_owned()));
        assert!(names.contains(&"r_ams_linked_attributes".to_owned()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exporter_serves_text_format() {
        use std::io::{Read, Write};

        let registry = new_registry();
        LinkingMetrics::new(registry.clone())
            .unwrap()
            .set_running_agents(1);
        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.addr();

        let response = tokio::task::spawn_blocking(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream
                .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .unwrap();
            let mut body = String::new();
            stream.read_to_string(&mut body).unwrap();
            body
        })
        .await
        .unwrap();

        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains(TEXT_FORMAT), "{response}");
        assert!(response.contains("r_ams_running_agents 1"), "{response}");
        server.shutdown().await.unwrap();
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        LinkingMetrics::new(registry.clone()).unwrap();
        assert!(LinkingMetrics::new(registry).is_err());
    }
}
