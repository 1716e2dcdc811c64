//! Traffic guard
//!
//! This is the main entry point for the traffic guard. It wires the
//! admission gate, the background monitor, mitigation and audit tasks, and
//! starts the web server.

use std::sync::Arc;

use actix_web::middleware::from_fn;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::mpsc;

use traffic_guard::api::{self, ApiState};
use traffic_guard::config;
use traffic_guard::core::alerts::Alerter;
use traffic_guard::core::resources::{ResourceSampler, SystemSampler};
use traffic_guard::core::supervisor::{CommandSupervisor, ServiceSupervisor};
use traffic_guard::core::{
    store, AuditScheduler, BlocklistStore, MitigationEngine, PatternSet, RateLimiter, RequestGate, ResponseCache,
    SecurityLog, Shutdown, ThreatMonitor,
};

/// Threat events waiting for the mitigation worker.
const EVENT_QUEUE: usize = 256;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting traffic guard...");

    // Load configuration
    let config = Arc::new(config::load_config().context("Failed to load configuration")?);

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    // Backing store: Redis when reachable, process-local otherwise
    let store = store::connect(&config.redis).await;
    info!("Backing store: {}", store.backend());

    let patterns = Arc::new(
        PatternSet::new(&config.gate.suspicious_patterns).context("Invalid suspicious request pattern")?,
    );
    let log = Arc::new(SecurityLog::new(store.clone()));
    let blocklist = Arc::new(BlocklistStore::new(store.clone()));
    blocklist
        .load_permanent(&config.blocklist.permanent)
        .await
        .context("Failed to install permanent blocklist")?;
    let limiter = Arc::new(RateLimiter::new(store.clone(), config.rate_limit.clone()));
    let cache = Arc::new(ResponseCache::new(store.clone(), &config.cache));
    let gate = Arc::new(RequestGate::new(
        config.gate.clone(),
        &config.rate_limit,
        blocklist.clone(),
        limiter.clone(),
        cache.clone(),
        patterns.clone(),
        log.clone(),
    ));

    let sampler: Arc<dyn ResourceSampler> = Arc::new(SystemSampler::new());
    let supervisor: Arc<dyn ServiceSupervisor> = Arc::new(CommandSupervisor::new(&config.supervisor));
    let alerter = Arc::new(Alerter::new(log.clone(), &config.alerts));

    let shutdown = Shutdown::new();
    let (events, queue) = mpsc::channel(EVENT_QUEUE);
    let mut workers = Vec::new();

    let mitigation = Arc::new(MitigationEngine::new(
        config.mitigation.clone(),
        config.monitoring.alert_thresholds.connections,
        blocklist.clone(),
        limiter.clone(),
        cache.clone(),
        supervisor.clone(),
        sampler.clone(),
        alerter,
        log.clone(),
    ));
    workers.push(tokio::spawn({
        let shutdown = shutdown.clone();
        async move { mitigation.run(queue, shutdown).await }
    }));

    if config.monitoring.enabled {
        let monitor = ThreatMonitor::new(
            config.monitoring.clone(),
            patterns.clone(),
            blocklist.clone(),
            log.clone(),
            sampler.clone(),
            supervisor.clone(),
            events,
        );
        let shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move { monitor.run(shutdown).await }));
    } else {
        info!("Threat monitor disabled");
        drop(events);
    }

    let audit = Arc::new(AuditScheduler::new(
        config.audit.clone(),
        config.monitoring.services.clone(),
        log.clone(),
        blocklist.clone(),
        limiter.clone(),
        cache.clone(),
        sampler,
        supervisor,
    ));
    if config.audit.enabled {
        let audit = audit.clone();
        let shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move { audit.run(shutdown).await }));
    }

    // Create API state
    let state = web::Data::new(ApiState {
        gate: gate.clone(),
        limiter,
        cache,
        blocklist,
        log,
        audit,
        metrics,
    });
    let gate = web::Data::from(gate);

    // Start HTTP server
    info!("Listening on {}:{}", config.server.host, config.server.port);
    let served = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(gate.clone())
            .wrap(from_fn(api::protect))
            .configure(api::config)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await;

    info!("Server stopped, shutting down background tasks");
    shutdown.trigger();
    futures::future::join_all(workers).await;
    served.context("HTTP server failed")
}
