//! Automated responses to threat events.
//!
//! The engine consumes events from the monitor's queue one at a time,
//! applies the action for the event type, raises an alert for CRITICAL
//! events and records the final event in the security log.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::Duration;
use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::{MitigationConfig, RestorePolicy};
use super::alerts::{Alert, Alerter};
use super::blocklist::{BlockOutcome, BlocklistStore};
use super::cache::ResponseCache;
use super::rate_limiter::RateLimiter;
use super::resources::ResourceSampler;
use super::security_log::SecurityLog;
use super::shutdown::Shutdown;
use super::store::StoreError;
use super::supervisor::{ServiceSupervisor, SupervisorError};
use super::threat::{Severity, ThreatEvent, ThreatStatus, ThreatType};

#[derive(Error, Debug)]
pub enum MitigationError {
    #[error("Blocking {identity} failed: {source}")]
    Block {
        identity: String,
        #[source]
        source: StoreError,
    },
    #[error("Restarting {service} failed: {source}")]
    Restart {
        service: String,
        #[source]
        source: SupervisorError,
    },
}

/// Identities that name no client and must never be blocked.
const NOT_A_CLIENT: [&str; 3] = ["", "unknown", "system"];

pub struct MitigationEngine {
    config: MitigationConfig,
    /// Connection count still considered anomalous when re-evaluating a throttle
    connection_threshold: u64,
    blocklist: Arc<BlocklistStore>,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    supervisor: Arc<dyn ServiceSupervisor>,
    sampler: Arc<dyn ResourceSampler>,
    alerter: Arc<Alerter>,
    log: Arc<SecurityLog>,
    pending_restore: Mutex<Option<JoinHandle<()>>>,
}

impl MitigationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MitigationConfig,
        connection_threshold: u64,
        blocklist: Arc<BlocklistStore>,
        limiter: Arc<RateLimiter>,
        cache: Arc<ResponseCache>,
        supervisor: Arc<dyn ServiceSupervisor>,
        sampler: Arc<dyn ResourceSampler>,
        alerter: Arc<Alerter>,
        log: Arc<SecurityLog>,
    ) -> Self {
        Self {
            config,
            connection_threshold,
            blocklist,
            limiter,
            cache,
            supervisor,
            sampler,
            alerter,
            log,
            pending_restore: Mutex::new(None),
        }
    }

    /// Drain the event queue until shutdown or until every sender is gone.
    pub async fn run(&self, mut events: mpsc::Receiver<ThreatEvent>, shutdown: Shutdown) {
        let mut stop = shutdown.subscribe();
        info!("Mitigation engine started");
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                event = events.recv() => match event {
                    Some(event) => self.process(event).await,
                    None => break,
                },
            }
        }
        self.cancel_restore();
        self.limiter.restore();
        info!("Mitigation engine stopped");
    }

    /// Handle one event and record the outcome.
    pub async fn process(&self, event: ThreatEvent) {
        let event = self.handle(event).await;
        if let Err(e) = self.log.record_threat(&event).await {
            error!("Failed to record threat event {}: {}", event.id, e);
        }
    }

    /// Apply the automated response for `event` and return the updated event.
    pub async fn handle(&self, mut event: ThreatEvent) -> ThreatEvent {
        let outcome = match event.threat_type {
            ThreatType::BruteForce => {
                let ttl = Duration::hours(self.config.brute_force_block_hours);
                self.block(&mut event, ttl).await
            }
            ThreatType::MaliciousPayload => {
                let ttl = Duration::hours(self.config.payload_block_hours);
                self.block(&mut event, ttl).await
            }
            ThreatType::DdosAttempt => Ok(Some(self.throttle(&mut event))),
            ThreatType::ResourceExhaustion => Ok(Some(self.reclaim(&mut event))),
            ThreatType::ServiceFailure => self.restart(&mut event).await,
            ThreatType::VulnerabilityScan => Ok(None),
        };

        match outcome {
            Ok(Some(status)) => {
                event.advance(status);
                event.auto_fixed = true;
                metrics::increment_counter!("guard_mitigations_total", "type" => event.threat_type.as_str());
            }
            Ok(None) => {}
            Err(e) => {
                error!("Mitigation failure for event {}: {}", event.id, e);
                metrics::increment_counter!("guard_mitigation_failures_total", "type" => event.threat_type.as_str());
            }
        }

        if event.severity == Severity::Critical {
            match self.alerter.raise(&Alert::for_event(&event)).await {
                Ok(()) => event.mitigation_actions.push("alert_raised".to_string()),
                Err(e) => error!("Failed to raise alert for event {}: {}", event.id, e),
            }
        }

        info!(
            "Threat {} ({} {}) from {} -> {:?} {:?}",
            event.id, event.severity, event.threat_type, event.source, event.status, event.mitigation_actions
        );
        event
    }

    async fn block(
        &self,
        event: &mut ThreatEvent,
        ttl: Duration,
    ) -> Result<Option<ThreatStatus>, MitigationError> {
        if NOT_A_CLIENT.contains(&event.source.as_str()) {
            warn!("Not blocking event {}: no client identity", event.id);
            return Ok(None);
        }
        let reason = format!("{}: {}", event.threat_type, event.description);
        let outcome = self
            .blocklist
            .block(&event.source, &reason, ttl, true)
            .await
            .map_err(|source| MitigationError::Block {
                identity: event.source.clone(),
                source,
            })?;
        match outcome {
            BlockOutcome::Created | BlockOutcome::Extended => {
                event
                    .mitigation_actions
                    .push(format!("blocked_ip:{}:{}h", event.source, ttl.num_hours()));
                Ok(Some(ThreatStatus::Blocked))
            }
            BlockOutcome::Unchanged => {
                event.mitigation_actions.push(format!("already_blocked:{}", event.source));
                Ok(None)
            }
        }
    }

    /// Lower the global ceilings and (re)arm the restore task.
    fn throttle(&self, event: &mut ThreatEvent) -> ThreatStatus {
        let percent = self.config.ddos_throttle_percent;
        let cooldown = StdDuration::from_secs(self.config.ddos_throttle_seconds);
        // a restore from the previous throttle must not land after the new one
        self.cancel_restore();
        self.limiter.throttle(percent);

        let limiter = self.limiter.clone();
        let sampler = self.sampler.clone();
        let policy = self.config.ddos_restore_policy;
        let max_extensions = self.config.ddos_max_extensions;
        let threshold = self.connection_threshold;
        let task = tokio::spawn(async move {
            let mut extensions = 0;
            loop {
                tokio::time::sleep(cooldown).await;
                if policy == RestorePolicy::Reevaluate && extensions < max_extensions {
                    match sampler.sample().await {
                        Ok(snapshot) if snapshot.connections > threshold => {
                            extensions += 1;
                            warn!(
                                "Connections still at {}, keeping rate limits throttled (extension {})",
                                snapshot.connections, extensions
                            );
                            continue;
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Could not re-sample connections before restore: {}", e),
                    }
                }
                limiter.restore();
                break;
            }
        });

        if let Ok(mut pending) = self.pending_restore.lock() {
            if let Some(previous) = pending.replace(task) {
                previous.abort();
            }
        }
        event
            .mitigation_actions
            .push(format!("rate_limit_throttled:{}%:{}s", percent, cooldown.as_secs()));
        ThreatStatus::Mitigated
    }

    fn reclaim(&self, event: &mut ThreatEvent) -> ThreatStatus {
        let released = self.cache.clear_local() + self.limiter.clear_local();
        info!("Released {} local cache and counter entries", released);
        event
            .mitigation_actions
            .push(format!("cleared_local_state:{}", released));
        ThreatStatus::Mitigated
    }

    async fn restart(&self, event: &mut ThreatEvent) -> Result<Option<ThreatStatus>, MitigationError> {
        let service = event.source.clone();
        self.supervisor
            .restart(&service)
            .await
            .map_err(|source| MitigationError::Restart {
                service: service.clone(),
                source,
            })?;
        event.mitigation_actions.push(format!("restarted_service:{}", service));
        Ok(Some(ThreatStatus::Mitigated))
    }

    /// Abort a pending throttle restore without restoring.
    pub fn cancel_restore(&self) {
        if let Ok(mut pending) = self.pending_restore.lock() {
            if let Some(task) = pending.take() {
                task.abort();
            }
        }
    }

    #[cfg(test)]
    fn restore_pending(&self) -> bool {
        self.pending_restore
            .lock()
            .map(|p| p.as_ref().map_or(false, |t| !t.is_finished()))
            .unwrap_or(false)
    }
}
