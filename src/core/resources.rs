//! Host resource sampling for the threat monitor and the audit.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

/// Point-in-time resource usage. Percentages are 0-100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    /// Established TCP connections
    pub connections: u64,
    pub timestamp: DateTime<Utc>,
}

impl Default for ResourceSnapshot {
    fn default() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            disk_usage: 0.0,
            connections: 0,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self) -> Result<ResourceSnapshot>;
}

/// Samples the local host. CPU usage is averaged since the previous sample.
pub struct SystemSampler {
    system: Arc<Mutex<System>>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceSampler for SystemSampler {
    async fn sample(&self) -> Result<ResourceSnapshot> {
        let system = self.system.clone();
        let (cpu_usage, memory_usage, disk_usage) = tokio::task::spawn_blocking(move || {
            let mut sys = system.lock().map_err(|_| anyhow!("resource sampler lock poisoned"))?;
            sys.refresh_cpu();
            sys.refresh_memory();
            let cpu = sys.global_cpu_info().cpu_usage() as f64;
            let memory = percent(sys.used_memory(), sys.total_memory());

            let disks = Disks::new_with_refreshed_list();
            let (total, available) = disks
                .list()
                .iter()
                .fold((0u64, 0u64), |(t, a), d| (t + d.total_space(), a + d.available_space()));
            let disk = percent(total.saturating_sub(available), total);
            Ok::<_, anyhow::Error>((cpu, memory, disk))
        })
        .await??;

        Ok(ResourceSnapshot {
            cpu_usage,
            memory_usage,
            disk_usage,
            connections: established_connections().await,
            timestamp: Utc::now(),
        })
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// Established TCP sockets from `/proc/net/tcp{,6}`; zero where procfs is unavailable.
async fn established_connections() -> u64 {
    let mut count = 0;
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = tokio::fs::read_to_string(table).await {
            count += count_established(&content);
        }
    }
    count
}

fn count_established(table: &str) -> u64 {
    table
        .lines()
        .skip(1)
        .filter(|line| line.split_whitespace().nth(3) == Some("01"))
        .count() as u64
}

/// Fixed readings, for tests and dry runs.
pub struct StaticSampler(pub ResourceSnapshot);

#[async_trait]
impl ResourceSampler for StaticSampler {
    async fn sample(&self) -> Result<ResourceSnapshot> {
        Ok(ResourceSnapshot {
            timestamp: Utc::now(),
            ..self.0.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_established() {
        let table = "  sl  local_address rem_address   st tx_queue rx_queue\n\
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000\n\
   1: 0100007F:1F90 0100007F:C350 01 00000000:00000000\n\
   2: 0100007F:1F90 0100007F:C351 01 00000000:00000000\n";
        assert_eq!(count_established(table), 2);
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }

    #[tokio::test]
    async fn test_system_sampler_reports_percentages() {
        let snapshot = SystemSampler::new().sample().await.unwrap();
        assert!((0.0..=100.0).contains(&snapshot.memory_usage));
        assert!((0.0..=100.0).contains(&snapshot.disk_usage));
    }
}
