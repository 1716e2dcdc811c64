//! Interface to the external process supervisor that runs dependent services.

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use thiserror::Error;
use tokio::process::Command;

use crate::models::SupervisorConfig;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to run supervisor command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Supervisor command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Supervisor refused to {action} {service}: {detail}")]
    CommandFailed {
        action: &'static str,
        service: String,
        detail: String,
    },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceSupervisor: Send + Sync {
    async fn is_running(&self, service: &str) -> Result<bool, SupervisorError>;

    async fn restart(&self, service: &str) -> Result<(), SupervisorError>;
}

/// Drives a supervisorctl-style command line tool.
pub struct CommandSupervisor {
    program: String,
    timeout: Duration,
}

impl CommandSupervisor {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            program: config.program.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    async fn run(&self, action: &str, service: &str) -> Result<Output, SupervisorError> {
        let child = Command::new(&self.program)
            .arg(action)
            .arg(service)
            .kill_on_drop(true)
            .output();
        tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| SupervisorError::Timeout(self.timeout))?
            .map_err(SupervisorError::from)
    }
}

#[async_trait]
impl ServiceSupervisor for CommandSupervisor {
    async fn is_running(&self, service: &str) -> Result<bool, SupervisorError> {
        let output = self.run("status", service).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.contains("RUNNING"))
    }

    async fn restart(&self, service: &str) -> Result<(), SupervisorError> {
        let output = self.run("restart", service).await?;
        if output.status.success() {
            info!("Restarted service {}", service);
            Ok(())
        } else {
            let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("Restart of {} failed: {}", service, detail);
            Err(SupervisorError::CommandFailed {
                action: "restart",
                service: service.to_string(),
                detail,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let supervisor = CommandSupervisor::new(&SupervisorConfig {
            program: "/nonexistent/supervisorctl".to_string(),
            timeout_seconds: 1,
        });
        assert!(matches!(
            supervisor.is_running("web").await,
            Err(SupervisorError::Spawn(_))
        ));
        assert!(supervisor.restart("web").await.is_err());
    }
}
