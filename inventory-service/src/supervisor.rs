//! Broker connection establishment with bounded, backed-off retries.
//!
//! Running out of attempts is not fatal: the supervisor reports
//! [`BrokerStatus::Degraded`] and the rest of the service keeps serving.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::backoff::Backoff;

#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Send;

    /// Human-readable address of what is being connected to, for logs.
    fn endpoint(&self) -> String;

    async fn connect(&self) -> anyhow::Result<Self::Connection>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStatus {
    Connecting,
    Connected,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    pub error: Option<String>,
    /// Wait before the next attempt; `None` for the last attempt made.
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectReport {
    pub attempts: Vec<ConnectAttempt>,
}

impl ConnectReport {
    pub fn delays(&self) -> Vec<Duration> {
        self.attempts.iter().filter_map(|a| a.delay).collect()
    }
}

pub struct ConnectionSupervisor {
    policy: ConnectPolicy,
    status: watch::Sender<BrokerStatus>,
}

impl ConnectionSupervisor {
    pub fn new(policy: ConnectPolicy) -> Self {
        let (status, _) = watch::channel(BrokerStatus::Connecting);
        Self { policy, status }
    }

    pub fn status(&self) -> watch::Receiver<BrokerStatus> {
        self.status.subscribe()
    }

    /// Tries to connect up to `max_attempts` times. Returns the connection,
    /// or `None` once attempts are exhausted and the status is `Degraded`.
    pub async fn establish<C: Connector>(
        &self,
        connector: &C,
    ) -> (Option<C::Connection>, ConnectReport) {
        let endpoint = connector.endpoint();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut report = ConnectReport::default();
        self.status.send_replace(BrokerStatus::Connecting);

        for attempt in 1..=max_attempts {
            info!(attempt, max_attempts, %endpoint, "Connecting to broker");
            match connector.connect().await {
                Ok(connection) => {
                    report.attempts.push(ConnectAttempt {
                        attempt,
                        error: None,
                        delay: None,
                    });
                    self.status.send_replace(BrokerStatus::Connected);
                    info!(attempt, %endpoint, "Broker connection established");
                    return (Some(connection), report);
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    if message.contains("Connection refused") {
                        warn!(%endpoint, "Broker refused the connection. Is it running?");
                    }

                    let delay = (attempt < max_attempts)
                        .then(|| self.policy.backoff.delay_for_attempt(attempt - 1));
                    report.attempts.push(ConnectAttempt {
                        attempt,
                        error: Some(message.clone()),
                        delay,
                    });

                    match delay {
                        Some(delay) => {
                            warn!(
                                attempt,
                                max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %message,
                                "Broker connection failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => error!(
                            attempts = attempt,
                            %endpoint,
                            error = %message,
                            "Broker connection attempts exhausted, running without the message consumer"
                        ),
                    }
                }
            }
        }

        self.status.send_replace(BrokerStatus::Degraded);
        (None, report)
    }
}
