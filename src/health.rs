//! Link status tracking and the gateway health snapshot
//!
//! The forwarder and the control channel each own a [`LinkStatusStore`] and
//! report every success or failure into it. [`HealthReporter`] reads those
//! stores plus the buffer statistics to build a [`GatewayHealthSnapshot`] on
//! request. Building a snapshot never changes any state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::buffer::BufferStore;
use crate::config::HealthConfig;

/// Connectivity of one outbound link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub connected: bool,

    /// When `connected` last changed
    pub since: DateTime<Utc>,

    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl LinkStatus {
    fn new(connected: bool) -> Self {
        Self {
            connected,
            since: Utc::now(),
            last_success: None,
            last_error: None,
            last_error_at: None,
        }
    }

    /// How long the link has been down, `None` while connected
    pub fn disconnected_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.connected {
            return None;
        }
        Some((now - self.since).to_std().unwrap_or_default())
    }
}

/// Shared, cloneable link status
#[derive(Debug, Clone)]
pub struct LinkStatusStore {
    inner: Arc<RwLock<LinkStatus>>,
}

impl LinkStatusStore {
    /// A link assumed reachable until the first failure (HTTP delivery)
    pub fn connected() -> Self {
        Self {
            inner: Arc::new(RwLock::new(LinkStatus::new(true))),
        }
    }

    /// A link that is down until it connects (control socket)
    pub fn disconnected() -> Self {
        Self {
            inner: Arc::new(RwLock::new(LinkStatus::new(false))),
        }
    }

    /// Record a successful exchange; marks the link connected.
    pub async fn record_success(&self) {
        let now = Utc::now();
        let mut status = self.inner.write().await;
        if !status.connected {
            status.connected = true;
            status.since = now;
        }
        status.last_success = Some(now);
    }

    /// Record a failure; marks the link disconnected.
    pub async fn record_failure(&self, error: impl Into<String>) {
        let now = Utc::now();
        let mut status = self.inner.write().await;
        if status.connected {
            status.connected = false;
            status.since = now;
        }
        status.last_error = Some(error.into());
        status.last_error_at = Some(now);
    }

    pub async fn snapshot(&self) -> LinkStatus {
        self.inner.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.read().await.connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferHealth {
    pub depth: u64,
    pub oldest_pending: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkHealth {
    pub connected: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
}

impl From<&LinkStatus> for LinkHealth {
    fn from(status: &LinkStatus) -> Self {
        Self {
            connected: status.connected,
            last_success: status.last_success,
            last_error: status.last_error.clone(),
            last_error_at: status.last_error_at,
        }
    }
}

/// Point-in-time health of the gateway (never persisted)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayHealthSnapshot {
    pub status: GatewayStatus,
    pub gateway_id: String,
    pub buffer: BufferHealth,

    /// Combined view of delivery and control connectivity
    pub uplink: LinkHealth,

    /// Control channel on its own, absent when the channel is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<LinkHealth>,

    /// Why the status is degraded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,

    pub checked_at: DateTime<Utc>,
}

/// Builds health snapshots from the buffer and link stores
#[derive(Clone)]
pub struct HealthReporter {
    gateway_id: String,
    buffer: Arc<dyn BufferStore>,
    delivery: LinkStatusStore,
    control: Option<LinkStatusStore>,
    config: HealthConfig,
}

impl HealthReporter {
    pub fn new(
        gateway_id: impl Into<String>,
        buffer: Arc<dyn BufferStore>,
        delivery: LinkStatusStore,
        control: Option<LinkStatusStore>,
        config: HealthConfig,
    ) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            buffer,
            delivery,
            control,
            config,
        }
    }

    pub async fn snapshot(&self) -> GatewayHealthSnapshot {
        let now = Utc::now();
        let mut reasons = Vec::new();

        let buffer = match self.buffer.stats().await {
            Ok(stats) => BufferHealth {
                depth: stats.depth(),
                oldest_pending: stats.oldest_pending,
                error: None,
            },
            Err(e) => {
                warn!("health check could not read buffer stats: {}", e);
                reasons.push("buffer unavailable".to_string());
                BufferHealth {
                    depth: 0,
                    oldest_pending: None,
                    error: Some(e.to_string()),
                }
            }
        };

        if buffer.depth > self.config.max_depth {
            reasons.push(format!(
                "buffer depth {} exceeds {}",
                buffer.depth, self.config.max_depth
            ));
        }

        let delivery = self.delivery.snapshot().await;
        self.check_link("uplink", &delivery, now, &mut reasons);

        let control = match &self.control {
            Some(store) => {
                let status = store.snapshot().await;
                self.check_link("control channel", &status, now, &mut reasons);
                Some(status)
            }
            None => None,
        };

        let uplink = combine(&delivery, control.as_ref());

        GatewayHealthSnapshot {
            status: if reasons.is_empty() {
                GatewayStatus::Ok
            } else {
                GatewayStatus::Degraded
            },
            gateway_id: self.gateway_id.clone(),
            buffer,
            uplink,
            control: control.as_ref().map(LinkHealth::from),
            reasons,
            checked_at: now,
        }
    }

    fn check_link(
        &self,
        name: &str,
        status: &LinkStatus,
        now: DateTime<Utc>,
        reasons: &mut Vec<String>,
    ) {
        if let Some(down) = status.disconnected_for(now)
            && down > self.config.disconnect_threshold
        {
            reasons.push(format!("{name} disconnected for {}s", down.as_secs()));
        }
    }
}

/// Delivery and control merged: connected only when both are, the most recent
/// error of either.
fn combine(delivery: &LinkStatus, control: Option<&LinkStatus>) -> LinkHealth {
    let mut health = LinkHealth::from(delivery);

    if let Some(control) = control {
        health.connected = health.connected && control.connected;

        if control.last_error_at > health.last_error_at {
            health.last_error = control.last_error.clone();
            health.last_error_at = control.last_error_at;
        }
    }

    health
}
