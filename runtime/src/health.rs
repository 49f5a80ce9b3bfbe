//! Readiness reporting.
//!
//! A service must not accept traffic that depends on events it cannot receive.
//! [`EventBus::health`](crate::EventBus::health) maps the connection state onto
//! the statuses a readiness endpoint understands:
//!
//! | Connection state | Status      | Ready? |
//! |------------------|-------------|--------|
//! | Connected        | Healthy     | yes    |
//! | Connecting       | Degraded    | no     |
//! | Disconnected     | Degraded    | no     |
//! | Exhausted        | Unhealthy   | no     |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// Component is recovering and should not receive traffic yet
    Degraded,
    /// Component has given up
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Health check result with details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub component: String,
    /// Current health status
    pub status: HealthStatus,
    /// Whether the component can serve traffic
    pub ready: bool,
    /// Human-readable message
    pub message: String,
    /// Timestamp of this health check
    pub last_check: SystemTime,
    /// Additional details (state, reconnect attempt, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, serde_json::Value>>,
}

impl ComponentHealth {
    fn with_status(
        component: impl Into<String>,
        status: HealthStatus,
        ready: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            status,
            ready,
            message: message.into(),
            last_check: SystemTime::now(),
            details: None,
        }
    }

    /// Ready to serve.
    #[must_use]
    pub fn healthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Healthy, true, message)
    }

    /// Alive but not ready.
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Degraded, false, message)
    }

    /// Not operational.
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unhealthy, false, message)
    }

    /// Add detail to health check
    #[must_use]
    pub fn with_detail(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.details
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_per_status() {
        assert!(ComponentHealth::healthy("event-bus", "connected").ready);
        assert!(!ComponentHealth::degraded("event-bus", "reconnecting").ready);
        assert!(!ComponentHealth::unhealthy("event-bus", "gave up").ready);
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Degraded.is_healthy());
    }

    #[test]
    fn test_serializes_for_readiness_endpoint() {
        let health = ComponentHealth::degraded("event-bus", "reconnecting")
            .with_detail("state", "connecting")
            .with_detail("reconnect_attempt", 3);

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["ready"], false);
        assert_eq!(json["details"]["reconnect_attempt"], 3);
    }
}
