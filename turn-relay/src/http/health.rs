//! Health check endpoint.

use crate::server::TurnServer;
use axum::{Extension, Json};
use serde::Serialize;

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Number of live allocations.
    pub allocations: usize,
    /// Number of live permissions across all allocations.
    pub permissions: usize,
    /// Number of live channel bindings across all allocations.
    pub channels: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(server): Extension<TurnServer>) -> Json<HealthStatus> {
    let totals = server.totals().await;
    let status = if server.is_shut_down() {
        "shutting_down"
    } else {
        "ok"
    };

    Json(HealthStatus {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        allocations: totals.allocations,
        permissions: totals.permissions,
        channels: totals.channels,
        uptime_seconds: server.uptime().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_serializes() {
        let status = HealthStatus {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            allocations: 3,
            permissions: 7,
            channels: 2,
            uptime_seconds: 3600,
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"allocations\":3"));
        assert!(json.contains("\"permissions\":7"));
    }
}
