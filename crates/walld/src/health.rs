//! `/health` and `/ws-status` response bodies.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::registry::PoolStats;

/// Health check response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` while the relay is disconnected
    pub status: &'static str,
    pub uptime_secs: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub relay_connected: bool,
    pub listener_restarts: u64,
    pub connections: usize,
    pub published: u64,
    pub publish_failures: u64,
}

/// Live counters the health response is built from.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthInputs {
    pub uptime_secs: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub relay_connected: bool,
    pub listener_restarts: u64,
    pub connections: usize,
    pub published: u64,
    pub publish_failures: u64,
}

pub fn health_check(inputs: HealthInputs) -> HealthResponse {
    HealthResponse {
        status: if inputs.relay_connected { "ok" } else { "degraded" },
        uptime_secs: inputs.uptime_secs,
        queue_depth: inputs.queue_depth,
        queue_capacity: inputs.queue_capacity,
        relay_connected: inputs.relay_connected,
        listener_restarts: inputs.listener_restarts,
        connections: inputs.connections,
        published: inputs.published,
        publish_failures: inputs.publish_failures,
    }
}

/// Connection counts per pool, keyed by pool id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WsStatusResponse {
    pub total_connections: usize,
    pub pools: BTreeMap<String, usize>,
    /// RFC 3339
    pub timestamp: String,
}

pub fn ws_status(pools: &[PoolStats]) -> WsStatusResponse {
    WsStatusResponse {
        total_connections: pools.iter().map(|p| p.connections).sum(),
        pools: pools
            .iter()
            .map(|p| (p.pool_id.to_string(), p.connections))
            .collect(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}
