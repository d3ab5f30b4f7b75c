use crate::models::route::{CircuitBreakerConfig, RateLimitConfig, RetryConfig, RouteId, RouteStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Something that happened to a [`GatewayRoute`](crate::models::route::GatewayRoute).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEvent {
    pub event_id: Uuid,
    pub route_uuid: Uuid,
    pub route_id: RouteId,
    /// Route version after the change.
    pub route_version: u64,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
    pub kind: RouteEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RouteEventKind {
    RouteCreated {
        path_pattern: String,
        target_uri: String,
        method: String,
    },
    RouteUpdated {
        changed_fields: Vec<String>,
    },
    RouteEnabled,
    RouteDisabled,
    RouteArchived {
        previous_status: RouteStatus,
    },
    RouteStatusChanged {
        from: RouteStatus,
        to: RouteStatus,
    },
    RateLimitUpdated {
        config: Option<RateLimitConfig>,
    },
    CircuitBreakerUpdated {
        config: Option<CircuitBreakerConfig>,
    },
    RetryPolicyUpdated {
        config: Option<RetryConfig>,
    },
}

impl RouteEvent {
    pub(crate) fn new(route_uuid: Uuid, route_id: RouteId, route_version: u64, actor: &str, kind: RouteEventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            route_uuid,
            route_id,
            route_version,
            actor: actor.to_string(),
            occurred_at: Utc::now(),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            RouteEventKind::RouteCreated { .. } => "RouteCreated",
            RouteEventKind::RouteUpdated { .. } => "RouteUpdated",
            RouteEventKind::RouteEnabled => "RouteEnabled",
            RouteEventKind::RouteDisabled => "RouteDisabled",
            RouteEventKind::RouteArchived { .. } => "RouteArchived",
            RouteEventKind::RouteStatusChanged { .. } => "RouteStatusChanged",
            RouteEventKind::RateLimitUpdated { .. } => "RateLimitUpdated",
            RouteEventKind::CircuitBreakerUpdated { .. } => "CircuitBreakerUpdated",
            RouteEventKind::RetryPolicyUpdated { .. } => "RetryPolicyUpdated",
        }
    }
}
