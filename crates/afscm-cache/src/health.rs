use crate::status::CacheStatus;
use afscm_rpc::ConnStatus;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded { reason: String },
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded { .. })
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            HealthStatus::Healthy => None,
            HealthStatus::Degraded { reason } => Some(reason),
            HealthStatus::Unhealthy { reason } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
}

impl ComponentHealth {
    pub fn healthy(name: &str) -> Self {
        ComponentHealth {
            name: name.to_string(),
            status: HealthStatus::Healthy,
        }
    }

    pub fn degraded(name: &str, reason: &str) -> Self {
        ComponentHealth {
            name: name.to_string(),
            status: HealthStatus::Degraded {
                reason: reason.to_string(),
            },
        }
    }

    pub fn unhealthy(name: &str, reason: &str) -> Self {
        ComponentHealth {
            name: name.to_string(),
            status: HealthStatus::Unhealthy {
                reason: reason.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn new(components: Vec<ComponentHealth>) -> Self {
        let overall = if components.iter().any(|c| c.status.is_unhealthy()) {
            HealthStatus::Unhealthy {
                reason: "one or more components unhealthy".into(),
            }
        } else if components.iter().any(|c| c.status.is_degraded()) {
            HealthStatus::Degraded {
                reason: "one or more components degraded".into(),
            }
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            overall,
            components,
        }
    }

    pub fn from_status(cache: &CacheStatus, conns: &ConnStatus) -> Self {
        Self::new(vec![check_cache(cache), check_servers(conns, cache.disconnected)])
    }

    pub fn healthy_count(&self) -> usize {
        self.components
            .iter()
            .filter(|c| c.status.is_healthy())
            .count()
    }

    pub fn degraded_count(&self) -> usize {
        self.components
            .iter()
            .filter(|c| c.status.is_degraded())
            .count()
    }

    pub fn unhealthy_count(&self) -> usize {
        self.components
            .iter()
            .filter(|c| c.status.is_unhealthy())
            .count()
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }
}

fn check_cache(status: &CacheStatus) -> ComponentHealth {
    if status.used_nodes >= status.limits.high_nodes
        && status.entries.iter().all(|e| e.refcount > 0 || e.pinned)
    {
        ComponentHealth::unhealthy("cache", "every node is held")
    } else if status.over_high_water() {
        ComponentHealth::degraded("cache", "above high water mark")
    } else {
        ComponentHealth::healthy("cache")
    }
}

fn check_servers(conns: &ConnStatus, disconnected: bool) -> ComponentHealth {
    if disconnected {
        ComponentHealth::degraded("servers", "disconnected mode")
    } else if conns.hashed > 0 && conns.dead == conns.hashed {
        ComponentHealth::unhealthy("servers", "all servers down")
    } else if conns.dead > 0 {
        ComponentHealth::degraded("servers", "some servers down")
    } else {
        ComponentHealth::healthy("servers")
    }
}
