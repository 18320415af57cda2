//! Endpoint health as seen by the probe loop.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Health of one proxy endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointHealth {
    /// Not probed yet. Selectable.
    #[default]
    Unknown,
    /// Last probe answered within the probe timeout.
    Healthy,
    /// Last probe failed or timed out. Tried only after every other endpoint.
    Unhealthy,
}

impl EndpointHealth {
    pub fn is_selectable(self) -> bool {
        !matches!(self, EndpointHealth::Unhealthy)
    }

    const fn as_u8(self) -> u8 {
        match self {
            EndpointHealth::Unknown => 0,
            EndpointHealth::Healthy => 1,
            EndpointHealth::Unhealthy => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => EndpointHealth::Healthy,
            2 => EndpointHealth::Unhealthy,
            _ => EndpointHealth::Unknown,
        }
    }
}

/// Lock-free health cell, written by the probe loop and read on every call.
#[derive(Debug, Default)]
pub(crate) struct HealthCell(AtomicU8);

impl HealthCell {
    pub(crate) fn get(&self) -> EndpointHealth {
        EndpointHealth::from_u8(self.0.load(Ordering::Relaxed))
    }

    /// Store `health`, returning the previous value.
    pub(crate) fn set(&self, health: EndpointHealth) -> EndpointHealth {
        EndpointHealth::from_u8(self.0.swap(health.as_u8(), Ordering::Relaxed))
    }
}

/// Health report entry for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub address: String,
    pub health: EndpointHealth,
}
