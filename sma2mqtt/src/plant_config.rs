use std::time::Duration;

use serde_derive::Deserialize;

use crate::aggregation::{AggregationKind, AggregationNode, Operation};
use crate::broadcast_listener::{MulticastConfig, DEFAULT_DISCOVERY_TIMEOUT};
use crate::inverter::DEFAULT_PORT;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct InverterConfig {
    pub id: String,
    pub host: String,
    pub port: Option<u16>,
}

impl InverterConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct HomeManagerConfig {
    pub id: String,
    #[serde(flatten)]
    pub multicast: MulticastConfig,
    /// Seconds to wait for the first broadcast.
    pub discovery_timeout: Option<u64>,
}

impl HomeManagerConfig {
    pub fn discovery_timeout(&self) -> Duration {
        self.discovery_timeout
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DISCOVERY_TIMEOUT)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LogicalMeterConfig {
    pub id: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AggregationConfig {
    pub id: String,
    pub operation: Operation,
    #[serde(flatten)]
    pub kind: AggregationKind,
}

impl AggregationConfig {
    pub fn to_node(&self) -> AggregationNode {
        AggregationNode::new(&self.id, self.kind.clone(), self.operation)
    }
}

/// Devices and aggregations making up one installation.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct PlantConfig {
    #[serde(default)]
    pub inverters: Vec<InverterConfig>,
    pub home_manager: Option<HomeManagerConfig>,
    pub logical_meter: Option<LogicalMeterConfig>,
    #[serde(default)]
    pub aggregations: Vec<AggregationConfig>,
}

impl PlantConfig {
    pub fn is_empty(&self) -> bool {
        self.inverters.is_empty() && self.home_manager.is_none()
    }
}
