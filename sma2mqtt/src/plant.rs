use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{error, info, warn};
use thiserror::Error;

use crate::aggregation::{AggregationGraph, EvaluationContext, GraphError, NodeId};
use crate::broadcast::BroadcastFrame;
use crate::broadcast_listener::{BroadcastListener, MulticastConfig};
use crate::inverter::{InverterClient, ModbusWrapper};
use crate::logical_meter::LogicalMeter;
use crate::plant_config::{AggregationConfig, HomeManagerConfig, InverterConfig, PlantConfig};
use crate::snapshot::InverterSnapshot;

#[derive(Debug, Error)]
pub enum PlantError {
    #[error("failed to establish communication to inverter {0}")]
    InverterUnreachable(String),
    #[error("Home Manager {0} already exists, only one is supported")]
    BroadcastAlreadyAttached(String),
    #[error("failed to establish communication to Home Manager {0}")]
    BroadcastUnreachable(String),
    #[error("cannot listen for Home Manager {id}: {source}")]
    Socket {
        id: String,
        #[source]
        source: io::Error,
    },
    #[error("logical meter {0} already exists, only one is supported")]
    LogicalMeterAlreadyEnabled(String),
    #[error(transparent)]
    Aggregation(#[from] GraphError),
    #[error("device {0} does not exist")]
    UnknownDevice(String),
    #[error("device {0} does not support reconnecting")]
    ReconnectUnsupported(String),
}

/// Everything measured and derived in one poll cycle.
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub timestamp: DateTime<Local>,
    /// Snapshots of the inverters polled successfully this cycle.
    pub inverters: BTreeMap<String, InverterSnapshot>,
    pub broadcast: Option<(String, BroadcastFrame)>,
    pub logical_meter: Option<(String, LogicalMeter)>,
    pub aggregations: BTreeMap<NodeId, f64>,
}

struct HomeManager {
    id: String,
    multicast: MulticastConfig,
    discovery_timeout: Duration,
    listener: BroadcastListener,
}

impl HomeManager {
    /// Replaces the listener with a fresh one and waits for its first frame.
    fn restart(&mut self) -> bool {
        self.listener.stop();
        match BroadcastListener::start(&self.multicast) {
            Ok(listener) => {
                self.listener = listener;
                self.listener.wait_for_first_frame(self.discovery_timeout)
            }
            Err(e) => {
                error!("cannot listen for Home Manager {}: {e}", self.id);
                false
            }
        }
    }
}

/// Owns every device and aggregation of one installation.
pub struct Plant<M: ModbusWrapper> {
    inverters: BTreeMap<String, InverterClient<M>>,
    // last good snapshot per registered inverter
    snapshots: BTreeMap<String, InverterSnapshot>,
    home_manager: Option<HomeManager>,
    logical_meter: Option<String>,
    aggregations: AggregationGraph,
}

impl<M: ModbusWrapper> Default for Plant<M> {
    fn default() -> Self {
        Self {
            inverters: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            home_manager: None,
            logical_meter: None,
            aggregations: AggregationGraph::new(),
        }
    }
}

impl<M: ModbusWrapper> Plant<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers all configured devices. Devices that fail to start are
    /// logged and left out.
    pub fn from_config(config: &PlantConfig) -> Self {
        let mut plant = Self::new();
        for inverter in &config.inverters {
            report_start(&inverter.id, plant.add_inverter(inverter));
        }
        if let Some(home_manager) = &config.home_manager {
            report_start(&home_manager.id, plant.attach_broadcast_listener(home_manager));
        }
        if let Some(logical_meter) = &config.logical_meter {
            report_start(&logical_meter.id, plant.enable_logical_meter(&logical_meter.id));
        }
        for aggregation in &config.aggregations {
            report_start(&aggregation.id, plant.add_aggregation(aggregation));
        }
        plant
    }

    pub fn inverter_ids(&self) -> impl Iterator<Item = &str> {
        self.inverters.keys().map(String::as_str)
    }

    pub fn aggregations(&self) -> &AggregationGraph {
        &self.aggregations
    }

    /// Connects to an inverter and registers it; replaces an inverter with the same id.
    pub fn add_inverter(&mut self, config: &InverterConfig) -> Result<(), PlantError> {
        let mut client = InverterClient::new(&config.host, config.port());
        if !client.connect() {
            return Err(PlantError::InverterUnreachable(config.id.clone()));
        }
        if let Some(mut previous) = self.inverters.insert(config.id.clone(), client) {
            previous.close();
        }
        self.snapshots.insert(config.id.clone(), InverterSnapshot::default());
        Ok(())
    }

    pub fn remove_inverter(&mut self, id: &str) -> bool {
        self.snapshots.remove(id);
        match self.inverters.remove(id) {
            Some(mut client) => {
                client.close();
                true
            }
            None => false,
        }
    }

    /// Starts listening for the broadcasts of a Home Manager.
    pub fn attach_broadcast_listener(
        &mut self,
        config: &HomeManagerConfig,
    ) -> Result<(), PlantError> {
        if let Some(home_manager) = &self.home_manager {
            return Err(PlantError::BroadcastAlreadyAttached(home_manager.id.clone()));
        }
        let listener =
            BroadcastListener::start(&config.multicast).map_err(|source| PlantError::Socket {
                id: config.id.clone(),
                source,
            })?;
        self.attach_listener(config, listener)
    }

    /// Attaches a running listener. Fails unless the listener receives a
    /// frame within the configured discovery timeout.
    pub fn attach_listener(
        &mut self,
        config: &HomeManagerConfig,
        mut listener: BroadcastListener,
    ) -> Result<(), PlantError> {
        if let Some(home_manager) = &self.home_manager {
            return Err(PlantError::BroadcastAlreadyAttached(home_manager.id.clone()));
        }
        if !listener.wait_for_first_frame(config.discovery_timeout()) {
            listener.stop();
            return Err(PlantError::BroadcastUnreachable(config.id.clone()));
        }
        self.home_manager = Some(HomeManager {
            id: config.id.clone(),
            multicast: config.multicast.clone(),
            discovery_timeout: config.discovery_timeout(),
            listener,
        });
        Ok(())
    }

    pub fn detach_broadcast_listener(&mut self) -> bool {
        match self.home_manager.take() {
            Some(mut home_manager) => {
                home_manager.listener.stop();
                true
            }
            None => false,
        }
    }

    pub fn enable_logical_meter(&mut self, id: &str) -> Result<(), PlantError> {
        if let Some(existing) = &self.logical_meter {
            return Err(PlantError::LogicalMeterAlreadyEnabled(existing.clone()));
        }
        if self.home_manager.is_none() {
            warn!("Logical meter {id} needs a Home Manager to account for consumed power; consumption stays 0 without one");
        }
        self.logical_meter = Some(id.to_string());
        Ok(())
    }

    pub fn disable_logical_meter(&mut self) -> bool {
        self.logical_meter.take().is_some()
    }

    pub fn add_aggregation(&mut self, config: &AggregationConfig) -> Result<(), PlantError> {
        Ok(self.aggregations.add(config.to_node())?)
    }

    pub fn remove_aggregation(&mut self, id: &str) -> bool {
        self.aggregations.remove(id).is_some()
    }

    /// Returns the latest frame, restarting a listener that lost its socket.
    fn fetch_broadcast(&mut self) -> Option<(String, BroadcastFrame)> {
        let home_manager = self.home_manager.as_mut()?;
        if home_manager.listener.latest().is_none() {
            error!("Lost connection to Home Manager {}. Reconnecting...", home_manager.id);
            home_manager.restart();
        }
        home_manager
            .listener
            .latest()
            .map(|frame| (home_manager.id.clone(), frame))
    }

    /// Polls every inverter, then derives the logical meter and aggregations.
    ///
    /// An inverter that fails to answer is left out of this cycle's report
    /// and reconnected for the next one.
    pub fn run_cycle(&mut self) -> CycleReport {
        let mut polled = BTreeMap::new();
        for (id, client) in self.inverters.iter_mut() {
            match client.poll() {
                Ok(snapshot) => {
                    self.snapshots.insert(id.clone(), snapshot.clone());
                    polled.insert(id.clone(), snapshot);
                }
                Err(e) => {
                    error!("Lost connection to inverter {id}: {e}. Reconnecting...");
                    client.reconnect();
                }
            }
        }

        let broadcast = self.fetch_broadcast();
        let ctx = EvaluationContext {
            snapshots: &self.snapshots,
            broadcast: broadcast.as_ref().map(|(_, frame)| frame),
        };
        let logical_meter = self
            .logical_meter
            .as_ref()
            .map(|id| (id.clone(), LogicalMeter::compute(&ctx)));
        let evaluation = self.aggregations.evaluate(&ctx);

        CycleReport {
            timestamp: Local::now(),
            inverters: polled,
            broadcast,
            logical_meter,
            aggregations: evaluation.values,
        }
    }

    /// Reconnects every inverter and the Home Manager.
    pub fn reconnect_all(&mut self) -> Vec<(String, bool)> {
        info!("Reconnecting inverters... {} devices", self.inverters.len());
        let mut results = Vec::new();
        for (id, client) in self.inverters.iter_mut() {
            let ok = client.reconnect();
            log_reconnect(id, ok);
            results.push((id.clone(), ok));
        }
        if let Some(home_manager) = self.home_manager.as_mut() {
            info!("Reconnecting Home Manager");
            let ok = home_manager.restart();
            log_reconnect(&home_manager.id, ok);
            results.push((home_manager.id.clone(), ok));
        }
        results
    }

    pub fn reconnect_device(&mut self, id: &str) -> Result<bool, PlantError> {
        if let Some(client) = self.inverters.get_mut(id) {
            return Ok(client.reconnect());
        }
        if let Some(home_manager) = self.home_manager.as_mut().filter(|hm| hm.id == id) {
            return Ok(home_manager.restart());
        }
        if self.logical_meter.as_deref() == Some(id) || self.aggregations.contains(id) {
            return Err(PlantError::ReconnectUnsupported(id.to_string()));
        }
        Err(PlantError::UnknownDevice(id.to_string()))
    }

    /// Closes every connection and joins the listener thread.
    pub fn shutdown(&mut self) {
        for client in self.inverters.values_mut() {
            client.close();
        }
        self.detach_broadcast_listener();
    }
}

fn report_start<T>(id: &str, result: Result<T, PlantError>) {
    match result {
        Ok(_) => info!("Successfully started device {id}."),
        Err(e) => error!("{e}"),
    }
}

fn log_reconnect(id: &str, ok: bool) {
    if ok {
        info!("    - {id} --- OK");
    } else {
        error!("    - {id} --- FAILED");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{AggregationKind, Operand, Operation};
    use crate::broadcast_listener::tests::{channel_listener, frame_with};
    use crate::inverter::tests::FakeModbus;
    use crate::snapshot::Value;

    fn inverter(id: &str, host: &str) -> InverterConfig {
        InverterConfig {
            id: id.to_string(),
            host: host.to_string(),
            port: None,
        }
    }

    fn home_manager() -> HomeManagerConfig {
        HomeManagerConfig {
            id: "home-manager".into(),
            multicast: MulticastConfig {
                group: None,
                port: None,
            },
            discovery_timeout: Some(5),
        }
    }

    fn ac_total(id: &str) -> AggregationConfig {
        AggregationConfig {
            id: id.to_string(),
            operation: Operation::Sum,
            kind: AggregationKind::InverterList {
                inverters: vec!["roof".into(), "garage".into()],
                field: "acPower".into(),
            },
        }
    }

    #[test]
    fn mistyped_field_disables_aggregation() {
        let mut plant = Plant::<FakeModbus>::new();
        plant.add_inverter(&inverter("roof", "10.0.0.1")).unwrap();
        plant
            .add_aggregation(&AggregationConfig {
                id: "typo".into(),
                operation: Operation::Sum,
                kind: AggregationKind::InverterList {
                    inverters: vec!["roof".into()],
                    field: "acpower".into(),
                },
            })
            .unwrap();

        let report = plant.run_cycle();
        assert_eq!(report.inverters.len(), 1);
        assert!(report.aggregations.is_empty());
        assert!(!plant.aggregations().contains("typo"));
    }

    #[test]
    fn unreachable_inverter_is_not_registered() {
        let mut plant = Plant::<FakeModbus>::new();
        assert!(matches!(
            plant.add_inverter(&inverter("roof", "unreachable")),
            Err(PlantError::InverterUnreachable(_))
        ));
        assert_eq!(plant.inverter_ids().count(), 0);
    }

    #[test]
    fn cycle_polls_inverters_and_aggregates() {
        let mut plant = Plant::<FakeModbus>::new();
        plant.add_inverter(&inverter("roof", "10.0.0.1")).unwrap();
        plant.add_inverter(&inverter("garage", "10.0.0.2")).unwrap();
        plant.add_aggregation(&ac_total("ac-total")).unwrap();
        plant.enable_logical_meter("house").unwrap();

        let report = plant.run_cycle();
        assert_eq!(report.inverters.len(), 2);
        assert_eq!(
            report.inverters["roof"].get("acPower"),
            Some(&Value::Signed(1500))
        );
        assert_eq!(report.aggregations["ac-total"], 3000.);
        let (id, meter) = report.logical_meter.unwrap();
        assert_eq!(id, "house");
        assert_eq!(meter.total_production, 3000.);
        assert_eq!(meter.total_consumption, 0.);
        assert!(report.broadcast.is_none());
    }

    #[test]
    fn failed_poll_drops_snapshot_and_reconnects() {
        let mut plant = Plant::<FakeModbus>::new();
        plant.add_inverter(&inverter("roof", "10.0.0.1")).unwrap();
        plant.add_inverter(&inverter("garage", "flaky")).unwrap();
        plant.add_aggregation(&ac_total("ac-total")).unwrap();

        let report = plant.run_cycle();
        assert_eq!(report.inverters.keys().collect::<Vec<_>>(), ["roof"]);
        // garage has not produced a snapshot yet
        assert!(report.aggregations.is_empty());
        assert!(plant.aggregations().contains("ac-total"));
        assert!(plant.inverters["garage"].is_connected());
    }

    #[test]
    fn removing_inverter_disables_dependent_aggregations() {
        let mut plant = Plant::<FakeModbus>::new();
        plant.add_inverter(&inverter("roof", "10.0.0.1")).unwrap();
        plant.add_inverter(&inverter("garage", "10.0.0.2")).unwrap();
        plant.add_aggregation(&ac_total("ac-total")).unwrap();
        plant
            .add_aggregation(&AggregationConfig {
                id: "roof-share".into(),
                operation: Operation::Division,
                kind: AggregationKind::Pair {
                    left: Operand::inverter("roof", "acPower"),
                    right: Operand::aggregation("ac-total"),
                },
            })
            .unwrap();
        assert_eq!(plant.run_cycle().aggregations["roof-share"], 0.5);

        assert!(plant.remove_inverter("garage"));
        let report = plant.run_cycle();
        assert!(report.aggregations.is_empty());
        assert!(plant.aggregations().is_empty());
    }

    #[test]
    fn home_manager_feeds_logical_meter() {
        let mut plant = Plant::<FakeModbus>::new();
        plant.add_inverter(&inverter("roof", "10.0.0.1")).unwrap();

        let (tx, listener) = channel_listener();
        tx.send(frame_with(2000, 5000)).unwrap();
        plant.attach_listener(&home_manager(), listener).unwrap();
        plant.enable_logical_meter("house").unwrap();

        let report = plant.run_cycle();
        let (id, frame) = report.broadcast.unwrap();
        assert_eq!(id, "home-manager");
        assert_eq!(frame.total_power_from_grid, 200.);
        let (_, meter) = report.logical_meter.unwrap();
        assert_eq!(meter.total_production, 1500.);
        assert_eq!(meter.total_consumption, 1200.);
        assert_eq!(meter.solar_consumption, 1000.);

        plant.shutdown();
        assert!(!plant.detach_broadcast_listener());
    }

    #[test]
    fn only_one_home_manager_and_logical_meter() {
        let mut plant = Plant::<FakeModbus>::new();
        let (tx, listener) = channel_listener();
        tx.send(frame_with(0, 0)).unwrap();
        plant.attach_listener(&home_manager(), listener).unwrap();

        let (_tx, second) = channel_listener();
        assert!(matches!(
            plant.attach_listener(&home_manager(), second),
            Err(PlantError::BroadcastAlreadyAttached(_))
        ));

        plant.enable_logical_meter("house").unwrap();
        assert!(matches!(
            plant.enable_logical_meter("other"),
            Err(PlantError::LogicalMeterAlreadyEnabled(_))
        ));
        plant.shutdown();
    }

    #[test]
    fn silent_home_manager_is_unreachable() {
        let mut plant = Plant::<FakeModbus>::new();
        let (_tx, listener) = channel_listener();
        let config = HomeManagerConfig {
            discovery_timeout: Some(0),
            ..home_manager()
        };
        assert!(matches!(
            plant.attach_listener(&config, listener),
            Err(PlantError::BroadcastUnreachable(_))
        ));
        assert!(!plant.detach_broadcast_listener());
    }

    #[test]
    fn from_config_skips_failing_devices() {
        let config = PlantConfig {
            inverters: vec![inverter("roof", "10.0.0.1"), inverter("garage", "unreachable")],
            aggregations: vec![ac_total("ac-total")],
            ..Default::default()
        };
        let mut plant = Plant::<FakeModbus>::from_config(&config);
        assert_eq!(plant.inverter_ids().collect::<Vec<_>>(), ["roof"]);

        // garage was never registered
        let report = plant.run_cycle();
        assert!(report.aggregations.is_empty());
        assert!(plant.aggregations().is_empty());
    }

    #[test]
    fn removing_devices() {
        let mut plant = Plant::<FakeModbus>::new();
        plant.add_inverter(&inverter("roof", "10.0.0.1")).unwrap();
        plant.add_aggregation(&ac_total("ac-total")).unwrap();
        plant.enable_logical_meter("house").unwrap();

        assert!(plant.remove_aggregation("ac-total"));
        assert!(!plant.remove_aggregation("ac-total"));
        assert!(plant.disable_logical_meter());
        assert!(!plant.disable_logical_meter());
        assert!(plant.remove_inverter("roof"));
        assert!(!plant.remove_inverter("roof"));

        let report = plant.run_cycle();
        assert!(report.inverters.is_empty());
        assert!(report.logical_meter.is_none());
        assert!(report.aggregations.is_empty());
    }

    #[test]
    fn reconnecting_devices() {
        let mut plant = Plant::<FakeModbus>::new();
        plant.add_inverter(&inverter("roof", "10.0.0.1")).unwrap();
        plant.add_aggregation(&ac_total("ac-total")).unwrap();

        assert!(plant.reconnect_device("roof").unwrap());
        assert!(matches!(
            plant.reconnect_device("ac-total"),
            Err(PlantError::ReconnectUnsupported(_))
        ));
        assert!(matches!(
            plant.reconnect_device("nope"),
            Err(PlantError::UnknownDevice(_))
        ));
        assert_eq!(plant.reconnect_all(), [("roof".to_string(), true)]);
    }
}
