use crate::{
    metric_collector::MetricCollector,
    mqtt_config::MqttConfig,
    mqtt_wrapper::{MqttWrapper, QoS},
    plant::CycleReport,
};

use log::{debug, warn};
use serde::Serialize;

const BASE_TOPIC: &str = "sma";

/// Publishes every value of a cycle under `sma/<device>/<field>`.
pub struct SimpleMqtt<MQTT: MqttWrapper> {
    client: MQTT,
    qos: QoS,
}

impl<MQTT: MqttWrapper> SimpleMqtt<MQTT> {
    pub fn new(config: &MqttConfig) -> Self {
        let client = MQTT::new(config, "-sm");
        Self {
            client,
            qos: config.qos(),
        }
    }

    pub fn client(&self) -> &MQTT {
        &self.client
    }
}

fn topic(device: &str, field: &str) -> String {
    format!("{BASE_TOPIC}/{device}/{field}")
}

fn push_state<T: Serialize>(pairs: &mut Vec<(String, String)>, device: &str, state: &T) {
    match serde_json::to_string(state) {
        Ok(json) => pairs.push((topic(device, "state"), json)),
        Err(e) => warn!("cannot serialize state of {device}: {e}"),
    }
}

/// Topic and payload of every message published for one cycle.
pub fn topic_payload_pairs(report: &CycleReport) -> Vec<(String, String)> {
    let mut pairs = vec![(
        format!("{BASE_TOPIC}/last_update"),
        report.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
    )];

    for (device, snapshot) in &report.inverters {
        pairs.extend(
            snapshot
                .iter()
                .map(|(field, value)| (topic(device, field), value.to_string())),
        );
        push_state(&mut pairs, device, snapshot);
    }

    if let Some((device, frame)) = &report.broadcast {
        pairs.extend(
            frame
                .fields()
                .into_iter()
                .map(|(field, value)| (topic(device, field), value.to_string())),
        );
        push_state(&mut pairs, device, frame);
    }

    if let Some((device, meter)) = &report.logical_meter {
        pairs.extend(
            meter
                .fields()
                .into_iter()
                .map(|(field, value)| (topic(device, field), value.to_string())),
        );
        push_state(&mut pairs, device, meter);
    }

    pairs.extend(
        report
            .aggregations
            .iter()
            .map(|(id, value)| (topic(id, "value"), value.to_string())),
    );
    pairs
}

impl<MQTT: MqttWrapper> MetricCollector for SimpleMqtt<MQTT> {
    fn publish(&mut self, report: &CycleReport) {
        let pairs = topic_payload_pairs(report);
        debug!("publishing {} values", pairs.len());

        pairs.into_iter().for_each(|(topic, payload)| {
            if let Err(e) = self.client.publish(topic, self.qos, true, payload) {
                warn!("mqtt error: {e:?}")
            }
        });
    }
}
