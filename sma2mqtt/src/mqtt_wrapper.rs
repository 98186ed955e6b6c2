use crate::mqtt_config::MqttConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

pub trait MqttWrapper {
    // This trait decouples library code from an implementation of the MQTT
    // client. The binary wraps its client in a new type implementing it, the
    // integration tests record publications in memory.

    fn publish<S, V>(&mut self, topic: S, qos: QoS, retain: bool, payload: V) -> anyhow::Result<()>
    where
        S: Clone + Into<String>,
        V: Clone + Into<Vec<u8>>;

    /// Creates a client whose id ends in `suffix`.
    fn new(config: &MqttConfig, suffix: &str) -> Self;
}
