use log::warn;
use serde_derive::Deserialize;

use crate::mqtt_wrapper::QoS;

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub tls: Option<bool>,
    /// MQTT quality of service level, 0 to 2.
    pub qos: Option<u8>,
}

impl MqttConfig {
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty()
    }

    /// Port to connect to, 8883 with TLS and 1883 otherwise.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.use_tls() { 8883 } else { 1883 })
    }

    pub fn use_tls(&self) -> bool {
        self.tls.is_some_and(|tls| tls)
    }

    pub fn qos(&self) -> QoS {
        match self.qos {
            None | Some(0) => QoS::AtMostOnce,
            Some(1) => QoS::AtLeastOnce,
            Some(2) => QoS::ExactlyOnce,
            Some(level) => {
                warn!("invalid MQTT qos {level}, using 0");
                QoS::AtMostOnce
            }
        }
    }

    /// Username and password, an absent password is sent as empty.
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = self.username.clone()?;
        Some((username, self.password.clone().unwrap_or_default()))
    }
}
