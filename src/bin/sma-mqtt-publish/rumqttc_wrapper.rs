use std::{thread, time::Duration};

use log::{debug, warn};
use rumqttc::{
    tokio_rustls::rustls::{ClientConfig, RootCertStore},
    Client, MqttOptions, Transport,
};
use sma2mqtt::{
    mqtt_config::MqttConfig,
    mqtt_wrapper::{self, MqttWrapper},
};

const CLIENT_ID: &str = "sma-mqtt-publisher";
const PUBLISH_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct RumqttcWrapper {
    client: Client,
}

fn match_qos(qos: mqtt_wrapper::QoS) -> rumqttc::QoS {
    match qos {
        mqtt_wrapper::QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        mqtt_wrapper::QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        mqtt_wrapper::QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn tls_transport() -> Transport {
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("skipping platform certificate: {e}");
    }
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!("loaded {added} root certificates, ignored {ignored}");

    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Transport::tls_with_config(client_config.into())
}

impl MqttWrapper for RumqttcWrapper {
    fn publish<S, V>(
        &mut self,
        topic: S,
        qos: mqtt_wrapper::QoS,
        retain: bool,
        payload: V,
    ) -> anyhow::Result<()>
    where
        S: Clone + Into<String>,
        V: Clone + Into<Vec<u8>>,
    {
        // the request queue may be full while the broker is unreachable
        for _ in 1..PUBLISH_ATTEMPTS {
            let attempt =
                self.client
                    .try_publish(topic.clone(), match_qos(qos), retain, payload.clone());
            if attempt.is_ok() {
                return Ok(());
            }
            thread::sleep(RETRY_DELAY);
        }
        Ok(self
            .client
            .try_publish(topic, match_qos(qos), retain, payload)?)
    }

    fn new(config: &MqttConfig, suffix: &str) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| CLIENT_ID.to_string())
            + suffix;
        let mut options = MqttOptions::new(client_id, &config.host, config.port());
        options.set_keep_alive(Duration::from_secs(5));
        if config.use_tls() {
            options.set_transport(tls_transport());
        }
        if let Some((username, password)) = config.credentials() {
            options.set_credentials(username, password);
        }

        let (client, mut connection) = Client::new(options, 512);

        thread::spawn(move || {
            // drives the event loop so queued messages go out; ends once the
            // client is dropped
            for notification in connection.iter() {
                if let Err(e) = notification {
                    debug!("mqtt connection: {e}");
                    thread::sleep(Duration::from_secs(1));
                }
            }
        });
        Self { client }
    }
}
