use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use log::{info, warn};
use serde_derive::Deserialize;
use sma2mqtt::mqtt_config::MqttConfig;
use sma2mqtt::plant_config::PlantConfig;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

const CONFIG_FILE: &str = "config.toml";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// Seconds between two cycles; kept raw so a bad value can fall back.
    poll_interval: Option<toml::Value>,
    #[serde(flatten)]
    pub plant: PlantConfig,
    pub simple_mqtt: Option<MqttConfig>,
}

impl Config {
    pub fn is_valid(&self) -> bool {
        !self.plant.is_empty()
    }

    pub fn poll_interval(&self) -> Duration {
        match &self.poll_interval {
            None => DEFAULT_POLL_INTERVAL,
            Some(toml::Value::Integer(secs)) if *secs > 0 => Duration::from_secs(*secs as u64),
            Some(value) => {
                warn!(
                    "invalid poll interval {value}, using default of {}s",
                    DEFAULT_POLL_INTERVAL.as_secs()
                );
                DEFAULT_POLL_INTERVAL
            }
        }
    }

    pub fn parse(contents: &str) -> Config {
        match toml::from_str::<Config>(contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("toml config unparsable: {e}");
                Config::default()
            }
        }
    }

    /// Reads `config.toml` from the working directory, or next to the
    /// executable, then applies environment overrides.
    pub fn load() -> Config {
        let contents = match config_path().map(|path| {
            info!("loading configuration from {}", path.display());
            fs::read_to_string(path)
        }) {
            Some(Ok(contents)) => contents,
            Some(Err(e)) => {
                warn!("Could not read {CONFIG_FILE}: {e}");
                "".into()
            }
            None => {
                warn!("{CONFIG_FILE} not found");
                "".into()
            }
        };
        let mut config = Config::parse(&contents);
        config.apply_overrides(|name| env::var(name).ok());
        config
    }

    /// Overwrites values with those of the named variables `var` returns.
    pub fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // $POLL_INTERVAL
        if let Some(interval) = var("POLL_INTERVAL") {
            self.poll_interval = Some(match interval.trim().parse::<i64>() {
                Ok(secs) => toml::Value::Integer(secs),
                Err(_) => toml::Value::String(interval),
            });
        }
        // $MQTT_BROKER_HOST
        if let Some(host) = var("MQTT_BROKER_HOST") {
            self.mqtt().host = host;
        }
        // $MQTT_USERNAME (optional)
        if let Some(username) = var("MQTT_USERNAME") {
            self.mqtt().username = Some(username);
        }
        // $MQTT_PASSWORD (optional)
        if let Some(password) = var("MQTT_PASSWORD") {
            self.mqtt().password = Some(password);
        }
        // $MQTT_PORT (optional)
        if let Some(port) = var("MQTT_PORT") {
            let port = port.parse().unwrap_or_else(|_| {
                warn!("invalid MQTT_PORT {port}, using 1883");
                1883
            });
            self.mqtt().port = Some(port);
        }
    }

    fn mqtt(&mut self) -> &mut MqttConfig {
        self.simple_mqtt.get_or_insert_with(MqttConfig::default)
    }
}

fn config_path() -> Option<PathBuf> {
    let local = Path::new(CONFIG_FILE);
    if local.exists() {
        return Some(local.to_path_buf());
    }
    info!("{CONFIG_FILE} does not exist in working directory. Trying relative path");
    let mut path = env::current_exe().ok()?;
    path.pop();
    path.push(CONFIG_FILE);
    path.exists().then_some(path)
}
