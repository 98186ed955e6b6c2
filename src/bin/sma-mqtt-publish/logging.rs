use env_logger::{Builder, Env};

// transport crates log every reconnect attempt at info
const DEFAULT_FILTER: &str = "info,rumqttc=warn,tokio_modbus=warn";

pub fn init_logger() {
    Builder::from_env(Env::default().default_filter_or(DEFAULT_FILTER))
        .format_timestamp_secs()
        .init();
}
