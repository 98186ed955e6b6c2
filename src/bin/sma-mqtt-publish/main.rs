mod config;
mod logging;
mod modbus_wrapper;
mod rumqttc_wrapper;

use std::process::ExitCode;

use config::Config;
use crossbeam_channel::RecvTimeoutError;
use log::{debug, error, info, warn};
use modbus_wrapper::TokioModbusWrapper;
use rumqttc_wrapper::RumqttcWrapper;
use sma2mqtt::metric_collector::MetricCollector;
use sma2mqtt::plant::Plant;
use sma2mqtt::simple_mqtt::SimpleMqtt;

fn main() -> ExitCode {
    logging::init_logger();
    info!("Running revision: {}", env!("GIT_HASH"));
    if std::env::args().len() > 1 {
        error!("Arguments passed. Tool is configured by config.toml in its path");
    }

    let config = Config::load();
    if !config.is_valid() {
        error!("No devices configured, nothing to do");
        return ExitCode::FAILURE;
    }
    let poll_interval = config.poll_interval();
    info!("polling every {}s", poll_interval.as_secs());

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    }) {
        error!("cannot install signal handler: {e}");
        return ExitCode::FAILURE;
    }

    let mut output_channels: Vec<Box<dyn MetricCollector>> = Vec::new();
    match config.simple_mqtt {
        Some(ref mqtt) if mqtt.is_valid() => {
            info!("Publishing to simple MQTT broker {}", mqtt.host);
            output_channels.push(Box::new(SimpleMqtt::<RumqttcWrapper>::new(mqtt)));
        }
        _ => warn!("No MQTT broker configured, cycle results are only logged at debug level"),
    }

    let mut plant = Plant::<TokioModbusWrapper>::from_config(&config.plant);

    loop {
        let report = plant.run_cycle();
        info!(
            "cycle done: {} inverters, {} aggregations",
            report.inverters.len(),
            report.aggregations.len()
        );
        debug!("{report:?}");
        output_channels
            .iter_mut()
            .for_each(|channel| channel.publish(&report));

        match stop_rx.recv_timeout(poll_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("shutting down");
    plant.shutdown();
    ExitCode::SUCCESS
}
