// externally visible interfaces
pub mod aggregation;
pub mod broadcast;
pub mod broadcast_listener;
pub mod inverter;
pub mod logical_meter;
pub mod metric_collector;
pub mod mqtt_config;
pub mod mqtt_wrapper;
pub mod plant;
pub mod plant_config;
pub mod registers;
pub mod simple_mqtt;
pub mod snapshot;
