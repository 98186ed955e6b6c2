use crate::registers::{self, DecodeError, RegisterSpec, REGISTERS};
use crate::snapshot::{InverterSnapshot, Value};

use log::{debug, info, warn};
use thiserror::Error;

/// Modbus unit id SMA inverters answer on.
pub const UNIT_ID: u8 = 3;

pub const DEFAULT_PORT: u16 = 502;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetworkState {
    Unknown,
    Online,
    Offline,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,
    #[error("reading register {address} failed: {error:#}")]
    Read { address: u16, error: anyhow::Error },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

pub trait ModbusWrapper {
    // This trait decouples the inverter client from a Modbus/TCP
    // implementation. The binary wraps a real client in a new type that
    // implements it, tests use an in-memory register map.

    fn connect(host: &str, port: u16, unit: u8) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Function code 4, `count` words starting at `address`.
    fn read_input_registers(&mut self, address: u16, count: u16) -> anyhow::Result<Vec<u16>>;
}

/// Owns the Modbus/TCP connection to a single inverter.
pub struct InverterClient<M: ModbusWrapper> {
    host: String,
    port: u16,
    connection: Option<M>,
    state: NetworkState,
}

impl<M: ModbusWrapper> InverterClient<M> {
    /// Creates a disconnected client; call [`InverterClient::connect`] before polling.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            connection: None,
            state: NetworkState::Unknown,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn set_state(&mut self, new_state: NetworkState) {
        if self.state != new_state {
            self.state = new_state;
            info!("Inverter {}:{} is {new_state:?}", self.host, self.port);
        }
    }

    /// Opens the connection unless one is already open.
    pub fn connect(&mut self) -> bool {
        if self.connection.is_some() {
            return true;
        }
        match M::connect(&self.host, self.port, UNIT_ID) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.set_state(NetworkState::Online);
                true
            }
            Err(e) => {
                warn!("connecting to {}:{} failed: {e:#}", self.host, self.port);
                self.set_state(NetworkState::Offline);
                false
            }
        }
    }

    pub fn close(&mut self) {
        if self.connection.take().is_some() {
            debug!("closed connection to {}:{}", self.host, self.port);
        }
    }

    pub fn reconnect(&mut self) -> bool {
        self.close();
        self.connect()
    }

    fn read_register(connection: &mut M, spec: &RegisterSpec) -> Result<Value, ConnectionError> {
        let words = connection
            .read_input_registers(spec.address, spec.word_count())
            .map_err(|error| ConnectionError::Read {
                address: spec.address,
                error,
            })?;
        Ok(registers::decode(&words, spec)?)
    }

    /// Reads the full register table.
    ///
    /// Either every register is read and decoded or the poll fails as a
    /// whole; partial snapshots are never returned.
    pub fn poll(&mut self) -> Result<InverterSnapshot, ConnectionError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(ConnectionError::NotConnected)?;

        let result = REGISTERS
            .iter()
            .map(|spec| Self::read_register(connection, spec).map(|value| (spec.name, value)))
            .collect::<Result<InverterSnapshot, _>>();

        match &result {
            Ok(_) => self.set_state(NetworkState::Online),
            Err(e) => {
                debug!("{e}");
                self.set_state(NetworkState::Offline);
            }
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::bail;
    use std::collections::HashMap;

    /// Serves every register from a fixed map; unknown addresses read as zero.
    pub struct FakeModbus {
        pub registers: HashMap<u16, Vec<u16>>,
        pub fail_at: Option<u16>,
    }

    impl FakeModbus {
        pub fn with_ac_power(ac_power: i32) -> Self {
            let raw = ac_power as u32;
            let [hi, lo] = [(raw >> 16) as u16, raw as u16];
            Self {
                registers: HashMap::from([(30775, vec![hi, lo])]),
                fail_at: None,
            }
        }
    }

    impl ModbusWrapper for FakeModbus {
        fn connect(host: &str, _port: u16, unit: u8) -> anyhow::Result<Self> {
            assert_eq!(unit, UNIT_ID);
            match host {
                "unreachable" => bail!("connection refused"),
                "flaky" => Ok(Self {
                    registers: HashMap::new(),
                    fail_at: Some(30813),
                }),
                _ => Ok(Self::with_ac_power(1500)),
            }
        }

        fn read_input_registers(&mut self, address: u16, count: u16) -> anyhow::Result<Vec<u16>> {
            if self.fail_at == Some(address) {
                bail!("timeout");
            }
            Ok(self
                .registers
                .get(&address)
                .cloned()
                .unwrap_or_else(|| vec![0; usize::from(count)]))
        }
    }

    #[test]
    fn poll_reads_every_register() {
        let mut client = InverterClient::<FakeModbus>::new("inverter", DEFAULT_PORT);
        assert!(client.connect());

        let snapshot = client.poll().unwrap();
        assert_eq!(snapshot.len(), REGISTERS.len());
        assert_eq!(snapshot.get("acPower"), Some(&Value::Signed(1500)));
        assert_eq!(snapshot.get("acVoltage"), Some(&Value::Float(0.)));
        assert_eq!(client.state(), NetworkState::Online);
    }

    #[test]
    fn poll_without_connection_fails() {
        let mut client = InverterClient::<FakeModbus>::new("inverter", DEFAULT_PORT);
        assert!(matches!(client.poll(), Err(ConnectionError::NotConnected)));
    }

    #[test]
    fn failed_read_aborts_whole_poll() {
        let mut client = InverterClient::<FakeModbus>::new("flaky", DEFAULT_PORT);
        assert!(client.connect());

        let result = client.poll();
        assert!(matches!(
            result,
            Err(ConnectionError::Read { address: 30813, .. })
        ));
        assert_eq!(client.state(), NetworkState::Offline);
    }

    #[test]
    fn short_response_is_a_connection_error() {
        let mut client = InverterClient::<FakeModbus>::new("inverter", DEFAULT_PORT);
        assert!(client.connect());
        client
            .connection
            .as_mut()
            .unwrap()
            .registers
            .insert(30517, vec![1, 2]);

        assert!(matches!(
            client.poll(),
            Err(ConnectionError::Decode(DecodeError::ShortRead { address: 30517, .. }))
        ));
    }

    #[test]
    fn reconnect_is_idempotent() {
        let mut client = InverterClient::<FakeModbus>::new("inverter", DEFAULT_PORT);
        assert!(client.reconnect());
        assert!(client.reconnect());
        assert!(client.is_connected());

        client.close();
        client.close();
        assert!(!client.is_connected());
    }

    #[test]
    fn unreachable_inverter_does_not_connect() {
        let mut client = InverterClient::<FakeModbus>::new("unreachable", DEFAULT_PORT);
        assert!(!client.connect());
        assert!(!client.reconnect());
        assert_eq!(client.state(), NetworkState::Offline);
    }
}
