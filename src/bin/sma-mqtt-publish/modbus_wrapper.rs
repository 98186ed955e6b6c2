use std::net::ToSocketAddrs;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use sma2mqtt::inverter::ModbusWrapper;
use tokio_modbus::client::sync::{tcp, Context, Reader};
use tokio_modbus::Slave;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TokioModbusWrapper {
    context: Context,
}

impl ModbusWrapper for TokioModbusWrapper {
    fn connect(host: &str, port: u16, unit: u8) -> anyhow::Result<Self> {
        let address = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve {host}"))?
            .next()
            .ok_or_else(|| anyhow!("{host} has no address"))?;
        let mut context =
            tcp::connect_slave_with_timeout(address, Slave(unit), Some(REQUEST_TIMEOUT))?;
        context.set_timeout(REQUEST_TIMEOUT);
        Ok(Self { context })
    }

    fn read_input_registers(&mut self, address: u16, count: u16) -> anyhow::Result<Vec<u16>> {
        Ok(self.context.read_input_registers(address, count)??)
    }
}
