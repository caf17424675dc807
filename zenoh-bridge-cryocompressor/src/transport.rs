//! Register transport seam and its Modbus implementation.

use std::future::Future;

use tokio_modbus::ExceptionCode;
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::prelude::*;

use crate::config::ConnectionConfig;
use crate::error::TransportError;
use crate::registers::RegisterKind;

/// Raw register access to one device.
///
/// Implementations do not retry and do not time out; the
/// [`DeviceAdapter`](crate::device::DeviceAdapter) does both.
pub trait RegisterTransport: Send {
    /// Open the connection. Called lazily before the first operation and
    /// after any connection fault.
    fn connect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, TransportError>> + Send;

    fn write_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Drop the connection.
    fn close(&mut self) -> impl Future<Output = ()> + Send;

    fn is_connected(&self) -> bool;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// Modbus TCP or RTU transport built on tokio-modbus.
pub struct ModbusTransport {
    connection: ConnectionConfig,
    unit_id: u8,
    ctx: Option<Context>,
}

impl std::fmt::Debug for ModbusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusTransport")
            .field("connection", &self.connection)
            .field("unit_id", &self.unit_id)
            .field("connected", &self.ctx.is_some())
            .finish()
    }
}

impl ModbusTransport {
    pub fn new(connection: ConnectionConfig, unit_id: u8) -> Self {
        Self {
            connection,
            unit_id,
            ctx: None,
        }
    }

    fn context(&mut self) -> Result<&mut Context, TransportError> {
        self.ctx.as_mut().ok_or(TransportError::NotConnected)
    }
}

/// Open a fresh context from owned settings; the future must not borrow
/// the transport, whose context is not `Sync`.
async fn open(connection: ConnectionConfig, unit_id: u8) -> Result<Context, TransportError> {
    let slave = Slave(unit_id);

    match &connection {
        ConnectionConfig::Tcp { host, port } => {
            let addr = tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(|e| TransportError::Connection(format!("Cannot resolve {}: {}", host, e)))?
                .next()
                .ok_or_else(|| TransportError::Connection(format!("No address for {}", host)))?;

            tcp::connect_slave(addr, slave)
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))
        }
        ConnectionConfig::Rtu {
            port,
            baud_rate,
            data_bits,
            parity,
            stop_bits,
        } => {
            let parity = match parity.to_lowercase().as_str() {
                "even" => tokio_serial::Parity::Even,
                "odd" => tokio_serial::Parity::Odd,
                _ => tokio_serial::Parity::None,
            };

            let stop_bits = match stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            };

            let data_bits = match data_bits {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            };

            let builder = tokio_serial::new(port, *baud_rate)
                .parity(parity)
                .stop_bits(stop_bits)
                .data_bits(data_bits);

            let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                TransportError::Connection(format!("Serial open failed: {}", e))
            })?;

            Ok(rtu::attach_slave(serial, slave))
        }
    }
}

fn map_response<T>(
    response: Result<Result<T, ExceptionCode>, tokio_modbus::Error>,
) -> Result<T, TransportError> {
    response
        .map_err(|e| TransportError::Connection(e.to_string()))?
        .map_err(|code| TransportError::Rejected(format!("{:?}", code)))
}

impl RegisterTransport for ModbusTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.ctx = None;
        let ctx = open(self.connection.clone(), self.unit_id).await?;
        self.ctx = Some(ctx);
        tracing::debug!(endpoint = %self.connection, unit = self.unit_id, "Modbus connected");
        Ok(())
    }

    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let ctx = self.context()?;
        let response = match kind {
            RegisterKind::Input => ctx.read_input_registers(address, count).await,
            RegisterKind::Holding => ctx.read_holding_registers(address, count).await,
        };
        let registers = map_response(response)?;

        if registers.len() != count as usize {
            return Err(TransportError::Malformed(format!(
                "asked for {} register(s) at {}, got {}",
                count,
                address,
                registers.len()
            )));
        }
        Ok(registers)
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        let ctx = self.context()?;
        map_response(ctx.write_single_register(address, value).await)
    }

    async fn close(&mut self) {
        if self.ctx.take().is_some() {
            tracing::debug!(endpoint = %self.connection, "Modbus connection closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    fn endpoint(&self) -> String {
        format!("{} unit {}", self.connection, self.unit_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_require_connection() {
        let mut transport = ModbusTransport::new(
            ConnectionConfig::Tcp {
                host: "127.0.0.1".into(),
                port: 502,
            },
            1,
        );

        assert!(!transport.is_connected());
        assert_eq!(
            transport.read_registers(RegisterKind::Input, 1, 1).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            transport.write_register(1, 1).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(transport.endpoint(), "tcp://127.0.0.1:502 unit 1");
    }

    fn assert_send<F: Future + Send>(_: F) {}

    #[test]
    fn test_connect_future_is_send() {
        let mut transport = ModbusTransport::new(
            ConnectionConfig::Rtu {
                port: "/dev/ttyUSB0".into(),
                baud_rate: 9600,
                data_bits: 8,
                parity: "none".into(),
                stop_bits: 1,
            },
            1,
        );
        // Never polled; only the bound matters.
        assert_send(transport.connect());
        assert_send(transport.read_registers(RegisterKind::Holding, 1, 1));
    }

    #[test]
    fn test_exception_is_rejection() {
        let response: Result<Result<(), ExceptionCode>, tokio_modbus::Error> =
            Ok(Err(ExceptionCode::IllegalDataValue));
        assert!(matches!(map_response(response), Err(TransportError::Rejected(_))));
    }
}
