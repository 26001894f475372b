use anyhow::{anyhow, Result};
use std::{
    io::{ErrorKind, Read, Write},
    time::{Duration, Instant},
};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::{Transport, TransportFactory};
use crate::{
    config::SerialSettings,
    error::{BusFault, MachineError},
    protocol::frame::{
        exception_code, expected_len, generate_get_holdings_request, generate_set_holding_request,
        hex_dump, parse_get_holdings_response, parse_set_holding_response,
        read_holdings_response_len, WRITE_HOLDING_RESPONSE_LEN,
    },
};

/// Open a serial port as 8N1 with the given timeout.
///
/// On Unix the port is opened in exclusive mode so a second controller
/// cannot interleave frames on the same line.
pub fn open_serial_port(
    port: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>> {
    let builder = serialport::new(port, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(timeout);

    #[cfg(unix)]
    {
        let mut handle = builder
            .open_native()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))?;
        handle
            .set_exclusive(true)
            .map_err(|err| anyhow!("Failed to acquire exclusive access to {port}: {err}"))?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        builder
            .open()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))
    }
}

/// Modbus RTU master over a physical serial line.
pub struct SerialTransport {
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: None,
        }
    }

    /// One request/response exchange. Returns the raw reply, which may be an
    /// exception frame.
    fn exchange(&mut self, request: &[u8], full_len: usize) -> Result<Vec<u8>, BusFault> {
        let timeout = self.settings.timeout();
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| BusFault::io("port is not open"))?;

        // Stale bytes from an earlier, timed out exchange would shift the frame.
        if let Err(err) = port.clear(ClearBuffer::Input) {
            log::debug!("clear input buffer failed: {err}");
        }

        log::debug!("TX {}", hex_dump(request));
        port.write_all(request)
            .map_err(|err| BusFault::io(format!("write failed: {err}")))?;
        port.flush()
            .map_err(|err| BusFault::io(format!("flush failed: {err}")))?;

        let deadline = Instant::now() + timeout;
        let mut response = Vec::with_capacity(full_len);
        let mut buffer = [0u8; 256];
        while response.len() < expected_len(&response, full_len) {
            if Instant::now() >= deadline {
                break;
            }
            match port.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buffer[..n]),
                Err(err) if err.kind() == ErrorKind::TimedOut => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(BusFault::io(format!("read failed: {err}"))),
            }
        }
        log::debug!("RX {}", hex_dump(&response));

        if response.is_empty() {
            return Err(BusFault::io(format!(
                "no response within {}ms",
                timeout.as_millis()
            )));
        }
        if response[0] != self.settings.slave_id {
            return Err(BusFault::protocol(format!(
                "slave id mismatch: expected {}, got {}",
                self.settings.slave_id, response[0]
            )));
        }
        if let Some(code) = exception_code(&response) {
            return Err(BusFault::Exception { code });
        }
        if response.len() < full_len {
            return Err(BusFault::io(format!(
                "short response: {} of {full_len} bytes",
                response.len()
            )));
        }
        Ok(response)
    }
}

impl Transport for SerialTransport {
    fn port(&self) -> &str {
        &self.settings.port
    }

    fn open(&mut self) -> Result<(), MachineError> {
        if self.port.is_some() {
            return Ok(());
        }
        let handle = open_serial_port(
            &self.settings.port,
            self.settings.baud_rate,
            self.settings.timeout(),
        )
        .map_err(|err| MachineError::ConnectionFailed {
            port: self.settings.port.clone(),
            cause: err.to_string(),
        })?;
        log::info!(
            "Opened {} at {} baud (8N1, slave {})",
            self.settings.port,
            self.settings.baud_rate,
            self.settings.slave_id
        );
        self.port = Some(handle);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("Closed {}", self.settings.port);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, MachineError> {
        let fail = |cause: BusFault| MachineError::ReadFailed {
            address,
            count,
            cause,
        };
        let (mut request, raw) =
            generate_get_holdings_request(self.settings.slave_id, address, count)
                .map_err(|err| fail(BusFault::protocol(err.to_string())))?;
        let response = self
            .exchange(&raw, read_holdings_response_len(count))
            .map_err(fail)?;
        parse_get_holdings_response(&mut request, &response, count)
            .map_err(|err| fail(BusFault::protocol(err.to_string())))
    }

    fn write_register(&mut self, address: u16, value: u16) -> Result<(), MachineError> {
        let fail = |cause: BusFault| MachineError::WriteFailed {
            address,
            value,
            cause,
        };
        let (mut request, raw) =
            generate_set_holding_request(self.settings.slave_id, address, value)
                .map_err(|err| fail(BusFault::protocol(err.to_string())))?;
        let response = self
            .exchange(&raw, WRITE_HOLDING_RESPONSE_LEN)
            .map_err(fail)?;
        parse_set_holding_response(&mut request, &response)
            .map_err(|err| fail(BusFault::protocol(err.to_string())))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SerialTransportFactory;

impl TransportFactory for SerialTransportFactory {
    fn create(&self, settings: &SerialSettings) -> Box<dyn Transport> {
        Box::new(SerialTransport::new(settings.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unopened_transport_reports_io_fault() {
        let mut transport = SerialTransport::new(SerialSettings::default());
        assert!(!transport.is_open());
        let err = transport.read_registers(0x100, 1).unwrap_err();
        match err {
            MachineError::ReadFailed { address, cause, .. } => {
                assert_eq!(address, 0x100);
                assert!(cause.breaks_link());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_open_missing_port_fails() {
        let settings = SerialSettings {
            port: "/dev/brewctl-does-not-exist".to_string(),
            ..SerialSettings::default()
        };
        let mut transport = SerialTransportFactory.create(&settings);
        let err = transport.open().unwrap_err();
        assert!(matches!(err, MachineError::ConnectionFailed { .. }));
        assert!(!transport.is_open());
        transport.close();
    }
}
