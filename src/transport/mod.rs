//! Byte-level access to the machine's Modbus node.
//!
//! A [`Transport`] owns one serial session. The driver never touches the
//! port directly; it goes through this trait so the same logic runs against
//! real hardware and against the in-process [`simulator`].

pub mod serial;
pub mod simulator;

pub use serial::{SerialTransport, SerialTransportFactory};
pub use simulator::{SimulatedMachine, SimulatorFactory, SimulatorTransport};

use crate::{config::SerialSettings, error::MachineError};

pub trait Transport: Send {
    /// Port name this transport was created for.
    fn port(&self) -> &str;

    /// Open the session. Opening an already open transport is a no-op.
    fn open(&mut self) -> Result<(), MachineError>;

    /// Release the session. Safe to call when already closed.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Read `count` consecutive holding registers starting at `address`.
    fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, MachineError>;

    /// Write a single holding register.
    fn write_register(&mut self, address: u16, value: u16) -> Result<(), MachineError>;
}

/// Builds transports for a given serial configuration.
pub trait TransportFactory: Send + Sync {
    fn create(&self, settings: &SerialSettings) -> Box<dyn Transport>;
}
