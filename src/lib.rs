//! brewctl: supervisory controller for multi-group espresso machines
//! speaking Modbus RTU over a serial line.
//!
//! The driver (`driver`) owns the serial session and turns register reads
//! into typed snapshots. The orchestrator serializes deliveries per group and
//! keeps a bounded ledger of them, and the `controller` wires both to the
//! cache, the event channel and the configuration. The HTTP API and the CLI
//! are thin shells over the controller.

pub mod api;
#[doc(hidden)]
pub mod boot;
#[doc(hidden)]
pub mod cli;
pub mod cache;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod events;
pub mod manager;
pub mod orchestrator;
pub mod protocol;
pub mod tasks;
pub mod transport;
#[doc(hidden)]
pub mod utils;

pub use controller::Controller;
pub use driver::CoffeeMachine;
pub use error::MachineError;
