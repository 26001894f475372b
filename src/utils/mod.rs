//! Shared utilities for brewctl

pub mod ports;

pub use ports::*;
