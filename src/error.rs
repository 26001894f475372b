//! Error taxonomy shared by the transport, the driver and the orchestrator.

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};

/// Why a single bus transaction failed.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum BusFault {
    /// The serial line itself failed (timeout, disconnect, short read).
    #[display("I/O error: {message}")]
    Io { message: String },
    /// The device answered with a Modbus exception response.
    #[display("device exception 0x{code:02X}")]
    Exception { code: u8 },
    /// The device answered with something that is not a valid reply.
    #[display("protocol error: {message}")]
    Protocol { message: String },
}

impl BusFault {
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Faults after which the session can no longer be trusted.
    pub fn breaks_link(&self) -> bool {
        !matches!(self, BusFault::Exception { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum MachineError {
    #[display("Failed to open port {port}: {cause}")]
    ConnectionFailed { port: String, cause: String },

    #[display("Cannot establish connection to coffee machine on {port}")]
    ConnectionUnavailable { port: String },

    #[display("Error reading {count} register(s) at {address}: {cause}")]
    ReadFailed {
        address: u16,
        count: u16,
        cause: BusFault,
    },

    #[display("Failed to write value {value} to register {address}: {cause}")]
    WriteFailed {
        address: u16,
        value: u16,
        cause: BusFault,
    },

    #[display("{reason}")]
    InvalidArgument { reason: String },

    #[display("Group {group} is currently busy")]
    GroupBusy { group: u8 },

    #[display("Group {group} is near automatic purge ({countdown}s). Please wait.")]
    NearPurge { group: u8, countdown: u16 },

    #[display("Timeout waiting for group {group} to become free after {waited_ms}ms")]
    Timeout { group: u8, waited_ms: u64 },
}

/// Stable, serializable classification of a [`MachineError`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    ConnectionFailed,
    ConnectionUnavailable,
    ReadFailed,
    WriteFailed,
    InvalidArgument,
    GroupBusy,
    NearPurge,
    Timeout,
}

impl MachineError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MachineError::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            MachineError::ConnectionUnavailable { .. } => ErrorKind::ConnectionUnavailable,
            MachineError::ReadFailed { .. } => ErrorKind::ReadFailed,
            MachineError::WriteFailed { .. } => ErrorKind::WriteFailed,
            MachineError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            MachineError::GroupBusy { .. } => ErrorKind::GroupBusy,
            MachineError::NearPurge { .. } => ErrorKind::NearPurge,
            MachineError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Errors raised by a precondition check before anything was sent.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            MachineError::InvalidArgument { .. }
                | MachineError::GroupBusy { .. }
                | MachineError::NearPurge { .. }
        )
    }

    /// Errors that mean the physical link is (or just went) down.
    pub fn is_connection_issue(&self) -> bool {
        match self {
            MachineError::ConnectionFailed { .. } | MachineError::ConnectionUnavailable { .. } => {
                true
            }
            MachineError::ReadFailed { cause, .. } | MachineError::WriteFailed { cause, .. } => {
                cause.breaks_link()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_human_readable() {
        let busy = MachineError::GroupBusy { group: 2 };
        assert_eq!(busy.to_string(), "Group 2 is currently busy");

        let purge = MachineError::NearPurge {
            group: 1,
            countdown: 7,
        };
        assert_eq!(
            purge.to_string(),
            "Group 1 is near automatic purge (7s). Please wait."
        );

        let read = MachineError::ReadFailed {
            address: 256,
            count: 1,
            cause: BusFault::Exception { code: 2 },
        };
        assert_eq!(
            read.to_string(),
            "Error reading 1 register(s) at 256: device exception 0x02"
        );
    }

    #[test]
    fn test_exception_does_not_break_link() {
        let exception = MachineError::ReadFailed {
            address: 0,
            count: 1,
            cause: BusFault::Exception { code: 2 },
        };
        assert!(!exception.is_connection_issue());

        let timeout = MachineError::ReadFailed {
            address: 0,
            count: 1,
            cause: BusFault::io("timed out"),
        };
        assert!(timeout.is_connection_issue());
        assert_eq!(timeout.kind().as_ref(), "read_failed");
    }

    #[test]
    fn test_rejections() {
        assert!(MachineError::invalid("bad group").is_rejection());
        assert!(MachineError::GroupBusy { group: 1 }.is_rejection());
        assert!(!MachineError::ConnectionUnavailable {
            port: "/dev/ttyUSB0".into()
        }
        .is_rejection());
    }
}
