use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by a device state source.
///
/// `Transport`, `Timeout` and `NotConnected` form the transport category: the
/// connection manager reacts to them by scheduling a background reconnect.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("No live session to the device proxy")]
    NotConnected,

    #[error("Write to {tag} rejected with status {status}")]
    WriteRejected { tag: String, status: String },

    #[error("Operation cancelled by shutdown")]
    Cancelled,
}

impl DeviceError {
    /// True for the errors that mean the session itself is in doubt.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DeviceError::Transport(_) | DeviceError::Timeout { .. } | DeviceError::NotConnected
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeviceError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_category() {
        assert!(DeviceError::Transport("reset".into()).is_transport());
        assert!(DeviceError::NotConnected.is_transport());
        assert!(DeviceError::Timeout {
            operation: "read",
            after: Duration::from_secs(1)
        }
        .is_transport());
        assert!(!DeviceError::Cancelled.is_transport());
        assert!(!DeviceError::WriteRejected {
            tag: "ControlCommand".into(),
            status: "BadNotWritable".into()
        }
        .is_transport());
    }

    #[test]
    fn messages_name_the_operation() {
        let err = DeviceError::Timeout {
            operation: "connect",
            after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "connect timed out after 250ms");
    }
}
