//! Driver fault types

use thiserror::Error;

/// Faults raised by the native imaging layer
///
/// The set is closed. Native failures are classified at the driver boundary.
/// Either variant may be raised at any time, including spuriously on a
/// device that is otherwise healthy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverFault {
    /// Communication with the device failed (cable, power, busy bus)
    #[error("Device communication error: {0}")]
    CommunicationError(String),

    /// The driver or device was in a state that does not allow the call
    #[error("Driver invalid state: {0}")]
    InvalidState(String),
}

impl DriverFault {
    /// Whether repeating the call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverFault::CommunicationError(_))
    }
}

/// Type alias for driver results
pub type DriverResult<T> = std::result::Result<T, DriverFault>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let fault = DriverFault::CommunicationError("paper jam".to_string());
        let msg = format!("{}", fault);
        assert!(msg.contains("communication"));
        assert!(msg.contains("paper jam"));

        let fault = DriverFault::InvalidState("busy".to_string());
        assert!(format!("{}", fault).contains("invalid state"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(DriverFault::CommunicationError(String::new()).is_transient());
        assert!(!DriverFault::InvalidState(String::new()).is_transient());
    }
}
