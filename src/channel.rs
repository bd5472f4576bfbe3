//! Channel-related data types read from channel data and surfaced to the web application.

use std::fmt;

/// Error returned when parsing an invalid call direction string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCallDirectionError(pub String);

impl fmt::Display for ParseCallDirectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown call direction: {}", self.0)
    }
}

impl std::error::Error for ParseCallDirectionError {}

define_wire_enum! {
    error_type: ParseCallDirectionError,
    /// Call direction from the `Call-Direction` header. Wire format is lowercase.
    ///
    /// `Outbound` legs were originated by the REST side (their URLs travel in
    /// channel variables set by the originating leg); `Inbound` legs arrived
    /// from the network and fall back to the configured default answer URL.
    pub enum CallDirection {
        Inbound => "inbound",
        Outbound => "outbound",
    }
}

/// Error returned when parsing an invalid call status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCallStatusError(pub String);

impl fmt::Display for ParseCallStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown call status: {}", self.0)
    }
}

impl std::error::Error for ParseCallStatusError {}

define_wire_enum! {
    error_type: ParseCallStatusError,
    /// `CallStatus` session parameter sent with every fetch and notification.
    pub enum CallStatus {
        Ringing => "ringing",
        InProgress => "in-progress",
        Completed => "completed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_round_trip() {
        assert_eq!(CallDirection::Inbound.to_string(), "inbound");
        assert_eq!(
            "OUTBOUND".parse::<CallDirection>(),
            Ok(CallDirection::Outbound)
        );
        assert!("sideways"
            .parse::<CallDirection>()
            .is_err());
    }

    #[test]
    fn call_status_wire_names() {
        assert_eq!(CallStatus::InProgress.to_string(), "in-progress");
        assert_eq!(
            "completed".parse::<CallStatus>(),
            Ok(CallStatus::Completed)
        );
    }
}
