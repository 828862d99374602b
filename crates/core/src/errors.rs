use thiserror::Error;

use crate::domain::session::{SessionId, SessionStatus};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("session {session_id} is {status:?} and accepts no further turns")]
    InvalidSessionState { session_id: SessionId, status: SessionStatus },
    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidStatusTransition { from: SessionStatus, to: SessionStatus },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("configuration not found: {0}")]
    ConfigurationNotFound(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    /// Text that is safe to speak to a caller.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "Sorry, this call has already ended. Please call back to start a new quote."
            }
            Self::ServiceUnavailable { .. } => {
                "Sorry, we're having trouble right now. Please call back in a few minutes."
            }
            Self::Internal { .. } => {
                "Sorry, we can't take this call right now. Please call our main office."
            }
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(error @ DomainError::InvalidSessionState { .. }) => {
                Self::BadRequest { message: error.to_string(), correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Domain(error) => {
                Self::Internal { message: error.to_string(), correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::ConfigurationNotFound(message)
            | ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::session::{SessionId, SessionStatus};
    use crate::errors::{ApplicationError, DomainError, InterfaceError};

    #[test]
    fn terminal_session_maps_to_bad_request_with_correlation_id() {
        let interface = ApplicationError::from(DomainError::InvalidSessionState {
            session_id: SessionId("CA-9".to_owned()),
            status: SessionStatus::Complete,
        })
        .into_interface("CA-9");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest { ref correlation_id, .. } if correlation_id == "CA-9"
        ));
        assert_eq!(interface.correlation_id(), "CA-9");
    }

    #[test]
    fn broken_invariants_map_to_internal_not_call_ended() {
        let transition = ApplicationError::from(DomainError::InvalidStatusTransition {
            from: SessionStatus::AwaitingExtraction,
            to: SessionStatus::AwaitingExtraction,
        })
        .into_interface("CA-10");
        assert!(matches!(transition, InterfaceError::Internal { .. }));
        assert!(!transition.user_message().contains("already ended"));

        let invariant = ApplicationError::from(DomainError::InvariantViolation("lost session".to_owned()))
            .into_interface("CA-11");
        assert!(matches!(invariant, InterfaceError::Internal { .. }));
    }

    #[test]
    fn persistence_error_maps_to_service_unavailable() {
        let interface = ApplicationError::Persistence("database lock timeout".to_owned())
            .into_interface("req-3");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            interface.user_message(),
            "Sorry, we're having trouble right now. Please call back in a few minutes."
        );
    }

    #[test]
    fn missing_business_maps_to_internal_apology() {
        let interface = ApplicationError::ConfigurationNotFound("no business for +1555".to_owned())
            .into_interface("req-4");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert!(!interface.user_message().contains("+1555"));
    }
}
