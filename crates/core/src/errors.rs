use thiserror::Error;

use crate::domain::experiment::ExperimentStatus;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("configuration failure: {0}")]
    Configuration(String),
    #[error("invalid experiment transition from {from:?} to {to:?}")]
    InvalidStatusTransition { from: ExperimentStatus, to: ExperimentStatus },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }
}

/// Failures reported by storage adapters. Every variant surfaces to callers as
/// [`ApplicationError::UpstreamUnavailable`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation `{operation}` timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },
    #[error("store returned corrupt data: {0}")]
    Corrupt(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        Self::UpstreamUnavailable(value.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::ServiceUnavailable { .. } => 503,
            Self::Internal { .. } => 500,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested resource was not found.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    /// Maps to the interface layer. Outside development mode the detailed
    /// message is replaced by the generic user message.
    pub fn into_interface(
        self,
        correlation_id: impl Into<String>,
        expose_details: bool,
    ) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        let generic = mapped.user_message().to_owned();
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, message }
            | InterfaceError::NotFound { correlation_id: id, message }
            | InterfaceError::ServiceUnavailable { correlation_id: id, message }
            | InterfaceError::Internal { correlation_id: id, message } => {
                *id = correlation_id;
                if !expose_details {
                    *message = generic;
                }
            }
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(error @ DomainError::Validation(_))
            | ApplicationError::Domain(error @ DomainError::InvalidStatusTransition { .. }) => {
                Self::BadRequest { message: error.to_string(), correlation_id }
            }
            ApplicationError::Domain(error @ DomainError::NotFound { .. }) => {
                Self::NotFound { message: error.to_string(), correlation_id }
            }
            ApplicationError::Domain(error @ DomainError::Configuration(_)) => {
                Self::Internal { message: error.to_string(), correlation_id }
            }
            ApplicationError::UpstreamUnavailable(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
        }
    }
}
