pub mod clock;
pub mod events;
pub mod identity;
pub mod lifecycle;
pub mod location;
pub mod models;
pub mod payment;
pub mod repository;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("{entity} cannot take '{event}' while {from}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        event: String,
    },
}

pub type CoreResult<T> = Result<T, CoreError>;
