use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypesError {
    #[error("Unknown status value: {0}")]
    UnknownStatus(String),

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, TypesError>;
