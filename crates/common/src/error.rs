//! Common error types

use protocol::Status;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    Parameter(String),

    #[error("Invalid device state: {0}")]
    InvalidState(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Device removal in progress")]
    Draining,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Lower device failed the request: {0}")]
    Lower(Status),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Completion status a request fails with when this error aborts it
    pub fn status(&self) -> Status {
        match self {
            Error::Parameter(_) => Status::InvalidParameter,
            Error::InvalidState(_) => Status::InvalidDeviceState,
            Error::Resource(_) => Status::InsufficientResources,
            Error::Draining => Status::DeletePending,
            Error::Timeout(_) => Status::Timeout,
            Error::Lower(status) => *status,
            Error::Channel(_) | Error::Config(_) | Error::Io(_) => Status::Unsuccessful,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
