use std::io;
use thiserror::Error;

use crate::link::{CommandStatus, Handle};

/// Failures reported synchronously by a [`crate::link::SensorLink`].
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("link initialization failed: {0}")]
    Init(String),
    #[error("link is not initialized")]
    NotInitialized,
    #[error("discovery could not be started: {0}")]
    Discovery(String),
    #[error("invalid handle: {0}")]
    InvalidHandle(Handle),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("device table full")]
    TableFull,
    #[error("command could not be sent: {0}")]
    Send(String),
}

/// Failures of a mode-change request.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid handle: {0}")]
    InvalidHandle(Handle),
    #[error("device {0} is not connected")]
    NotConnected(Handle),
    #[error("command timed out: {0}")]
    CommandTimeout(String),
    #[error("command failed: status={status}, response={response}")]
    CommandFailure { status: CommandStatus, response: u8 },
    #[error("link error: {0}")]
    Link(#[from] LinkError),
}

/// Ways a single session attempt can end early.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("link initialization failed: {0}")]
    LinkInit(#[source] LinkError),
    /// Discovery never started. A session attempt reports this to its
    /// caller as [`SessionError::NoDeviceFound`].
    #[error("discovery did not start after {0} attempts")]
    DiscoveryTimeout(u32),
    #[error("no lidar connected found")]
    NoDeviceFound,
    #[error("console io error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Whether the outer loop should start another session attempt.
    pub fn no_device(&self) -> bool {
        matches!(
            self,
            SessionError::DiscoveryTimeout(_) | SessionError::NoDeviceFound
        )
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
