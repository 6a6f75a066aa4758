//! Mode changes as a blocking request/response on top of the link's
//! asynchronous `set_mode`.
//!
//! The confirmed mode is only read back after the acknowledgement has
//! arrived, so the follow-up `get_mode` can never observe the pre-change
//! mode of a command that is still in flight.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::errors::ControlError;
use crate::link::{CommandAck, CommandStatus, Handle, LidarMode, SensorLink};
use crate::registry::Registry;

/// Default bound on waiting for a mode-change acknowledgement.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// A mode change addressed to one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRequest {
    pub handle: Handle,
    pub target: LidarMode,
}

/// A submitted mode change whose acknowledgement has not been consumed yet.
pub struct PendingMode {
    request: ModeRequest,
    ack: Receiver<CommandAck>,
}

impl PendingMode {
    pub fn request(&self) -> ModeRequest {
        self.request
    }

    /// Block until the acknowledgement arrives or `timeout` expires.
    pub fn wait(&self, timeout: Duration) -> Result<CommandAck, ControlError> {
        let ModeRequest { handle, target } = self.request;
        match self.ack.recv_timeout(timeout) {
            Ok(ack) => Ok(ack),
            Err(RecvTimeoutError::Timeout) => Err(ControlError::CommandTimeout(format!(
                "no response to set_mode({handle}, {target}) within {timeout:?}"
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(ControlError::CommandTimeout(format!(
                "link dropped set_mode({handle}, {target}) without responding"
            ))),
        }
    }
}

/// Result of a completed mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeOutcome {
    pub ack: CommandAck,
    /// Mode read back from the link after the acknowledgement.
    pub confirmed: Option<LidarMode>,
}

pub struct ModeController {
    link: Arc<dyn SensorLink>,
    registry: Arc<Registry>,
    timeout: Duration,
}

impl ModeController {
    pub fn new(link: Arc<dyn SensorLink>, registry: Arc<Registry>) -> Self {
        Self {
            link,
            registry,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send the mode-change command without waiting for its answer.
    ///
    /// The target device must be `Connected` or `Sampling`.
    pub fn submit(&self, request: ModeRequest) -> Result<PendingMode, ControlError> {
        let record = self
            .registry
            .get(request.handle)
            .ok_or(ControlError::InvalidHandle(request.handle))?;
        if !record.is_active() {
            return Err(ControlError::NotConnected(request.handle));
        }

        let (tx, rx) = mpsc::channel();
        self.link.set_mode(
            request.handle,
            request.target,
            Box::new(move |ack| {
                let _ = tx.send(ack);
            }),
        )?;
        debug!(
            "set_mode({}, {}) sent to {}",
            request.handle, request.target, record.broadcast_code
        );

        Ok(PendingMode { request, ack: rx })
    }

    /// Change the device mode and return the mode it confirms afterwards.
    pub fn set_mode(&self, handle: Handle, target: LidarMode) -> Result<ModeOutcome, ControlError> {
        let pending = self.submit(ModeRequest { handle, target })?;
        let ack = pending.wait(self.timeout)?;
        debug!(
            "set_mode ack: status={}, handle={}, response={}",
            ack.status, ack.handle, ack.response
        );

        if ack.status == CommandStatus::Timeout {
            return Err(ControlError::CommandTimeout(format!(
                "device did not answer set_mode({handle}, {target})"
            )));
        }
        if !ack.is_accepted() {
            return Err(ControlError::CommandFailure {
                status: ack.status,
                response: ack.response,
            });
        }

        let confirmed = self.link.get_mode(handle);
        self.registry.update(handle, |record| record.last_mode = confirmed);
        if let Some(mode) = confirmed {
            info!("handle {}: mode confirmed {}", handle, mode);
        }
        Ok(ModeOutcome { ack, confirmed })
    }
}
