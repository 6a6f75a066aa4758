//! Interactive session: bring the link up, find a device, then drive mode
//! changes from console commands.

use std::io::{BufRead, Write};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::discovery::DiscoveryFilter;
use crate::errors::SessionError;
use crate::link::{Handle, LidarMode, SensorLink};
use crate::mode::{ModeController, DEFAULT_COMMAND_TIMEOUT};
use crate::registry::{ConnectionState, DeviceRecord, Registry};
use crate::state_machine::{ConnectionStateMachine, LinkEvent};

const PROMPT: &str = "Please input target mode:\n \
                      N or n : NormalWorking\n \
                      P or p : PowerSaving\n \
                      S or s : Standby\n \
                      Q or q : Quit";

/// Timings and targets for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broadcast codes to connect to; empty accepts every sensor.
    pub allow_list: Vec<String>,
    pub discovery_attempts: u32,
    pub discovery_backoff: Duration,
    /// How long to let devices connect before looking for one.
    pub discovery_window: Duration,
    pub session_attempts: u32,
    pub session_pause: Duration,
    pub command_timeout: Duration,
    /// Apply this mode once instead of prompting.
    pub target_mode: Option<LidarMode>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            allow_list: Vec::new(),
            discovery_attempts: 3,
            discovery_backoff: Duration::from_secs(5),
            discovery_window: Duration::from_secs(5),
            session_attempts: 5,
            session_pause: Duration::from_secs(2),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            target_mode: None,
        }
    }
}

/// A single console command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Mode(LidarMode),
    Quit,
}

impl Command {
    /// Parse the first non-blank character of `line`, case-insensitively.
    pub fn parse(line: &str) -> Option<Command> {
        match line.trim_start().chars().next()?.to_ascii_uppercase() {
            'N' => Some(Command::Mode(LidarMode::Normal)),
            'P' => Some(Command::Mode(LidarMode::PowerSaving)),
            'S' => Some(Command::Mode(LidarMode::Standby)),
            'Q' => Some(Command::Quit),
            _ => None,
        }
    }
}

/// Summary of a session that reached a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub handle: Handle,
    /// Mode changes the device confirmed.
    pub mode_changes: u32,
}

/// Stops sampling devices and releases the link when the attempt ends.
struct LinkGuard {
    link: Arc<dyn SensorLink>,
    registry: Arc<Registry>,
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        for record in self.registry.snapshot() {
            if record.state != ConnectionState::Sampling {
                continue;
            }
            let result = self.link.stop_sampling(
                record.handle,
                Box::new(|ack| {
                    debug!(
                        "stop sampling ack: status={}, handle={}, response={}",
                        ack.status, ack.handle, ack.response
                    )
                }),
            );
            if let Err(e) = result {
                warn!("handle {}: stop sampling failed: {}", record.handle, e);
            }
        }
        self.link.teardown();
        info!("lidar link released");
    }
}

/// Stops the state-machine worker and waits for it.
struct Worker {
    events: Sender<LinkEvent>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.events.send(LinkEvent::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("event worker panicked");
            }
        }
    }
}

pub struct Session {
    link: Arc<dyn SensorLink>,
    registry: Arc<Registry>,
    config: SessionConfig,
}

impl Session {
    pub fn new(link: Arc<dyn SensorLink>, config: SessionConfig) -> Self {
        Self {
            link,
            registry: Arc::new(Registry::new()),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run session attempts until one reaches a device, retrying with a
    /// pause while no device is found.
    pub fn run<R: BufRead, W: Write>(
        &self,
        input: &mut R,
        output: &mut W,
    ) -> Result<SessionReport, SessionError> {
        let attempts = self.config.session_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.run_once(input, output) {
                Err(e) if e.no_device() && attempt < attempts => {
                    info!("session attempt {} of {} ended: {}", attempt, attempts, e);
                    thread::sleep(self.config.session_pause);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// One full attempt: init, discover, pick a device, serve commands.
    pub fn run_once<R: BufRead, W: Write>(
        &self,
        input: &mut R,
        output: &mut W,
    ) -> Result<SessionReport, SessionError> {
        info!("lidar link initializing");
        self.link.init().map_err(SessionError::LinkInit)?;
        let _link = LinkGuard {
            link: Arc::clone(&self.link),
            registry: Arc::clone(&self.registry),
        };
        info!("lidar link version {}", self.link.sdk_version());

        self.registry.reset();
        let (tx, rx) = mpsc::channel();
        let machine = ConnectionStateMachine::new(
            Arc::clone(&self.link),
            Arc::clone(&self.registry),
            DiscoveryFilter::new(self.config.allow_list.iter().cloned()),
            tx.clone(),
        );
        machine.install_callbacks();
        let _worker = Worker {
            events: tx,
            thread: Some(machine.spawn(rx)?),
        };

        match self.start_discovery(output) {
            Err(SessionError::DiscoveryTimeout(attempts)) => {
                warn!("discovery did not start after {} attempts", attempts);
                return Err(SessionError::NoDeviceFound);
            }
            result => result?,
        }
        info!("discovering devices for {:?}", self.config.discovery_window);
        thread::sleep(self.config.discovery_window);

        let Some(device) = self.registry.first_active() else {
            writeln!(output, "No lidar connected found.")?;
            return Err(SessionError::NoDeviceFound);
        };
        print_device(output, &device)?;

        let controller = ModeController::new(Arc::clone(&self.link), Arc::clone(&self.registry))
            .with_timeout(self.config.command_timeout);
        let mut report = SessionReport {
            handle: device.handle,
            mode_changes: 0,
        };

        if let Some(target) = self.config.target_mode {
            if apply_mode(&controller, device.handle, target, output)? {
                report.mode_changes += 1;
            }
            return Ok(report);
        }

        writeln!(output, "{PROMPT}")?;
        output.flush()?;
        let mut line = String::new();
        loop {
            line.clear();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            match Command::parse(&line) {
                Some(Command::Quit) => break,
                Some(Command::Mode(target)) => {
                    if apply_mode(&controller, device.handle, target, output)? {
                        report.mode_changes += 1;
                    }
                }
                None => {
                    writeln!(output, "Error command, please try again")?;
                    writeln!(output, "{PROMPT}")?;
                }
            }
            output.flush()?;
        }

        Ok(report)
    }

    fn start_discovery<W: Write>(&self, output: &mut W) -> Result<(), SessionError> {
        let attempts = self.config.discovery_attempts.max(1);
        for attempt in 1..=attempts {
            match self.link.start_discovery() {
                Ok(()) => {
                    info!("discovery started");
                    return Ok(());
                }
                Err(e) => {
                    debug!("start_discovery: {}", e);
                    writeln!(output, "Start error, try again, {attempt} of {attempts}.")?;
                    thread::sleep(self.config.discovery_backoff);
                }
            }
        }
        writeln!(output, "No lidar connected found.")?;
        Err(SessionError::DiscoveryTimeout(attempts))
    }
}

fn print_device<W: Write>(output: &mut W, device: &DeviceRecord) -> std::io::Result<()> {
    let ip = device
        .ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    writeln!(output, "******** Lidar device {}.", device.handle)?;
    writeln!(output, "*** handle: {}", device.handle)?;
    writeln!(output, "*** broadcast_code: [{}]", device.broadcast_code)?;
    writeln!(output, "*** ip: [{}]", ip)
}

/// Returns whether the device confirmed the change.
fn apply_mode<W: Write>(
    controller: &ModeController,
    handle: Handle,
    target: LidarMode,
    output: &mut W,
) -> std::io::Result<bool> {
    writeln!(output, "Target mode: {target}")?;
    match controller.set_mode(handle, target) {
        Ok(outcome) => {
            match outcome.confirmed {
                Some(mode) => writeln!(output, "Current lidar mode: {mode}.")?,
                None => writeln!(output, "Current lidar mode: unknown.")?,
            }
            Ok(true)
        }
        Err(e) => {
            warn!("handle {}: mode change to {} failed: {}", handle, target, e);
            writeln!(output, "Mode change failed: {e}")?;
            Ok(false)
        }
    }
}
