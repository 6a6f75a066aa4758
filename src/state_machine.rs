//! Connection lifecycle driven by Sensor Link events.
//!
//! Link callbacks fire on the link's own threads. They only forward a
//! [`LinkEvent`] into a channel; a single worker thread owns every state
//! transition by draining that channel through [`ConnectionStateMachine::handle`].
//!
//! ```text
//! Disconnected ──Connect──► Connected ──start ack ok──► Sampling
//!      ▲                        │ ▲                         │
//!      └──────Disconnect────────┘ └── start ack failed      │
//!      └────────────────────────Disconnect──────────────────┘
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::discovery::DiscoveryFilter;
use crate::link::{
    BroadcastInfo, CommandAck, CommandStatus, DeviceEvent, DeviceInfo, Handle, SensorLink,
    TelemetryCallback, WorkingState, MAX_DEVICES,
};
use crate::registry::{ConnectionState, Registry};

/// Log every Nth telemetry packet per handle.
const PACKET_LOG_INTERVAL: u64 = 100;

/// Log every Nth device status report.
const ERROR_LOG_INTERVAL: u64 = 100;

/// Picks every `interval`-th occurrence of a counted event for logging.
struct LogThrottle {
    interval: u64,
    logged: AtomicU64,
}

impl LogThrottle {
    fn new(interval: u64) -> Self {
        Self {
            interval,
            logged: AtomicU64::new(0),
        }
    }

    /// Whether the `count`-th occurrence should be logged.
    fn due(&self, count: u64) -> bool {
        let due = count > 0 && count % self.interval == 0;
        if due {
            self.logged.fetch_add(1, Ordering::Relaxed);
        }
        due
    }

    #[cfg(test)]
    fn logged(&self) -> u64 {
        self.logged.load(Ordering::Relaxed)
    }
}

/// Work item for the state-machine worker.
#[derive(Debug)]
pub enum LinkEvent {
    Broadcast(BroadcastInfo),
    Device {
        info: DeviceInfo,
        event: DeviceEvent,
    },
    SamplingAck {
        handle: Handle,
        generation: u32,
        ack: CommandAck,
    },
    Shutdown,
}

pub struct ConnectionStateMachine {
    link: Arc<dyn SensorLink>,
    registry: Arc<Registry>,
    filter: DiscoveryFilter,
    events: Sender<LinkEvent>,
    status_reports: Arc<AtomicU64>,
    packet_log: Arc<LogThrottle>,
    report_log: Arc<LogThrottle>,
}

impl ConnectionStateMachine {
    pub fn new(
        link: Arc<dyn SensorLink>,
        registry: Arc<Registry>,
        filter: DiscoveryFilter,
        events: Sender<LinkEvent>,
    ) -> Self {
        Self {
            link,
            registry,
            filter,
            events,
            status_reports: Arc::new(AtomicU64::new(0)),
            packet_log: Arc::new(LogThrottle::new(PACKET_LOG_INTERVAL)),
            report_log: Arc::new(LogThrottle::new(ERROR_LOG_INTERVAL)),
        }
    }

    /// Route broadcast and device-state callbacks into the event channel.
    pub fn install_callbacks(&self) {
        let events = self.events.clone();
        self.link.set_broadcast_callback(Box::new(move |info| {
            let _ = events.send(LinkEvent::Broadcast(info.clone()));
        }));

        let events = self.events.clone();
        self.link.set_state_callback(Box::new(move |info, event| {
            let _ = events.send(LinkEvent::Device {
                info: info.clone(),
                event,
            });
        }));
    }

    /// Run the machine on a dedicated thread until [`LinkEvent::Shutdown`].
    pub fn spawn(self, events: Receiver<LinkEvent>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("lidar-events".into())
            .spawn(move || self.run(events))
    }

    pub fn run(&self, events: Receiver<LinkEvent>) {
        for event in events {
            if !self.handle(event) {
                break;
            }
        }
        debug!("event worker stopped");
    }

    /// Apply one event. Returns `false` once the worker should stop.
    pub fn handle(&self, event: LinkEvent) -> bool {
        match event {
            LinkEvent::Broadcast(info) => self.on_broadcast(&info),
            LinkEvent::Device { info, event } => self.on_device_event(&info, event),
            LinkEvent::SamplingAck {
                handle,
                generation,
                ack,
            } => self.on_sampling_ack(handle, generation, ack),
            LinkEvent::Shutdown => return false,
        }
        true
    }

    fn on_broadcast(&self, info: &BroadcastInfo) {
        if !self
            .filter
            .should_register(&info.broadcast_code, info.device_type)
        {
            return;
        }
        info!("receive broadcast code {}", info.broadcast_code);

        let handle = match self.link.add_device(&info.broadcast_code) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("add device failed: code={}, error={}", info.broadcast_code, e);
                return;
            }
        };
        if !self.registry.register(handle, &info.broadcast_code) {
            warn!(
                "link assigned out-of-range handle {} to {}, ignoring",
                handle, info.broadcast_code
            );
            return;
        }

        self.link
            .set_telemetry_callback(handle, self.telemetry_callback());
        self.query_info(handle);
        debug!("device {} registered as handle {}", info.broadcast_code, handle);
    }

    fn on_device_event(&self, info: &DeviceInfo, event: DeviceEvent) {
        let handle = info.handle;
        if handle as usize >= MAX_DEVICES {
            warn!(
                "dropping {} event for invalid handle {} (sn {})",
                event, handle, info.broadcast_code
            );
            return;
        }

        match event {
            DeviceEvent::Connect => {
                self.query_info(handle);
                let connected = self
                    .registry
                    .update(handle, |record| {
                        if record.state != ConnectionState::Disconnected {
                            return false;
                        }
                        record.state = ConnectionState::Connected;
                        record.generation = record.generation.wrapping_add(1);
                        record.start_pending = false;
                        record.broadcast_code = info.broadcast_code.clone();
                        record.info = Some(info.clone());
                        true
                    })
                    .unwrap_or(false);
                if connected {
                    self.install_error_callback(handle);
                }
                info!("lidar sn [{}] connect", info.broadcast_code);
            }
            DeviceEvent::Disconnect => {
                self.registry.update(handle, |record| {
                    record.state = ConnectionState::Disconnected;
                    record.start_pending = false;
                });
                warn!("lidar sn [{}] disconnect", info.broadcast_code);
                return;
            }
            DeviceEvent::StateChange => {
                self.registry.update(handle, |record| {
                    record.info = Some(info.clone());
                });
                info!("lidar sn [{}] state change: {}", info.broadcast_code, info.state);
            }
        }

        self.evaluate(handle);
    }

    /// Start sampling once a connected device reports `Normal`.
    fn evaluate(&self, handle: Handle) {
        let generation = self
            .registry
            .update(handle, |record| {
                if record.state != ConnectionState::Connected {
                    return None;
                }
                let info = record.info.as_ref()?;
                debug!(
                    "handle {}: working state {}, feature {:#x}",
                    handle, info.state, info.feature
                );
                match info.state {
                    WorkingState::Init => {
                        info!("handle {}: state change progress {}", handle, info.status);
                        None
                    }
                    WorkingState::Normal if !record.start_pending => {
                        record.start_pending = true;
                        Some(record.generation)
                    }
                    WorkingState::Normal => None,
                    other => {
                        warn!(
                            "handle {}: working state {}, status code 0x{:08x}",
                            handle, other, info.status
                        );
                        None
                    }
                }
            })
            .flatten();

        if let Some(generation) = generation {
            self.start_sampling(handle, generation);
        }
    }

    fn start_sampling(&self, handle: Handle, generation: u32) {
        let events = self.events.clone();
        let result = self.link.start_sampling(
            handle,
            Box::new(move |ack| {
                let _ = events.send(LinkEvent::SamplingAck {
                    handle,
                    generation,
                    ack,
                });
            }),
        );

        match result {
            Ok(()) => debug!("handle {}: start sampling requested", handle),
            Err(e) => {
                warn!("handle {}: start sampling could not be sent: {}", handle, e);
                self.registry.update(handle, |record| {
                    if record.generation == generation {
                        record.start_pending = false;
                    }
                });
            }
        }
    }

    fn on_sampling_ack(&self, handle: Handle, generation: u32, ack: CommandAck) {
        debug!(
            "start sampling ack: status={}, handle={}, response={}",
            ack.status, handle, ack.response
        );
        self.registry.update(handle, |record| {
            if record.generation != generation || !record.start_pending {
                debug!("handle {}: ignoring stale start sampling ack", handle);
                return;
            }
            record.start_pending = false;
            if record.state != ConnectionState::Connected {
                return;
            }
            if ack.is_accepted() {
                record.state = ConnectionState::Sampling;
                info!("handle {}: sampling", handle);
            } else {
                warn!(
                    "handle {}: start sampling failed (status={}, response={}), \
                     retrying on next state change",
                    handle, ack.status, ack.response
                );
            }
        });
    }

    fn query_info(&self, handle: Handle) {
        let result = self.link.query_device_info(
            handle,
            Box::new(|status, handle, firmware| match (status, firmware) {
                (CommandStatus::Success, Some(firmware)) => {
                    info!("handle {}: firmware version {}", handle, firmware)
                }
                (status, _) => {
                    warn!("handle {}: device information query failed: {}", handle, status)
                }
            }),
        );
        if let Err(e) = result {
            warn!("handle {}: device information query not sent: {}", handle, e);
        }
    }

    fn telemetry_callback(&self) -> TelemetryCallback {
        let registry = Arc::clone(&self.registry);
        let throttle = Arc::clone(&self.packet_log);
        Box::new(move |handle, packet| {
            let Some(count) = registry.record_packet(handle) else {
                return;
            };
            if throttle.due(count) {
                debug!(
                    "handle {}: {} packets received, latest {:?} at {} ns with {} points",
                    handle, count, packet.data_type, packet.timestamp, packet.point_count
                );
            }
        })
    }

    fn install_error_callback(&self, handle: Handle) {
        let reports = Arc::clone(&self.status_reports);
        let throttle = Arc::clone(&self.report_log);
        self.link.set_error_callback(
            handle,
            Box::new(move |handle, report| {
                let n = reports.fetch_add(1, Ordering::Relaxed) + 1;
                if throttle.due(n) {
                    info!("handle {}: status report #{}: {}", handle, n, report);
                }
            }),
        );
    }
}
