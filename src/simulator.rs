//! In-process Sensor Link backed by simulated devices.
//!
//! Each added device runs as a task on a tokio runtime owned by the link, so
//! every callback fires from one of the runtime's worker threads, just as a
//! vendor SDK would call back from its own threads.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use log::{debug, info};
use serde::Deserialize;
use tokio::runtime::{Builder, Handle as RuntimeHandle, Runtime};
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::errors::{LinkError, Result};
use crate::link::{
    BroadcastCallback, BroadcastInfo, CommandAck, CommandCallback, CommandStatus, DataType,
    DeviceEvent, DeviceInfo, DeviceType, ErrorCallback, ErrorReport, FirmwareInfo, Handle,
    InfoCallback, LidarMode, SdkVersion, SensorLink, StateCallback, TelemetryCallback,
    TelemetryPacket, WorkingState, MAX_DEVICES,
};

const SDK_VERSION: SdkVersion = SdkVersion {
    major: 2,
    minor: 3,
    patch: 0,
};

const FIRMWARE: FirmwareInfo = FirmwareInfo {
    version: [3, 7, 2, 0],
};

/// Pause between discovery broadcasts of a device that was not added yet.
const BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

/// One status report is pushed every this many telemetry packets.
const PACKETS_PER_STATUS_REPORT: u64 = 10;

const POINTS_PER_PACKET: u32 = 100;

/// A simulated sensor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimDevice {
    pub broadcast_code: String,
    pub device_type: DeviceType,
    pub ip: Ipv4Addr,
    /// Progress reports sent while booting.
    pub init_steps: u32,
    pub init_step_ms: u64,
    /// Delay between being added and the `Connect` event.
    pub connect_delay_ms: u64,
    /// Time the device takes to acknowledge a mode change.
    pub mode_latency_ms: u64,
    pub packet_interval_ms: u64,
    pub data_type: DataType,
    /// Raw health word pushed with status reports.
    pub status_word: u32,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self {
            broadcast_code: "0TFDFG700601881".to_string(),
            device_type: DeviceType::Mid40,
            ip: Ipv4Addr::new(192, 168, 1, 101),
            init_steps: 3,
            init_step_ms: 200,
            connect_delay_ms: 100,
            mode_latency_ms: 150,
            packet_interval_ms: 10,
            data_type: DataType::ExtendCartesian,
            status_word: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Number of initial `start_discovery` calls that fail.
    pub discovery_failures: u32,
    /// Devices on the simulated network; one default device when empty.
    pub devices: Vec<SimDevice>,
}

enum DeviceCommand {
    StartSampling(CommandCallback),
    StopSampling(CommandCallback),
    SetMode(LidarMode, CommandCallback),
    QueryInfo(InfoCallback),
}

#[derive(Default)]
struct Callbacks {
    broadcast: Option<Arc<dyn Fn(&BroadcastInfo) + Send + Sync>>,
    state: Option<Arc<dyn Fn(&DeviceInfo, DeviceEvent) + Send + Sync>>,
    telemetry: HashMap<Handle, Arc<dyn Fn(Handle, &TelemetryPacket) + Send + Sync>>,
    error: HashMap<Handle, Arc<dyn Fn(Handle, &ErrorReport) + Send + Sync>>,
}

/// State reachable from both the link methods and the device tasks.
#[derive(Default)]
struct Shared {
    callbacks: Mutex<Callbacks>,
    /// Command queues of added devices, by handle.
    devices: Mutex<HashMap<Handle, UnboundedSender<DeviceCommand>>>,
    modes: Mutex<HashMap<Handle, LidarMode>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn is_added(&self, handle: Handle) -> bool {
        lock(&self.devices).contains_key(&handle)
    }

    fn broadcast(&self, info: &BroadcastInfo) {
        let callback = lock(&self.callbacks).broadcast.clone();
        if let Some(callback) = callback {
            (*callback)(info);
        }
    }

    fn device_event(&self, info: &DeviceInfo, event: DeviceEvent) {
        let callback = lock(&self.callbacks).state.clone();
        if let Some(callback) = callback {
            (*callback)(info, event);
        }
    }

    fn telemetry(&self, handle: Handle, packet: &TelemetryPacket) {
        let callback = lock(&self.callbacks).telemetry.get(&handle).cloned();
        if let Some(callback) = callback {
            (*callback)(handle, packet);
        }
    }

    fn status_report(&self, handle: Handle, report: &ErrorReport) {
        let callback = lock(&self.callbacks).error.get(&handle).cloned();
        if let Some(callback) = callback {
            (*callback)(handle, report);
        }
    }
}

/// [`SensorLink`] implementation that simulates devices in-process.
pub struct SimulatedLink {
    devices: Vec<SimDevice>,
    discovery_failures: AtomicU32,
    runtime: Mutex<Option<Runtime>>,
    shared: Arc<Shared>,
}

impl SimulatedLink {
    pub fn new(config: SimulatorConfig) -> Self {
        let devices = if config.devices.is_empty() {
            vec![SimDevice::default()]
        } else {
            config.devices
        };
        Self {
            devices,
            discovery_failures: AtomicU32::new(config.discovery_failures),
            runtime: Mutex::new(None),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn devices(&self) -> &[SimDevice] {
        &self.devices
    }

    fn runtime_handle(&self) -> Result<RuntimeHandle> {
        lock(&self.runtime)
            .as_ref()
            .map(|rt| rt.handle().clone())
            .ok_or(LinkError::NotInitialized)
    }

    fn send(&self, handle: Handle, command: DeviceCommand) -> Result<()> {
        let devices = lock(&self.shared.devices);
        let queue = devices.get(&handle).ok_or(LinkError::InvalidHandle(handle))?;
        queue
            .unbounded_send(command)
            .map_err(|e| LinkError::Send(format!("device {handle} is gone: {e}")))
    }
}

impl SensorLink for SimulatedLink {
    fn init(&self) -> Result<()> {
        let mut runtime = lock(&self.runtime);
        if runtime.is_some() {
            return Ok(());
        }
        let rt = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("lidar-sim")
            .enable_time()
            .build()
            .map_err(|e| LinkError::Init(format!("tokio runtime init failed: {e}")))?;
        *runtime = Some(rt);
        info!("simulated link up with {} device(s)", self.devices.len());
        Ok(())
    }

    fn teardown(&self) {
        if let Some(rt) = lock(&self.runtime).take() {
            rt.shutdown_background();
        }
        *lock(&self.shared.callbacks) = Callbacks::default();
        lock(&self.shared.devices).clear();
        lock(&self.shared.modes).clear();
        debug!("simulated link torn down");
    }

    fn sdk_version(&self) -> SdkVersion {
        SDK_VERSION
    }

    fn start_discovery(&self) -> Result<()> {
        let runtime = self.runtime_handle()?;
        let injected = self
            .discovery_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(LinkError::Discovery("simulated start failure".into()));
        }

        for (index, device) in self.devices.iter().enumerate().take(MAX_DEVICES) {
            let handle = index as Handle;
            let shared = Arc::clone(&self.shared);
            let info = BroadcastInfo {
                broadcast_code: device.broadcast_code.clone(),
                device_type: device.device_type,
                ip: device.ip,
            };
            runtime.spawn(async move {
                while !shared.is_added(handle) {
                    shared.broadcast(&info);
                    sleep(BROADCAST_INTERVAL).await;
                }
            });
        }
        Ok(())
    }

    fn set_broadcast_callback(&self, callback: BroadcastCallback) {
        lock(&self.shared.callbacks).broadcast = Some(Arc::from(callback));
    }

    fn set_state_callback(&self, callback: StateCallback) {
        lock(&self.shared.callbacks).state = Some(Arc::from(callback));
    }

    fn add_device(&self, broadcast_code: &str) -> Result<Handle> {
        let runtime = self.runtime_handle()?;
        let index = self
            .devices
            .iter()
            .position(|d| d.broadcast_code == broadcast_code)
            .ok_or_else(|| LinkError::UnknownDevice(broadcast_code.to_string()))?;
        if index >= MAX_DEVICES {
            return Err(LinkError::TableFull);
        }
        let handle = index as Handle;

        let (tx, rx) = unbounded();
        {
            let mut devices = lock(&self.shared.devices);
            if devices.contains_key(&handle) {
                return Ok(handle);
            }
            devices.insert(handle, tx);
        }
        lock(&self.shared.modes).insert(handle, LidarMode::Normal);

        let device = self.devices[index].clone();
        runtime.spawn(run_device(handle, device, Arc::clone(&self.shared), rx));
        debug!("simulated device {} added as handle {}", broadcast_code, handle);
        Ok(handle)
    }

    fn set_telemetry_callback(&self, handle: Handle, callback: TelemetryCallback) {
        lock(&self.shared.callbacks)
            .telemetry
            .insert(handle, Arc::from(callback));
    }

    fn set_error_callback(&self, handle: Handle, callback: ErrorCallback) {
        lock(&self.shared.callbacks)
            .error
            .insert(handle, Arc::from(callback));
    }

    fn query_device_info(&self, handle: Handle, callback: InfoCallback) -> Result<()> {
        self.send(handle, DeviceCommand::QueryInfo(callback))
    }

    fn start_sampling(&self, handle: Handle, callback: CommandCallback) -> Result<()> {
        self.send(handle, DeviceCommand::StartSampling(callback))
    }

    fn stop_sampling(&self, handle: Handle, callback: CommandCallback) -> Result<()> {
        self.send(handle, DeviceCommand::StopSampling(callback))
    }

    fn set_mode(&self, handle: Handle, mode: LidarMode, callback: CommandCallback) -> Result<()> {
        self.send(handle, DeviceCommand::SetMode(mode, callback))
    }

    fn get_mode(&self, handle: Handle) -> Option<LidarMode> {
        lock(&self.shared.modes).get(&handle).copied()
    }
}

/// Device task: connect, boot, then serve commands and stream while sampling.
async fn run_device(
    handle: Handle,
    device: SimDevice,
    shared: Arc<Shared>,
    mut commands: UnboundedReceiver<DeviceCommand>,
) {
    let mut info = DeviceInfo {
        handle,
        broadcast_code: device.broadcast_code.clone(),
        device_type: device.device_type,
        ip: device.ip,
        state: WorkingState::Init,
        feature: 0,
        status: 0,
    };

    sleep(Duration::from_millis(device.connect_delay_ms)).await;
    shared.device_event(&info, DeviceEvent::Connect);

    let steps = device.init_steps;
    for step in 1..=steps {
        sleep(Duration::from_millis(device.init_step_ms)).await;
        info.status = step * 100 / steps;
        shared.device_event(&info, DeviceEvent::StateChange);
    }
    info.state = WorkingState::Normal;
    info.status = device.status_word;
    shared.device_event(&info, DeviceEvent::StateChange);

    let mut ticker = interval(Duration::from_millis(device.packet_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sampling = false;
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            command = commands.next() => {
                let Some(command) = command else { break };
                match command {
                    DeviceCommand::QueryInfo(callback) => {
                        callback(CommandStatus::Success, handle, Some(FIRMWARE));
                    }
                    DeviceCommand::StartSampling(callback) => {
                        let accepted = info.state != WorkingState::Init;
                        sampling |= accepted;
                        let response = u8::from(!accepted);
                        callback(CommandAck::new(CommandStatus::Success, handle, response));
                    }
                    DeviceCommand::StopSampling(callback) => {
                        sampling = false;
                        callback(CommandAck::new(CommandStatus::Success, handle, 0));
                    }
                    DeviceCommand::SetMode(mode, callback) => {
                        sleep(Duration::from_millis(device.mode_latency_ms)).await;
                        lock(&shared.modes).insert(handle, mode);
                        info.state = mode.into();
                        callback(CommandAck::new(CommandStatus::Success, handle, 0));
                        shared.device_event(&info, DeviceEvent::StateChange);
                    }
                }
            }
            _ = ticker.tick(), if sampling && info.state != WorkingState::Standby => {
                sent += 1;
                let packet = TelemetryPacket {
                    data_type: device.data_type,
                    timestamp: sent * device.packet_interval_ms * 1_000_000,
                    point_count: POINTS_PER_PACKET,
                };
                shared.telemetry(handle, &packet);
                if sent % PACKETS_PER_STATUS_REPORT == 0 {
                    shared.status_report(handle, &ErrorReport(device.status_word));
                }
            }
        }
    }
    debug!("simulated device {} stopped", device.broadcast_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn quick_device(code: &str) -> SimDevice {
        SimDevice {
            broadcast_code: code.to_string(),
            init_steps: 1,
            init_step_ms: 5,
            connect_delay_ms: 5,
            mode_latency_ms: 5,
            packet_interval_ms: 2,
            ..Default::default()
        }
    }

    #[test]
    fn commands_require_init() {
        let link = SimulatedLink::new(SimulatorConfig::default());
        assert!(matches!(link.start_discovery(), Err(LinkError::NotInitialized)));
        assert!(matches!(link.add_device("x"), Err(LinkError::NotInitialized)));
    }

    #[test]
    fn injected_discovery_failures_run_out() {
        let link = SimulatedLink::new(SimulatorConfig {
            discovery_failures: 2,
            devices: vec![quick_device("LIDAR01")],
        });
        link.init().unwrap();
        assert!(link.start_discovery().is_err());
        assert!(link.start_discovery().is_err());
        assert!(link.start_discovery().is_ok());
        link.teardown();
    }

    #[test]
    fn added_device_connects_and_answers_mode_changes() {
        let link = SimulatedLink::new(SimulatorConfig {
            discovery_failures: 0,
            devices: vec![quick_device("LIDAR01"), quick_device("LIDAR02")],
        });
        link.init().unwrap();

        let (tx, rx) = mpsc::channel();
        link.set_state_callback(Box::new(move |info, event| {
            let _ = tx.send((info.handle, info.state, event));
        }));
        assert_eq!(link.add_device("LIDAR02").unwrap(), 1);
        assert_eq!(link.add_device("LIDAR02").unwrap(), 1);
        assert!(matches!(link.add_device("NOPE"), Err(LinkError::UnknownDevice(_))));

        let timeout = Duration::from_secs(2);
        assert_eq!(
            rx.recv_timeout(timeout).unwrap(),
            (1, WorkingState::Init, DeviceEvent::Connect)
        );
        let ready = loop {
            let (_, state, _) = rx.recv_timeout(timeout).unwrap();
            if state == WorkingState::Normal {
                break state;
            }
        };
        assert_eq!(ready, WorkingState::Normal);

        let (ack_tx, ack_rx) = mpsc::channel();
        link.set_mode(
            1,
            LidarMode::PowerSaving,
            Box::new(move |ack| {
                let _ = ack_tx.send(ack);
            }),
        )
        .unwrap();
        let ack = ack_rx.recv_timeout(timeout).unwrap();
        assert!(ack.is_accepted());
        assert_eq!(link.get_mode(1), Some(LidarMode::PowerSaving));
        assert_eq!(link.get_mode(0), None);
        assert!(matches!(
            link.set_mode(0, LidarMode::Normal, Box::new(|_| {})),
            Err(LinkError::InvalidHandle(0))
        ));

        link.teardown();
        assert_eq!(link.get_mode(1), None);
    }

    #[test]
    fn empty_device_list_gets_a_default_device() {
        let link = SimulatedLink::new(SimulatorConfig::default());
        assert_eq!(link.devices().len(), 1);
        assert_eq!(link.devices()[0].broadcast_code, "0TFDFG700601881");
    }
}
