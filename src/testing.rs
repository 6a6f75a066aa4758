//! Scriptable in-memory link used by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::errors::{LinkError, Result};
use crate::link::{
    BroadcastCallback, BroadcastInfo, CommandAck, CommandCallback, CommandStatus, DeviceEvent,
    DeviceInfo, DeviceType, ErrorCallback, ErrorReport, FirmwareInfo, Handle, InfoCallback,
    LidarMode, SdkVersion, SensorLink, StateCallback, TelemetryCallback, TelemetryPacket,
    WorkingState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Init,
    Teardown,
    StartDiscovery,
    AddDevice(String),
    QueryInfo(Handle),
    StartSampling(Handle),
    StopSampling(Handle),
    SetMode(Handle, LidarMode),
    GetMode(Handle),
}

#[derive(Default)]
struct Callbacks {
    broadcast: Option<Arc<dyn Fn(&BroadcastInfo) + Send + Sync>>,
    state: Option<Arc<dyn Fn(&DeviceInfo, DeviceEvent) + Send + Sync>>,
    telemetry: HashMap<Handle, Arc<dyn Fn(Handle, &TelemetryPacket) + Send + Sync>>,
    error: HashMap<Handle, Arc<dyn Fn(Handle, &ErrorReport) + Send + Sync>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Records every call and answers commands according to its script.
///
/// On a successful `start_discovery` each scripted device is announced with a
/// broadcast. Adding a device answers with a `Connect` event for its handle.
pub(crate) struct RecordingLink {
    calls: Mutex<Vec<Call>>,
    init_ok: bool,
    discovery_results: Mutex<VecDeque<bool>>,
    devices: Vec<(BroadcastInfo, DeviceInfo)>,
    callbacks: Mutex<Callbacks>,
    sampling_reply: Option<(CommandStatus, u8)>,
    held_sampling: Mutex<Vec<(Handle, CommandCallback)>>,
    mode_reply: Option<(CommandStatus, u8)>,
    mode_delay: Duration,
    held_modes: Mutex<Vec<CommandCallback>>,
    modes: Arc<Mutex<HashMap<Handle, LidarMode>>>,
}

impl RecordingLink {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            init_ok: true,
            discovery_results: Mutex::new(VecDeque::new()),
            devices: Vec::new(),
            callbacks: Mutex::new(Callbacks::default()),
            sampling_reply: Some((CommandStatus::Success, 0)),
            held_sampling: Mutex::new(Vec::new()),
            mode_reply: Some((CommandStatus::Success, 0)),
            mode_delay: Duration::from_millis(30),
            held_modes: Mutex::new(Vec::new()),
            modes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Script a device; handles are assigned in the order devices are added.
    pub(crate) fn with_device(mut self, code: &str, state: WorkingState) -> Self {
        let handle = self.devices.len() as Handle;
        let ip = Ipv4Addr::new(192, 168, 1, handle.wrapping_add(10));
        let broadcast = BroadcastInfo {
            broadcast_code: code.to_string(),
            device_type: DeviceType::Mid40,
            ip,
        };
        self.devices.push((broadcast, device_info(handle, code, state)));
        self
    }

    /// Results for successive `start_discovery` calls; success once exhausted.
    pub(crate) fn with_discovery_results(self, results: impl IntoIterator<Item = bool>) -> Self {
        lock(&self.discovery_results).extend(results);
        self
    }

    pub(crate) fn failing_init(mut self) -> Self {
        self.init_ok = false;
        self
    }

    /// Keep start-sampling callbacks until [`Self::release_sampling_ack`].
    pub(crate) fn hold_sampling_acks(mut self) -> Self {
        self.sampling_reply = None;
        self
    }

    /// Answer mode changes after `delay`; `None` never answers.
    pub(crate) fn with_mode_reply(
        mut self,
        reply: Option<(CommandStatus, u8)>,
        delay: Duration,
    ) -> Self {
        self.mode_reply = reply;
        self.mode_delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub(crate) fn count(&self, call: &Call) -> usize {
        lock(&self.calls).iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: Call) {
        lock(&self.calls).push(call);
    }

    /// Fire the oldest held start-sampling callback for `handle`.
    pub(crate) fn release_sampling_ack(&self, handle: Handle, status: CommandStatus, response: u8) {
        let callback = {
            let mut held = lock(&self.held_sampling);
            let pos = held.iter().position(|(h, _)| *h == handle);
            pos.map(|i| held.remove(i).1)
        };
        if let Some(callback) = callback {
            callback(CommandAck::new(status, handle, response));
        }
    }

    pub(crate) fn emit_telemetry(&self, handle: Handle, packet: &TelemetryPacket) {
        let callback = lock(&self.callbacks).telemetry.get(&handle).cloned();
        if let Some(callback) = callback {
            (*callback)(handle, packet);
        }
    }

    pub(crate) fn emit_error_report(&self, handle: Handle, report: &ErrorReport) {
        let callback = lock(&self.callbacks).error.get(&handle).cloned();
        if let Some(callback) = callback {
            (*callback)(handle, report);
        }
    }

    pub(crate) fn has_error_callback(&self, handle: Handle) -> bool {
        lock(&self.callbacks).error.contains_key(&handle)
    }
}

pub(crate) fn device_info(handle: Handle, code: &str, state: WorkingState) -> DeviceInfo {
    DeviceInfo {
        handle,
        broadcast_code: code.to_string(),
        device_type: DeviceType::Mid40,
        ip: Ipv4Addr::new(192, 168, 1, handle.wrapping_add(10)),
        state,
        feature: 0,
        status: 0,
    }
}

impl SensorLink for RecordingLink {
    fn init(&self) -> Result<()> {
        self.record(Call::Init);
        if self.init_ok {
            Ok(())
        } else {
            Err(LinkError::Init("scripted failure".into()))
        }
    }

    fn teardown(&self) {
        self.record(Call::Teardown);
        *lock(&self.callbacks) = Callbacks::default();
    }

    fn sdk_version(&self) -> SdkVersion {
        SdkVersion {
            major: 1,
            minor: 0,
            patch: 0,
        }
    }

    fn start_discovery(&self) -> Result<()> {
        self.record(Call::StartDiscovery);
        if !lock(&self.discovery_results).pop_front().unwrap_or(true) {
            return Err(LinkError::Discovery("scripted failure".into()));
        }

        let broadcast = lock(&self.callbacks).broadcast.clone();
        if let Some(cb) = broadcast {
            for (announce, _) in &self.devices {
                (*cb)(announce);
            }
        }
        Ok(())
    }

    fn set_broadcast_callback(&self, callback: BroadcastCallback) {
        lock(&self.callbacks).broadcast = Some(Arc::from(callback));
    }

    fn set_state_callback(&self, callback: StateCallback) {
        lock(&self.callbacks).state = Some(Arc::from(callback));
    }

    fn add_device(&self, broadcast_code: &str) -> Result<Handle> {
        self.record(Call::AddDevice(broadcast_code.to_string()));
        let (_, info) = self
            .devices
            .iter()
            .find(|(b, _)| b.broadcast_code == broadcast_code)
            .ok_or_else(|| LinkError::UnknownDevice(broadcast_code.to_string()))?;

        let state = lock(&self.callbacks).state.clone();
        if let Some(cb) = state {
            (*cb)(info, DeviceEvent::Connect);
        }
        Ok(info.handle)
    }

    fn set_telemetry_callback(&self, handle: Handle, callback: TelemetryCallback) {
        lock(&self.callbacks)
            .telemetry
            .insert(handle, Arc::from(callback));
    }

    fn set_error_callback(&self, handle: Handle, callback: ErrorCallback) {
        lock(&self.callbacks).error.insert(handle, Arc::from(callback));
    }

    fn query_device_info(&self, handle: Handle, callback: InfoCallback) -> Result<()> {
        self.record(Call::QueryInfo(handle));
        callback(
            CommandStatus::Success,
            handle,
            Some(FirmwareInfo {
                version: [1, 2, 3, 4],
            }),
        );
        Ok(())
    }

    fn start_sampling(&self, handle: Handle, callback: CommandCallback) -> Result<()> {
        self.record(Call::StartSampling(handle));
        match self.sampling_reply {
            Some((status, response)) => callback(CommandAck::new(status, handle, response)),
            None => lock(&self.held_sampling).push((handle, callback)),
        }
        Ok(())
    }

    fn stop_sampling(&self, handle: Handle, callback: CommandCallback) -> Result<()> {
        self.record(Call::StopSampling(handle));
        callback(CommandAck::new(CommandStatus::Success, handle, 0));
        Ok(())
    }

    fn set_mode(&self, handle: Handle, mode: LidarMode, callback: CommandCallback) -> Result<()> {
        self.record(Call::SetMode(handle, mode));
        let Some((status, response)) = self.mode_reply else {
            lock(&self.held_modes).push(callback);
            return Ok(());
        };

        let modes = Arc::clone(&self.modes);
        let delay = self.mode_delay;
        thread::spawn(move || {
            thread::sleep(delay);
            let ack = CommandAck::new(status, handle, response);
            if ack.is_accepted() {
                lock(&modes).insert(handle, mode);
            }
            callback(ack);
        });
        Ok(())
    }

    fn get_mode(&self, handle: Handle) -> Option<LidarMode> {
        self.record(Call::GetMode(handle));
        Some(lock(&self.modes).get(&handle).copied().unwrap_or_default())
    }
}
