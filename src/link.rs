//! Sensor Link abstraction.
//!
//! The Sensor Link is the vendor side of the stack: it owns the wire protocol,
//! broadcast discovery and command sequencing. This crate only talks to it
//! through [`SensorLink`], and every asynchronous answer comes back through a
//! callback fired on one of the link's own threads.

use std::fmt;
use std::net::Ipv4Addr;

use clap::ValueEnum;
use serde::Deserialize;

use crate::errors::Result;

// ============================================================================
// Constants
// ============================================================================

/// Number of device slots a link can hand out.
pub const MAX_DEVICES: usize = 32;

/// Significant width of a broadcast code (serial number) in characters.
pub const BROADCAST_CODE_LEN: usize = 15;

/// Small integer identifying one sensor while it is known to the link.
pub type Handle = u8;

// ============================================================================
// Data Types
// ============================================================================

/// Operating profile a device can be switched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LidarMode {
    /// Full-rate scanning
    #[default]
    Normal = 1,
    /// Motor and laser throttled
    PowerSaving = 2,
    /// Idle, ready to resume quickly
    Standby = 3,
}

impl fmt::Display for LidarMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LidarMode::Normal => write!(f, "Normal"),
            LidarMode::PowerSaving => write!(f, "PowerSaving"),
            LidarMode::Standby => write!(f, "Standby"),
        }
    }
}

/// Working phase reported by the device itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkingState {
    /// Booting; `DeviceInfo::status` carries a progress value
    #[default]
    Init,
    Normal,
    PowerSaving,
    Standby,
    /// Faulted; `DeviceInfo::status` carries an error code
    Error,
    Unknown,
}

impl From<LidarMode> for WorkingState {
    fn from(mode: LidarMode) -> Self {
        match mode {
            LidarMode::Normal => WorkingState::Normal,
            LidarMode::PowerSaving => WorkingState::PowerSaving,
            LidarMode::Standby => WorkingState::Standby,
        }
    }
}

impl fmt::Display for WorkingState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            WorkingState::Init => "init",
            WorkingState::Normal => "normal",
            WorkingState::PowerSaving => "power-saving",
            WorkingState::Standby => "standby",
            WorkingState::Error => "error",
            WorkingState::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Hardware family announced in the discovery broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    /// Relay that fans out to several sensors; never registered directly
    Hub,
    #[default]
    Mid40,
    Tele15,
    Horizon,
    Mid70,
    Avia,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DeviceType::Hub => "hub",
            DeviceType::Mid40 => "mid40",
            DeviceType::Tele15 => "tele15",
            DeviceType::Horizon => "horizon",
            DeviceType::Mid70 => "mid70",
            DeviceType::Avia => "avia",
        };
        f.write_str(name)
    }
}

/// Point layout carried by a telemetry packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    Cartesian,
    Spherical,
    #[default]
    ExtendCartesian,
    ExtendSpherical,
    DualExtendCartesian,
    DualExtendSpherical,
    Imu,
    TripleExtendCartesian,
    TripleExtendSpherical,
}

/// Outcome of an asynchronous command as reported by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Failure,
    Timeout,
    NotConnected,
    NotSupported,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CommandStatus::Success => "success",
            CommandStatus::Failure => "failure",
            CommandStatus::Timeout => "timeout",
            CommandStatus::NotConnected => "not connected",
            CommandStatus::NotSupported => "not supported",
        };
        f.write_str(name)
    }
}

/// Acknowledgement delivered to a command callback.
///
/// `response` is the device's own verdict: `0` means accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    pub status: CommandStatus,
    pub handle: Handle,
    pub response: u8,
}

impl CommandAck {
    #[inline]
    pub fn new(status: CommandStatus, handle: Handle, response: u8) -> Self {
        Self {
            status,
            handle,
            response,
        }
    }

    /// Transport succeeded and the device accepted the command.
    pub fn is_accepted(&self) -> bool {
        self.status == CommandStatus::Success && self.response == 0
    }
}

/// Discovery broadcast as seen before a device is added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastInfo {
    pub broadcast_code: String,
    pub device_type: DeviceType,
    pub ip: Ipv4Addr,
}

/// Metadata snapshot delivered with every device state event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub handle: Handle,
    pub broadcast_code: String,
    pub device_type: DeviceType,
    pub ip: Ipv4Addr,
    pub state: WorkingState,
    /// Feature bit flags (bit 0: rain/fog suppression)
    pub feature: u32,
    /// Progress (0-100) while in `Init`, error code otherwise
    pub status: u32,
}

/// Device lifecycle events pushed by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Connect,
    Disconnect,
    StateChange,
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceEvent::Connect => write!(f, "Connect"),
            DeviceEvent::Disconnect => write!(f, "Disconnect"),
            DeviceEvent::StateChange => write!(f, "StateChange"),
        }
    }
}

/// Reply to a device information query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub version: [u8; 4],
}

impl fmt::Display for FirmwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d] = self.version;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

/// Version of the link implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdkVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for SdkVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One point-cloud or IMU packet. Only the header is surfaced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryPacket {
    pub data_type: DataType,
    /// Device timestamp in nanoseconds
    pub timestamp: u64,
    pub point_count: u32,
}

/// Packed device health word pushed with status messages.
///
/// Bit layout (LSB first):
/// - 0-1 temperature, 2-3 voltage, 4-5 motor, 6-7 dirty/blocked window
/// - 8 firmware, 9 PPS, 10 device, 11 fan, 12 self-heating, 13 PTP
/// - 14-16 time sync, 30-31 system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorReport(pub u32);

impl ErrorReport {
    #[inline]
    fn bits(&self, shift: u32, width: u32) -> u8 {
        ((self.0 >> shift) & ((1 << width) - 1)) as u8
    }

    pub fn temp_status(&self) -> u8 {
        self.bits(0, 2)
    }

    pub fn volt_status(&self) -> u8 {
        self.bits(2, 2)
    }

    pub fn motor_status(&self) -> u8 {
        self.bits(4, 2)
    }

    pub fn dirty_warn(&self) -> u8 {
        self.bits(6, 2)
    }

    pub fn firmware_err(&self) -> u8 {
        self.bits(8, 1)
    }

    pub fn pps_status(&self) -> u8 {
        self.bits(9, 1)
    }

    pub fn device_status(&self) -> u8 {
        self.bits(10, 1)
    }

    pub fn fan_status(&self) -> u8 {
        self.bits(11, 1)
    }

    pub fn self_heating(&self) -> u8 {
        self.bits(12, 1)
    }

    pub fn ptp_status(&self) -> u8 {
        self.bits(13, 1)
    }

    pub fn time_sync_status(&self) -> u8 {
        self.bits(14, 3)
    }

    pub fn system_status(&self) -> u8 {
        self.bits(30, 2)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "temp={} volt={} motor={} dirty={} firmware={} pps={} device={} fan={} \
             self_heating={} ptp={} time_sync={} system={}",
            self.temp_status(),
            self.volt_status(),
            self.motor_status(),
            self.dirty_warn(),
            self.firmware_err(),
            self.pps_status(),
            self.device_status(),
            self.fan_status(),
            self.self_heating(),
            self.ptp_status(),
            self.time_sync_status(),
            self.system_status()
        )
    }
}

// ============================================================================
// Callbacks
// ============================================================================

pub type BroadcastCallback = Box<dyn Fn(&BroadcastInfo) + Send + Sync>;
pub type StateCallback = Box<dyn Fn(&DeviceInfo, DeviceEvent) + Send + Sync>;
pub type TelemetryCallback = Box<dyn Fn(Handle, &TelemetryPacket) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(Handle, &ErrorReport) + Send + Sync>;
/// Fired exactly once with the command's acknowledgement.
pub type CommandCallback = Box<dyn FnOnce(CommandAck) + Send>;
/// Fired exactly once with the reply to an information query.
pub type InfoCallback = Box<dyn FnOnce(CommandStatus, Handle, Option<FirmwareInfo>) + Send>;

// ============================================================================
// Sensor Link
// ============================================================================

/// Everything the session layer needs from a vendor link.
///
/// Methods that take a callback return once the command has been handed to
/// the link; the callback may fire on any thread, before or after the method
/// returns. Implementations must be shareable across the foreground thread
/// and the state-machine worker.
pub trait SensorLink: Send + Sync {
    /// Bring the link up. Must be called before anything else.
    fn init(&self) -> Result<()>;

    /// Release the link. Registered callbacks are dropped.
    fn teardown(&self);

    fn sdk_version(&self) -> SdkVersion;

    /// Start listening for device broadcasts.
    fn start_discovery(&self) -> Result<()>;

    fn set_broadcast_callback(&self, callback: BroadcastCallback);

    fn set_state_callback(&self, callback: StateCallback);

    /// Ask the link to connect to a broadcasting device; returns its handle.
    fn add_device(&self, broadcast_code: &str) -> Result<Handle>;

    fn set_telemetry_callback(&self, handle: Handle, callback: TelemetryCallback);

    fn set_error_callback(&self, handle: Handle, callback: ErrorCallback);

    fn query_device_info(&self, handle: Handle, callback: InfoCallback) -> Result<()>;

    fn start_sampling(&self, handle: Handle, callback: CommandCallback) -> Result<()>;

    fn stop_sampling(&self, handle: Handle, callback: CommandCallback) -> Result<()>;

    fn set_mode(&self, handle: Handle, mode: LidarMode, callback: CommandCallback) -> Result<()>;

    /// Mode the link currently believes the device is in.
    fn get_mode(&self, handle: Handle) -> Option<LidarMode>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_report_decodes_packed_fields() {
        // temp=2, motor=1, fan=1, time_sync=5, system=3
        let raw = 0b10 | (0b01 << 4) | (1 << 11) | (0b101 << 14) | (0b11 << 30);
        let report = ErrorReport(raw);
        assert_eq!(report.temp_status(), 2);
        assert_eq!(report.volt_status(), 0);
        assert_eq!(report.motor_status(), 1);
        assert_eq!(report.fan_status(), 1);
        assert_eq!(report.ptp_status(), 0);
        assert_eq!(report.time_sync_status(), 5);
        assert_eq!(report.system_status(), 3);
    }

    #[test]
    fn ack_is_accepted_only_when_device_agrees() {
        assert!(CommandAck::new(CommandStatus::Success, 0, 0).is_accepted());
        assert!(!CommandAck::new(CommandStatus::Success, 0, 1).is_accepted());
        assert!(!CommandAck::new(CommandStatus::Timeout, 0, 0).is_accepted());
    }

    #[test]
    fn firmware_version_formats_dotted() {
        let fw = FirmwareInfo {
            version: [3, 0, 10, 0],
        };
        assert_eq!(fw.to_string(), "3.0.10.0");
    }
}
