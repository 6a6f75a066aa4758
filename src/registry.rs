//! Fixed-capacity device table shared between the link callbacks and the
//! foreground session.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::warn;

use crate::link::{DeviceInfo, Handle, LidarMode, MAX_DEVICES};

/// Connection lifecycle tracked per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Sampling,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Sampling => write!(f, "sampling"),
        }
    }
}

/// One registry slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRecord {
    pub handle: Handle,
    pub state: ConnectionState,
    /// Broadcast code seen at discovery, before any metadata arrives.
    pub broadcast_code: String,
    /// Last metadata snapshot; stale once the record is `Disconnected`.
    pub info: Option<DeviceInfo>,
    /// Bumped on every `Disconnected -> Connected` transition.
    pub generation: u32,
    /// A start-sampling command is in flight for the current generation.
    pub start_pending: bool,
    /// Last mode confirmed by the device after a mode change.
    pub last_mode: Option<LidarMode>,
}

impl DeviceRecord {
    fn empty(handle: Handle) -> Self {
        Self {
            handle,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.state > ConnectionState::Disconnected
    }

    /// Network address from the last metadata snapshot, if any.
    pub fn ip(&self) -> Option<std::net::Ipv4Addr> {
        self.info.as_ref().map(|info| info.ip)
    }
}

/// Thread-safe table of [`MAX_DEVICES`] records indexed by handle.
///
/// Handles outside the table are rejected: reads return `None` and writes are
/// dropped with a warning.
pub struct Registry {
    slots: RwLock<Vec<DeviceRecord>>,
    received: Vec<AtomicU64>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(
                (0..MAX_DEVICES)
                    .map(|i| DeviceRecord::empty(i as Handle))
                    .collect(),
            ),
            received: (0..MAX_DEVICES).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn in_range(handle: Handle) -> bool {
        (handle as usize) < MAX_DEVICES
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<DeviceRecord>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<DeviceRecord>> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the record for `handle`.
    pub fn get(&self, handle: Handle) -> Option<DeviceRecord> {
        if !Self::in_range(handle) {
            return None;
        }
        self.read().get(handle as usize).cloned()
    }

    /// Mutate the record for `handle` under the write lock.
    pub fn update<R>(&self, handle: Handle, f: impl FnOnce(&mut DeviceRecord) -> R) -> Option<R> {
        if !Self::in_range(handle) {
            warn!("registry: dropping update for out-of-range handle {}", handle);
            return None;
        }
        let mut slots = self.write();
        slots.get_mut(handle as usize).map(f)
    }

    /// Populate a slot for a freshly discovered device.
    ///
    /// The slot starts `Disconnected`; a `Connect` event moves it on. A slot
    /// that is already connected only has its broadcast code refreshed.
    pub fn register(&self, handle: Handle, broadcast_code: &str) -> bool {
        self.update(handle, |record| {
            record.broadcast_code = broadcast_code.to_string();
            if record.state == ConnectionState::Disconnected {
                record.handle = handle;
                record.start_pending = false;
            }
        })
        .is_some()
    }

    /// First record beyond `Disconnected`, lowest handle first.
    pub fn first_active(&self) -> Option<DeviceRecord> {
        self.read().iter().find(|r| r.is_active()).cloned()
    }

    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.read().clone()
    }

    /// Zero every slot and receive counter.
    pub fn reset(&self) {
        let mut slots = self.write();
        for (i, record) in slots.iter_mut().enumerate() {
            *record = DeviceRecord::empty(i as Handle);
        }
        for counter in &self.received {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Count one telemetry packet; returns the new total.
    pub fn record_packet(&self, handle: Handle) -> Option<u64> {
        self.received
            .get(handle as usize)
            .map(|c| c.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn packets_received(&self, handle: Handle) -> Option<u64> {
        self.received
            .get(handle as usize)
            .map(|c| c.load(Ordering::Relaxed))
    }
}
