use log::{debug, warn};

use crate::link::{DeviceType, BROADCAST_CODE_LEN};

/// Decides which broadcasting devices get connected.
///
/// With an empty allow-list every sensor is accepted. Hubs are never
/// registered directly.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    allow_list: Vec<String>,
}

impl DiscoveryFilter {
    pub fn new<I, S>(allow_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow_list: allow_list
                .into_iter()
                .map(|s| {
                    let s: String = s.into();
                    s.trim().to_string()
                })
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn allow_list(&self) -> &[String] {
        &self.allow_list
    }

    pub fn should_register(&self, broadcast_code: &str, device_type: DeviceType) -> bool {
        if device_type == DeviceType::Hub {
            debug!("ignoring hub broadcast: {}", broadcast_code);
            return false;
        }
        if broadcast_code.len() > BROADCAST_CODE_LEN {
            warn!("broadcast code longer than {} bytes: {}", BROADCAST_CODE_LEN, broadcast_code);
            return false;
        }
        if self.allow_list.is_empty() {
            return true;
        }

        let found = self.allow_list.iter().any(|entry| entry == broadcast_code);
        if !found {
            debug!("broadcast code not in allow-list: {}", broadcast_code);
        }
        found
    }
}
