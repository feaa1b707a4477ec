use serde::{Deserialize, Serialize};

use super::{FetchError, FetchResult};

pub const DEFAULT_DEVICE_MODELS: &[&str] = &["madv.cateye.", "xiaomi.lock."];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub did: String,
    pub name: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Doorbell,
    Lock,
    Other,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Doorbell => "doorbell",
            DeviceKind::Lock => "lock",
            DeviceKind::Other => "other",
        }
    }
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        if self.model.starts_with("madv.cateye.") {
            DeviceKind::Doorbell
        } else if self.model.starts_with("xiaomi.lock.") {
            DeviceKind::Lock
        } else {
            DeviceKind::Other
        }
    }
}

/// Picks the configured `did` if given, otherwise the first device whose model matches a prefix.
pub fn select_device(
    devices: &[Device],
    did: Option<&str>,
    model_prefixes: &[String],
) -> FetchResult<Device> {
    let found = match did {
        Some(did) => devices.iter().find(|device| device.did == did),
        None => devices.iter().find(|device| {
            model_prefixes
                .iter()
                .any(|prefix| device.model.starts_with(prefix.as_str()))
        }),
    };
    found.cloned().ok_or_else(|| FetchError::NoDevice {
        available: if devices.is_empty() {
            "none".to_string()
        } else {
            devices
                .iter()
                .map(|device| format!("{} ({}, {})", device.name, device.model, device.did))
                .collect::<Vec<_>>()
                .join(", ")
        },
    })
}
