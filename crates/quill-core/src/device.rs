use std::fmt;
use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};

// Device — logical placement tags
//
// Devices here are bookkeeping, not hardware: an array is *on* a device
// in the sense that it carries the tag and its transfer semantics
// (asynchronous placement, implicit wait on read) are modeled. The
// registry starts with cpu:0; accelerators are registered logically.

/// The kind of a logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Accel,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Accel => write!(f, "accel"),
        }
    }
}

/// A logical device: a kind plus an index within that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    pub kind: DeviceKind,
    pub index: usize,
}

impl Device {
    pub const CPU: Device = Device {
        kind: DeviceKind::Cpu,
        index: 0,
    };

    pub fn new(kind: DeviceKind, index: usize) -> Self {
        Device { kind, index }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.index)
    }
}

fn registry() -> &'static Mutex<Vec<Device>> {
    static REGISTRY: OnceLock<Mutex<Vec<Device>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(vec![Device::CPU]))
}

/// All registered devices of the given kind. Fails with
/// `DeviceUnavailable` when none are registered.
pub fn devices(kind: DeviceKind) -> Result<Vec<Device>> {
    let found: Vec<Device> = registry()
        .lock()
        .expect("device registry lock poisoned")
        .iter()
        .copied()
        .filter(|d| d.kind == kind)
        .collect();
    if found.is_empty() {
        return Err(Error::DeviceUnavailable {
            kind: kind.to_string(),
        });
    }
    Ok(found)
}

/// Register a new logical device of the given kind and return it.
/// Indices count up per kind.
pub fn register_device(kind: DeviceKind) -> Device {
    let mut reg = registry().lock().expect("device registry lock poisoned");
    let index = reg.iter().filter(|d| d.kind == kind).count();
    let device = Device::new(kind, index);
    reg.push(device);
    device
}
