// Debug interface - process-wide live-object tracking
//
// Shared by every device created with debugging enabled. Comes up the first
// time such a device attaches and is torn down when the last one detaches,
// so its lifetime is explicit instead of riding on static initialization.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use super::resource::ResourceKind;
use super::types::DeviceId;

static DEBUG_INTERFACE: Mutex<Option<DebugInterface>> = parking_lot::const_mutex(None);

#[derive(Debug, Default)]
pub struct DebugInterface {
    devices: HashMap<DeviceId, BTreeMap<ResourceKind, usize>>,
}

impl DebugInterface {
    pub fn attach(&mut self, device: DeviceId) {
        self.devices.entry(device).or_default();
    }

    /// Returns true when no attached device remains.
    pub fn detach(&mut self, device: DeviceId) -> bool {
        self.devices.remove(&device);
        self.devices.is_empty()
    }

    pub fn track(&mut self, device: DeviceId, kind: ResourceKind) {
        if let Some(counts) = self.devices.get_mut(&device) {
            *counts.entry(kind).or_default() += 1;
        }
    }

    pub fn untrack(&mut self, device: DeviceId, kind: ResourceKind) {
        if let Some(count) = self
            .devices
            .get_mut(&device)
            .and_then(|counts| counts.get_mut(&kind))
        {
            *count = count.saturating_sub(1);
        }
    }

    /// Non-zero live counts per kind for `device`
    pub fn live_objects(&self, device: DeviceId) -> Vec<(ResourceKind, usize)> {
        self.devices
            .get(&device)
            .map(|counts| {
                counts
                    .iter()
                    .filter(|(_, &count)| count > 0)
                    .map(|(&kind, &count)| (kind, count))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn attached_devices(&self) -> usize {
        self.devices.len()
    }
}

pub fn attach(device: DeviceId) {
    let mut guard = DEBUG_INTERFACE.lock();
    let interface = guard.get_or_insert_with(|| {
        log::info!("Debug interface initialized");
        DebugInterface::default()
    });
    interface.attach(device);
}

pub fn detach(device: DeviceId) {
    let mut guard = DEBUG_INTERFACE.lock();
    let last = match guard.as_mut() {
        Some(interface) => interface.detach(device),
        None => return,
    };
    if last {
        *guard = None;
        log::info!("Debug interface torn down");
    }
}

pub fn track(device: DeviceId, kind: ResourceKind) {
    if let Some(interface) = DEBUG_INTERFACE.lock().as_mut() {
        interface.track(device, kind);
    }
}

pub fn untrack(device: DeviceId, kind: ResourceKind) {
    if let Some(interface) = DEBUG_INTERFACE.lock().as_mut() {
        interface.untrack(device, kind);
    }
}

/// Log every object `device` still has alive. Returns the total.
pub fn report_live_objects(device: DeviceId) -> usize {
    let live = DEBUG_INTERFACE
        .lock()
        .as_ref()
        .map(|interface| interface.live_objects(device))
        .unwrap_or_default();

    let total: usize = live.iter().map(|(_, count)| count).sum();
    if total == 0 {
        log::info!("Device {}: no live objects", device);
    } else {
        for (kind, count) in &live {
            log::warn!("Device {}: {} live {:?} object(s)", device, count, kind);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_kept_per_device() {
        let mut interface = DebugInterface::default();
        let a = DeviceId::next();
        let b = DeviceId::next();
        interface.attach(a);
        interface.attach(b);

        interface.track(a, ResourceKind::Buffer);
        interface.track(a, ResourceKind::Buffer);
        interface.track(b, ResourceKind::Texture2D);
        interface.untrack(a, ResourceKind::Buffer);

        assert_eq!(interface.live_objects(a), vec![(ResourceKind::Buffer, 1)]);
        assert_eq!(interface.live_objects(b), vec![(ResourceKind::Texture2D, 1)]);
    }

    #[test]
    fn last_detach_reports_empty() {
        let mut interface = DebugInterface::default();
        let a = DeviceId::next();
        let b = DeviceId::next();
        interface.attach(a);
        interface.attach(b);

        assert!(!interface.detach(a));
        assert!(interface.detach(b));
        assert_eq!(interface.attached_devices(), 0);
    }

    #[test]
    fn untracked_devices_are_ignored() {
        let mut interface = DebugInterface::default();
        let device = DeviceId::next();
        interface.track(device, ResourceKind::Buffer);
        assert!(interface.live_objects(device).is_empty());
    }

    #[test]
    fn global_interface_follows_attached_device() {
        let device = DeviceId::next();
        attach(device);
        track(device, ResourceKind::InputLayout);
        assert_eq!(report_live_objects(device), 1);

        untrack(device, ResourceKind::InputLayout);
        assert_eq!(report_live_objects(device), 0);
        detach(device);
    }
}
