// Thunderbolt/USB4 authorization daemon
//
// Copyright (C) 2023, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

// Abstracts the outward-facing notification surface. The real daemon exports devices on D-Bus;
// this crate keeps that surface behind a trait so the manager core has no IPC dependency, and
// ships a logging-only implementation as the default.

use crate::device::Device;

/// A lifecycle notification the manager reports to the IPC layer, independent of transport.
pub enum Event<'a> {
    /// A previously-unknown device joined the table and was exported.
    Added(&'a Device),
    /// A device left the table (unplugged and not stored).
    Removed(&'a Device),
    /// An already-exported device's state changed (status, policy, link speed, ...).
    Changed(&'a Device),
}

/// Notifications the manager emits about a device's lifecycle, independent of transport.
pub trait Sink {
    /// A previously-unknown device has joined the table and should be exported.
    fn export(&self, device: &Device) -> String;
    /// A device has left the table (unplugged and not stored) and should be unexported.
    fn unexport(&self, device: &Device);
    /// Reports an `Event` — `Added`/`Removed` map to the distilled spec's `DeviceAdded`/
    /// `DeviceRemoved` notifications; `Changed` is the ambient per-transition status log.
    fn emit(&self, event: Event);
}

/// Default `Sink`: assigns a deterministic object path from the uid and logs every transition.
/// Suitable for headless operation or as a base while a real transport is wired in.
pub struct LoggingSink {
    path_prefix: String,
}

impl LoggingSink {
    pub fn new(path_prefix: impl Into<String>) -> Self {
        LoggingSink { path_prefix: path_prefix.into() }
    }

    fn path_for(&self, device: &Device) -> String {
        format!("{}/{}", self.path_prefix, device.uid())
    }
}

impl Default for LoggingSink {
    fn default() -> Self {
        LoggingSink::new("/org/example/tbauthd/devices")
    }
}

impl Sink for LoggingSink {
    fn export(&self, device: &Device) -> String {
        let path = self.path_for(device);
        log::info!("[{}] exported at {path} ({})", device.uid(), device.status());
        path
    }

    fn unexport(&self, device: &Device) {
        log::info!("[{}] unexported", device.uid());
    }

    fn emit(&self, event: Event) {
        match event {
            Event::Added(device) => log::info!(
                "[{}] DeviceAdded {}",
                device.uid(),
                device.object_path().unwrap_or_default()
            ),
            Event::Removed(device) => log::info!(
                "[{}] DeviceRemoved {}",
                device.uid(),
                device.object_path().unwrap_or_default()
            ),
            Event::Changed(device) => log::info!(
                "[{}] {} policy={} status={}",
                device.uid(),
                device.name(),
                device.policy(),
                device.status()
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::Policy;

    #[test]
    fn export_path_is_deterministic_from_uid() {
        let sink = LoggingSink::new("/org/example/tbauthd/devices");
        let dev = Device::from_store(String::from("abc123"), String::from("n"), String::from("v"), Policy::Default, None);
        assert_eq!(sink.path_for(&dev), "/org/example/tbauthd/devices/abc123");
    }
}
