// Thunderbolt/USB4 authorization daemon
//
// Copyright (C) 2023, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

// Offloads the blocking kernel authorization write to a worker thread and reports the outcome
// back onto the manager's event channel, so the single dispatch loop never blocks on I/O.

use std::sync::mpsc::Sender;
use std::thread;

use crate::device::{Device, Policy, Status};
use crate::error::AuthError;
use crate::sysfs::Kind;
use crate::topology::ancestors_authorized;

/// Result of a completed (successful or failed) authorization attempt, posted back onto the
/// manager's channel from the worker thread that performed it.
pub struct AuthCompletion {
    pub uid: String,
    pub result: Result<Status, AuthError>,
}

/// `true` if `device` currently satisfies every precondition for autonomous authorization: it
/// must be a host or peripheral router, connected but not yet authorized, have `Auto` policy, and
/// (for non-host devices) every ancestor up to the host must already be authorized. A host has no
/// parent to wait on and is eligible as soon as it's connected.
pub fn is_eligible(device: &Device, devices: &[Device]) -> bool {
    matches!(device.kind(), Kind::Host | Kind::Peripheral)
        && device.policy() == Policy::Auto
        && !device.status().is_authorized()
        && device.status() != Status::Disconnected
        && (device.is_host() || ancestors_authorized(device, devices))
}

/// Dispatches the blocking authorization write for eligible devices onto worker threads.
pub struct AuthEngine {
    completions: Sender<AuthCompletion>,
}

impl AuthEngine {
    pub fn new(completions: Sender<AuthCompletion>) -> Self {
        AuthEngine { completions }
    }

    /// Spawns a worker thread to authorize `device`. Does not re-check eligibility; callers
    /// should have already consulted `is_eligible`.
    pub fn submit(&self, device: Device) {
        let uid = device.uid().to_string();
        let tx = self.completions.clone();

        thread::spawn(move || {
            let result = device.authorize_blocking();
            // The receiving end (the manager's main loop) outlives every worker for the
            // lifetime of the daemon; a send error here means the daemon is shutting down.
            let _ = tx.send(AuthCompletion { uid, result });
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn peripheral(policy: Policy, status_connected: bool) -> Device {
        let mut d = Device::from_store(String::from("p"), String::from("n"), String::from("v"), policy, None);
        d.set_syspath_for_test("/sys/devices/pci0000:00/0000:00:0d.2/domain0/0-0/0-1");
        d.set_kind_for_test(Kind::Peripheral);
        if !status_connected {
            d.disconnected();
        }
        d
    }

    fn host(policy: Policy) -> Device {
        let mut d = Device::from_store(String::from("h"), String::from("n"), String::from("v"), policy, None);
        d.set_syspath_for_test("/sys/devices/pci0000:00/0000:00:0d.2/domain0/0-0");
        d.set_kind_for_test(Kind::Host);
        d
    }

    #[test]
    fn ineligible_without_auto_policy() {
        let dev = peripheral(Policy::Manual, true);
        assert!(!is_eligible(&dev, &[dev.clone()]));
    }

    #[test]
    fn ineligible_when_disconnected() {
        let dev = peripheral(Policy::Auto, false);
        assert!(!is_eligible(&dev, &[dev.clone()]));
    }

    #[test]
    fn eligible_auto_peripheral_with_host_parent_present() {
        // The host is a satisfied boundary as soon as it's found, regardless of its own status.
        let parent = host(Policy::Default);
        let dev = peripheral(Policy::Auto, true);
        assert!(is_eligible(&dev, &[parent, dev.clone()]));
    }

    #[test]
    fn orphan_non_host_peripheral_defers_until_its_parent_is_known() {
        // No host (or any other device) present in the table to resolve as a parent: this
        // device's place in the topology can't be confirmed yet, so it must not jump ahead.
        let dev = peripheral(Policy::Auto, true);
        assert!(!is_eligible(&dev, &[dev.clone()]));
    }

    #[test]
    fn host_controller_is_eligible_without_any_parent() {
        let dev = host(Policy::Auto);
        assert!(is_eligible(&dev, &[dev.clone()]));
    }
}
