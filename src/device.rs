// Thunderbolt/USB4 authorization daemon
//
// Copyright (C) 2023, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

// The in-memory device record and its state machine.

use std::fmt::{self, Display};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, UdevError};
use crate::sysfs::{self, DevInfo, Kind, LinkSpeed, SecurityLevel};

/// Per-device rule governing autonomous authorization.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Policy {
    /// No stance has been taken; authorization requires explicit user action.
    Default,
    /// The user must authorize this device every time it connects.
    Manual,
    /// The daemon authorizes this device automatically whenever preconditions allow.
    Auto,
}

impl Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Default => "default",
            Self::Manual => "manual",
            Self::Auto => "auto",
        };
        write!(f, "{s}")
    }
}

/// Connection/authorization status of a device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Disconnected,
    Connected,
    AuthError,
    AuthConnected,
    AuthConnectedSecure,
}

impl Status {
    /// `true` for the two authorized variants.
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::AuthConnected | Self::AuthConnectedSecure)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::AuthError => "autherror",
            Self::AuthConnected => "authorized",
            Self::AuthConnectedSecure => "authorized-secure",
        };
        write!(f, "{s}")
    }
}

fn status_for_authorized(authorized: i32, security: SecurityLevel) -> Status {
    if authorized <= 0 {
        Status::Connected
    } else if security == SecurityLevel::Secure {
        Status::AuthConnectedSecure
    } else {
        Status::AuthConnected
    }
}

/// A single device (domain, host, or peripheral) known to the manager.
#[derive(Clone, Debug)]
pub struct Device {
    uid: String,
    kind: Kind,
    syspath: Option<PathBuf>,
    name: String,
    vendor: String,
    status: Status,
    policy: Policy,
    stored: bool,
    key: Option<String>,
    generation: i32,
    linkspeed: LinkSpeed,
    parent_uid: Option<String>,
    object_path: Option<String>,
}

impl Device {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_host(&self) -> bool {
        self.kind == Kind::Host
    }

    pub fn syspath(&self) -> Option<&PathBuf> {
        self.syspath.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Setting `Auto` also marks the device as stored (invariant 5).
    pub fn set_policy(&mut self, policy: Policy) {
        if policy == Policy::Auto {
            self.stored = true;
        }
        self.policy = policy;
    }

    pub fn stored(&self) -> bool {
        self.stored
    }

    pub fn set_stored(&mut self, stored: bool) {
        self.stored = stored;
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn set_key(&mut self, key: Option<String>) {
        self.key = key;
    }

    pub fn generation(&self) -> i32 {
        self.generation
    }

    pub fn linkspeed(&self) -> LinkSpeed {
        self.linkspeed
    }

    pub fn parent_uid(&self) -> Option<&str> {
        self.parent_uid.as_deref()
    }

    pub fn object_path(&self) -> Option<&str> {
        self.object_path.as_deref()
    }

    pub fn set_object_path(&mut self, path: Option<String>) {
        self.object_path = path;
    }

    /// Constructs a fresh `Disconnected` record as it would come back from the store: only
    /// identity and policy are known, nothing about current connection state.
    pub fn from_store(uid: String, name: String, vendor: String, policy: Policy, key: Option<String>) -> Self {
        Device {
            uid,
            kind: Kind::Other,
            syspath: None,
            name,
            vendor,
            status: Status::Disconnected,
            policy,
            stored: true,
            key,
            generation: -1,
            linkspeed: LinkSpeed::default(),
            parent_uid: None,
            object_path: None,
        }
    }

    /// Constructs a brand-new record for a device never seen before (the "added" path).
    pub fn new_for_udev(uid: String, dev: &udev::Device) -> Result<Self, UdevError> {
        let kind = sysfs::classify(dev);
        let info = sysfs::read_info(dev)?;
        let security = sysfs::read_security_level(dev);

        let (vendor, name) = if kind == Kind::Host {
            sysfs::read_host_identity(dev)
        } else {
            sysfs::read_device_identity(dev)
        }
        .unwrap_or_else(|| (String::from("Unknown"), String::from("Unknown")));

        Ok(Device {
            uid,
            kind,
            syspath: Some(info.syspath),
            name,
            vendor,
            status: status_for_authorized(info.authorized, security),
            policy: Policy::Default,
            stored: false,
            key: None,
            generation: info.generation,
            linkspeed: info.linkspeed,
            parent_uid: info.parent_uid,
            object_path: None,
        })
    }

    /// Refreshes status, syspath and link speed from a fresh sysfs snapshot. Used for both the
    /// "attached" path (Disconnected -> Connected/authorized) and the "changed" path
    /// (authorized -> authorized, values refreshed).
    fn refresh_from(&mut self, dev: &udev::Device, info: &DevInfo) -> Status {
        let security = sysfs::read_security_level(dev);

        self.kind = sysfs::classify(dev);
        self.syspath = Some(info.syspath.clone());
        self.generation = info.generation;
        self.linkspeed = info.linkspeed;
        self.parent_uid = info.parent_uid.clone();
        self.status = status_for_authorized(info.authorized, security);
        self.status
    }

    /// `Disconnected -> Connected` (or directly to an authorized variant if the kernel already
    /// reports the device as authorized, e.g. it never lost power).
    pub fn connected(&mut self, dev: &udev::Device) -> Result<Status, UdevError> {
        let info = sysfs::read_info(dev)?;
        Ok(self.refresh_from(dev, &info))
    }

    /// Refreshes an already-connected device in place; used by the "changed" udev path.
    pub fn update_from_udev(&mut self, dev: &udev::Device) -> Result<Status, UdevError> {
        let info = sysfs::read_info(dev)?;
        Ok(self.refresh_from(dev, &info))
    }

    /// Copies sysfs-derived fields from a freshly probed snapshot of the same physical device
    /// into `self`. Used by the manager to fold a new presence probe into an existing record
    /// without re-reading sysfs a second time.
    pub fn merge_connected(&mut self, probe: &Device) {
        self.kind = probe.kind;
        self.syspath = probe.syspath.clone();
        self.generation = probe.generation;
        self.linkspeed = probe.linkspeed;
        self.parent_uid = probe.parent_uid.clone();
        self.status = probe.status;
    }

    /// `* -> Disconnected`. The uid, policy, stored flag and parent uid survive; the syspath is
    /// cleared since the node no longer exists.
    pub fn disconnected(&mut self) {
        self.status = Status::Disconnected;
        self.syspath = None;
    }

    /// Applies the outcome of an authorization attempt (or a cascaded re-check) directly, without
    /// going through a fresh sysfs read. Used by the manager when handling `AuthCompletion`.
    pub(crate) fn set_authorized_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Test-only hook for exercising syspath-prefix logic without a real `udev::Device`.
    #[cfg(test)]
    pub(crate) fn set_syspath_for_test(&mut self, syspath: &str) {
        self.syspath = Some(PathBuf::from(syspath));
        self.status = Status::Connected;
    }

    /// Test-only hook for exercising kind-dependent logic without a real `udev::Device`.
    #[cfg(test)]
    pub(crate) fn set_kind_for_test(&mut self, kind: Kind) {
        self.kind = kind;
    }

    /// Performs the blocking kernel write that authorizes (or attempts to authorize) this
    /// device. Must be called off the event-dispatch path — see `auth::AuthEngine`.
    pub fn authorize_blocking(&self) -> Result<Status, AuthError> {
        let syspath = self.syspath.as_ref().ok_or(AuthError::NotEligible)?;

        let mut handle =
            udev::Device::from_syspath(syspath).map_err(AuthError::KernelRejected)?;

        let secure = self.key.is_some();

        if secure {
            let key = self.key.as_deref().unwrap_or_default();
            handle
                .set_attribute_value("key", key)
                .map_err(AuthError::KernelRejected)?;
            handle
                .set_attribute_value("authorized", "2")
                .map_err(AuthError::KernelRejected)?;
            Ok(Status::AuthConnectedSecure)
        } else {
            handle
                .set_attribute_value("authorized", "1")
                .map_err(AuthError::KernelRejected)?;
            Ok(Status::AuthConnected)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Device {
        Device::from_store(
            String::from("uid-1"),
            String::from("Widget"),
            String::from("Acme"),
            Policy::Default,
            None,
        )
    }

    #[test]
    fn store_loaded_device_starts_disconnected() {
        let dev = sample();
        assert_eq!(dev.status(), Status::Disconnected);
        assert!(dev.stored());
        assert!(dev.syspath().is_none());
    }

    #[test]
    fn setting_auto_policy_forces_stored() {
        let mut dev = Device::from_store(
            String::from("uid-2"),
            String::from("Widget"),
            String::from("Acme"),
            Policy::Default,
            None,
        );
        dev.set_stored(false);
        dev.set_policy(Policy::Auto);
        assert!(dev.stored());
    }

    #[test]
    fn disconnect_clears_syspath_but_preserves_identity() {
        let mut dev = sample();
        dev.set_object_path(Some(String::from("/devices/uid-1")));
        dev.disconnected();
        assert_eq!(dev.status(), Status::Disconnected);
        assert!(dev.syspath().is_none());
        assert_eq!(dev.uid(), "uid-1");
        assert!(dev.stored());
    }

    #[test]
    fn authorized_status_picks_secure_variant_only_for_secure_domains() {
        assert_eq!(
            status_for_authorized(1, SecurityLevel::Secure),
            Status::AuthConnectedSecure
        );
        assert_eq!(
            status_for_authorized(1, SecurityLevel::User),
            Status::AuthConnected
        );
        assert_eq!(status_for_authorized(0, SecurityLevel::Secure), Status::Connected);
    }
}
