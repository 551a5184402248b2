// Thunderbolt/USB4 authorization daemon
//
// Copyright (C) 2023, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

// Pure helpers for reading and classifying Thunderbolt/USB4 sysfs nodes. Nothing in this module
// touches the device table; it only ever looks at the udev handle it's given.

use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::UdevError;

const DMI_ID_PATH: &str = "/sys/devices/virtual/dmi/id";

/// Coarse classification of a sysfs node under the `thunderbolt` subsystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Kind {
    /// The domain controller (one per Thunderbolt/USB4 host port).
    Domain,
    /// The router immediately below a domain — the local host controller.
    Host,
    /// Any other router further down the chain.
    Peripheral,
    /// Not a thunderbolt device we care about.
    Other,
}

impl Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Domain => "domain",
            Self::Host => "host",
            Self::Peripheral => "peripheral",
            Self::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// Thunderbolt/USB4 domain security level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecurityLevel {
    /// PCIe tunnels are created automatically.
    None,
    /// User approval is required.
    User,
    /// User approval is required and the device must match a stored challenge key.
    Secure,
    /// Only DisplayPort and USB tunneling is done.
    DpOnly,
    /// Only a single PCIe tunnel to the first-level USB controller is created.
    UsbOnly,
    /// PCIe tunneling is disabled by boot firmware.
    NoPcie,
    /// Unrecognized value.
    Unknown,
}

impl From<&str> for SecurityLevel {
    fn from(s: &str) -> Self {
        match s {
            "none" => Self::None,
            "user" => Self::User,
            "secure" => Self::Secure,
            "dponly" => Self::DpOnly,
            "usbonly" => Self::UsbOnly,
            "nopcie" => Self::NoPcie,
            _ => Self::Unknown,
        }
    }
}

/// Rx/Tx lane count and speed (Mb/s), as reported by the kernel driver.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LinkSpeed {
    pub rx_lanes: u32,
    pub rx_speed: u32,
    pub tx_lanes: u32,
    pub tx_speed: u32,
}

/// A snapshot of the attributes the manager needs whenever it looks at a device node.
#[derive(Clone, Debug)]
pub struct DevInfo {
    /// Raw value of `authorized` (0, 1 or 2).
    pub authorized: i32,
    /// Length of the `key` attribute in bytes, or -1 if absent.
    pub keysize: i32,
    /// Raw value of `boot`, or -1 if absent.
    pub boot: i32,
    /// Thunderbolt generation (1..4), or -1 if unknown.
    pub generation: i32,
    /// `ctime` of the sysfs node, in seconds since the epoch.
    pub ctime: i64,
    pub syspath: PathBuf,
    pub parent_uid: Option<String>,
    pub linkspeed: LinkSpeed,
}

fn attr_str(dev: &udev::Device, attr: &str) -> Option<String> {
    dev.attribute_value(attr)
        .and_then(|v| v.to_str())
        .map(String::from)
}

fn attr_int(dev: &udev::Device, attr: &str) -> Option<i32> {
    attr_str(dev, attr).and_then(|v| v.trim().parse::<i32>().ok())
}

/// Reads the `unique_id` attribute that identifies a router/domain across reboots.
pub fn read_uid(dev: &udev::Device) -> Option<String> {
    attr_str(dev, "unique_id")
}

fn is_thunderbolt(dev: &udev::Device) -> bool {
    dev.subsystem().and_then(|s| s.to_str()) == Some("thunderbolt")
}

fn devtype(dev: &udev::Device) -> Option<&str> {
    dev.devtype().and_then(|d| d.to_str())
}

/// Returns `true` if `dev` is a Thunderbolt domain controller.
pub fn is_domain(dev: &udev::Device) -> bool {
    is_thunderbolt(dev) && devtype(dev) == Some("thunderbolt_domain")
}

/// Ascends parent links starting at `dev` until a domain controller is found. Returns
/// `(domain, host)` where `host` is the node immediately below the domain — which may be `dev`
/// itself, or one of its ancestors.
pub fn find_domain_ancestor(dev: &udev::Device) -> Option<(udev::Device, udev::Device)> {
    let mut host = udev::Device::from_syspath(dev.syspath()).ok()?;
    loop {
        let parent = host.parent()?;
        if is_domain(&parent) {
            return Some((parent, host));
        }
        host = parent;
    }
}

/// Classifies a sysfs node as {Domain, Host, Peripheral, Other}.
pub fn classify(dev: &udev::Device) -> Kind {
    if !is_thunderbolt(dev) {
        return Kind::Other;
    }

    match devtype(dev) {
        Some("thunderbolt_domain") => Kind::Domain,
        Some("thunderbolt_device") => match find_domain_ancestor(dev) {
            Some((_, host)) if host.syspath() == dev.syspath() => Kind::Host,
            _ => Kind::Peripheral,
        },
        _ => Kind::Other,
    }
}

fn read_sysattr_name(dev: &udev::Device, attr: &str) -> Option<String> {
    attr_str(dev, &format!("{attr}_name")).or_else(|| attr_str(dev, attr))
}

/// Reads `(vendor, name)` for a router node, preferring the `_name` variant of each attribute.
pub fn read_device_identity(dev: &udev::Device) -> Option<(String, String)> {
    let vendor = read_sysattr_name(dev, "vendor")?;
    let name = read_sysattr_name(dev, "device")?;
    Some((vendor, name))
}

/// Reads `(vendor, name)` for a host controller, falling back to DMI information when the
/// controller itself has no identity attributes (no DROM).
pub fn read_host_identity(dev: &udev::Device) -> Option<(String, String)> {
    if let Some(ident) = read_device_identity(dev) {
        return Some(ident);
    }

    read_host_identity_from_dmi(Path::new(DMI_ID_PATH))
}

fn read_host_identity_from_dmi(dmi_path: &Path) -> Option<(String, String)> {
    let dmi = udev::Device::from_syspath(dmi_path).ok()?;

    let vendor = attr_str(&dmi, "sys_vendor")?;

    let (attr, vendor) = if vendor.eq_ignore_ascii_case("lenovo") {
        ("product_version", String::from("Lenovo"))
    } else {
        ("product_name", vendor)
    };

    let name = attr_str(&dmi, attr)?;

    Some((vendor, name))
}

/// Reads the `security` attribute of the domain containing `dev` (or of `dev` itself, if it is
/// the domain).
pub fn read_security_level(dev: &udev::Device) -> SecurityLevel {
    let domain = if is_domain(dev) {
        udev::Device::from_syspath(dev.syspath()).ok()
    } else {
        find_domain_ancestor(dev).map(|(domain, _)| domain)
    };

    domain
        .and_then(|d| attr_str(&d, "security"))
        .map(|s| SecurityLevel::from(s.as_str()))
        .unwrap_or(SecurityLevel::Unknown)
}

/// Reads the four lane/speed attributes, each defaulting to 0 if absent or unparsable.
pub fn read_link_speed(dev: &udev::Device) -> LinkSpeed {
    LinkSpeed {
        rx_lanes: attr_int(dev, "rx_lanes").filter(|v| *v > 0).unwrap_or(0) as u32,
        rx_speed: attr_int(dev, "rx_speed").filter(|v| *v > 0).unwrap_or(0) as u32,
        tx_lanes: attr_int(dev, "tx_lanes").filter(|v| *v > 0).unwrap_or(0) as u32,
        tx_speed: attr_int(dev, "tx_speed").filter(|v| *v > 0).unwrap_or(0) as u32,
    }
}

fn ctime_of(syspath: &Path) -> i64 {
    fs::metadata(syspath)
        .ok()
        .and_then(|meta| meta.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Reads the attribute snapshot the manager needs to construct or refresh a `Device` record.
pub fn read_info(dev: &udev::Device) -> Result<DevInfo, UdevError> {
    let syspath = dev.syspath().to_path_buf();

    let authorized = attr_int(dev, "authorized").ok_or_else(|| UdevError::MissingAttribute {
        attr: "authorized",
        syspath: syspath.display().to_string(),
    })?;

    let keysize = attr_str(dev, "key").map(|k| k.len() as i32).unwrap_or(-1);
    let boot = attr_int(dev, "boot").unwrap_or(-1);
    let generation = attr_int(dev, "generation").unwrap_or(-1);
    let ctime = ctime_of(&syspath);

    let parent_uid = dev.parent().and_then(|p| attr_str(&p, "unique_id"));
    let linkspeed = read_link_speed(dev);

    Ok(DevInfo {
        authorized,
        keysize,
        boot,
        generation,
        ctime,
        syspath,
        parent_uid,
        linkspeed,
    })
}

/// Reads the comma-separated boot ACL off a domain node.
pub fn read_boot_acl(domain: &udev::Device) -> Vec<String> {
    match attr_str(domain, "boot_acl") {
        Some(v) if !v.is_empty() => v.split(',').map(String::from).collect(),
        _ => Vec::new(),
    }
}

/// Writes a new boot ACL to a domain node, joining entries with commas.
pub fn write_boot_acl(domain: &mut udev::Device, acl: &[String]) -> std::io::Result<()> {
    domain.set_attribute_value("boot_acl", acl.join(","))
}

/// Reads the IOMMU DMA protection flag off a router node.
pub fn read_iommu_dma_protection(dev: &udev::Device) -> bool {
    attr_int(dev, "iommu_dma_protection").unwrap_or(0) > 0
}

/// Fixed table of NHI (Native Host Interface) PCI ids and whether their generated domain UUID is
/// stable across reboots. Used to decide whether a host controller's uid can be trusted to
/// identify "the same domain" after a reboot.
const NHI_TABLE: &[(u32, bool)] = &[
    (0x157d, true),  // Wildcat Ridge 2C NHI
    (0x15bf, true),  // Alpine Ridge LP NHI
    (0x15d2, true),  // Alpine Ridge C 4C NHI
    (0x15d9, true),  // Alpine Ridge C 2C NHI
    (0x15dc, true),  // Alpine Ridge LP USB-only NHI
    (0x15dd, true),  // Alpine Ridge USB-only NHI
    (0x15de, true),  // Alpine Ridge C USB-only NHI
    (0x15e8, true),  // Titan Ridge 2C NHI
    (0x15eb, true),  // Titan Ridge 4C NHI
    (0x8a0d, false), // Ice Lake NHI1
    (0x8a17, false), // Ice Lake NHI0
    (0x9a1b, false), // Tiger Lake NHI0
    (0x9a1d, false), // Tiger Lake NHI1
];

/// Looks up whether a host controller's PCI id produces a stable domain UUID across reboots.
/// Returns `None` for unknown PCI ids.
pub fn nhi_uuid_is_stable(pci_id: u32) -> Option<bool> {
    NHI_TABLE
        .iter()
        .find(|(id, _)| *id == pci_id)
        .map(|(_, stable)| *stable)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn security_level_parses_known_values() {
        assert_eq!(SecurityLevel::from("none"), SecurityLevel::None);
        assert_eq!(SecurityLevel::from("user"), SecurityLevel::User);
        assert_eq!(SecurityLevel::from("secure"), SecurityLevel::Secure);
        assert_eq!(SecurityLevel::from("dponly"), SecurityLevel::DpOnly);
        assert_eq!(SecurityLevel::from("usbonly"), SecurityLevel::UsbOnly);
        assert_eq!(SecurityLevel::from("nopcie"), SecurityLevel::NoPcie);
        assert_eq!(SecurityLevel::from("bogus"), SecurityLevel::Unknown);
    }

    #[test]
    fn nhi_table_distinguishes_stable_and_volatile_controllers() {
        assert_eq!(nhi_uuid_is_stable(0x15bf), Some(true));
        assert_eq!(nhi_uuid_is_stable(0x9a1b), Some(false));
        assert_eq!(nhi_uuid_is_stable(0xffff), None);
    }
}
