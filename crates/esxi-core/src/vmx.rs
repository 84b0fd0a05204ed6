//! VMX file parsing.
//!
//! Extracts the VM settings, virtual disks and network adapters that a
//! transfer needs from a VMX configuration.

use crate::error::{Error, Result};
use crate::kv;
use serde::Serialize;
use std::collections::HashMap;

const FILE: &str = "VMX";

/// Bus a virtual disk is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    Ide,
    Sata,
    Scsi,
    Nvme,
}

impl ControllerKind {
    const ALL: [ControllerKind; 4] = [
        ControllerKind::Ide,
        ControllerKind::Sata,
        ControllerKind::Scsi,
        ControllerKind::Nvme,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            ControllerKind::Ide => "ide",
            ControllerKind::Sata => "sata",
            ControllerKind::Scsi => "scsi",
            ControllerKind::Nvme => "nvme",
        }
    }
}

/// A virtual disk attached to the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmxDisk {
    pub kind: ControllerKind,
    /// Controller number, e.g. 0 for `scsi0`.
    pub controller: u32,
    /// Unit number on the controller.
    pub unit: u32,
    /// Descriptor file name, relative to the VMX directory or absolute.
    pub file_name: String,
    pub device_type: Option<String>,
}

impl VmxDisk {
    /// Device node such as `scsi0:1`.
    pub fn node(&self) -> String {
        format!("{}{}:{}", self.kind.prefix(), self.controller, self.unit)
    }
}

/// A network adapter attached to the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmxNetwork {
    /// Adapter name, e.g. `ethernet0`.
    pub name: String,
    pub virtual_dev: Option<String>,
    pub network_name: Option<String>,
    /// `generated`, `static` or `vpx`.
    pub address_type: Option<String>,
    pub generated_address: Option<String>,
    pub address: Option<String>,
}

impl VmxNetwork {
    /// True when the MAC address was generated by the hypervisor.
    pub fn is_generated(&self) -> bool {
        self.address_type.as_deref() == Some("generated")
    }

    /// The MAC address in effect.
    pub fn mac_address(&self) -> Option<&str> {
        if self.is_generated() {
            self.generated_address.as_deref()
        } else {
            self.address.as_deref().or(self.generated_address.as_deref())
        }
    }
}

/// Parsed VMX configuration.
#[derive(Debug, Clone)]
pub struct VmxConfig {
    pub display_name: Option<String>,
    pub guest_os: Option<String>,
    pub memory_mb: Option<u32>,
    pub num_cpus: Option<u32>,
    /// `bios` or `efi`.
    pub firmware: Option<String>,
    /// Disks ordered by bus, controller and unit.
    pub disks: Vec<VmxDisk>,
    /// Adapters ordered by name.
    pub networks: Vec<VmxNetwork>,
    /// Every key/value pair of the file.
    pub raw: HashMap<String, String>,
}

/// Parse VMX content.
///
/// # Errors
///
/// Returns an error for lines that are not key/value pairs and for
/// non-numeric memory, CPU, controller or unit numbers.
pub fn parse_vmx(content: &str) -> Result<VmxConfig> {
    let raw: HashMap<String, String> = kv::parse_map(FILE, content)?
        .into_iter()
        .map(|(key, value)| (key, kv::unescape(&value)))
        .collect();

    let memory_mb = raw
        .get("memsize")
        .map(|v| kv::number(FILE, "memsize", v))
        .transpose()?;
    let num_cpus = raw
        .get("numvcpus")
        .map(|v| kv::number(FILE, "numvcpus", v))
        .transpose()?;

    let disks = extract_disks(&raw)?;
    let networks = extract_networks(&raw);

    Ok(VmxConfig {
        display_name: raw.get("displayName").cloned(),
        guest_os: raw.get("guestOS").cloned(),
        memory_mb,
        num_cpus,
        firmware: raw.get("firmware").cloned(),
        disks,
        networks,
        raw,
    })
}

fn is_true(raw: &HashMap<String, String>, key: &str) -> bool {
    raw.get(key).is_some_and(|v| v.eq_ignore_ascii_case("TRUE"))
}

/// Split `scsi0:1` into its bus, controller and unit.
fn parse_node(node: &str) -> Result<Option<(ControllerKind, u32, u32)>> {
    let Some((controller, unit)) = node.split_once(':') else {
        return Ok(None);
    };
    let Some((kind, number)) = ControllerKind::ALL
        .iter()
        .find_map(|kind| controller.strip_prefix(kind.prefix()).map(|n| (*kind, n)))
    else {
        return Ok(None);
    };
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }
    Ok(Some((
        kind,
        kv::number(FILE, node, number)?,
        kv::number(FILE, node, unit)?,
    )))
}

/// Collect present hard disks from `<bus>N:M.*` keys.
///
/// CD-ROM devices are skipped, and on SCSI only `scsi-hardDisk` devices count;
/// other SCSI units are pass-through devices.
fn extract_disks(raw: &HashMap<String, String>) -> Result<Vec<VmxDisk>> {
    let mut disks = Vec::new();

    for (key, file_name) in raw {
        let Some(node) = key.strip_suffix(".fileName") else {
            continue;
        };
        let Some((kind, controller, unit)) = parse_node(node)? else {
            continue;
        };
        if !is_true(raw, &format!("{}.present", node)) {
            continue;
        }

        let device_type = raw.get(&format!("{}.deviceType", node)).cloned();
        if let Some(device_type) = &device_type {
            if device_type.to_ascii_lowercase().contains("cdrom") {
                continue;
            }
            if kind == ControllerKind::Scsi && device_type != "scsi-hardDisk" {
                continue;
            }
        }
        if !file_name.ends_with(".vmdk") {
            continue;
        }

        disks.push(VmxDisk {
            kind,
            controller,
            unit,
            file_name: file_name.clone(),
            device_type,
        });
    }

    disks.sort_by_key(|d| (d.kind, d.controller, d.unit));
    Ok(disks)
}

fn extract_networks(raw: &HashMap<String, String>) -> Vec<VmxNetwork> {
    let mut names: Vec<&str> = raw
        .keys()
        .filter_map(|key| key.strip_suffix(".present"))
        .filter(|name| {
            name.strip_prefix("ethernet")
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter(|name| is_true(raw, &format!("{}.present", name)))
        .collect();
    names.sort_by_key(|name| name["ethernet".len()..].parse::<u32>().unwrap_or(u32::MAX));

    names
        .into_iter()
        .map(|name| {
            let get = |field: &str| raw.get(&format!("{}.{}", name, field)).cloned();
            VmxNetwork {
                name: name.to_string(),
                virtual_dev: get("virtualDev"),
                network_name: get("networkName"),
                address_type: get("addressType"),
                generated_address: get("generatedAddress"),
                address: get("address"),
            }
        })
        .collect()
}

impl VmxConfig {
    /// A value that must be present.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.raw
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::parse(FILE, format!("missing key {}", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_disks_scsi_hard_disk() {
        let disks = extract_disks(&raw(&[
            ("scsi0:0.present", "TRUE"),
            ("scsi0:0.deviceType", "scsi-hardDisk"),
            ("scsi0:0.fileName", "web.vmdk"),
        ]))
        .unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].node(), "scsi0:0");
        assert_eq!(disks[0].file_name, "web.vmdk");
    }

    #[test]
    fn test_extract_disks_skips_scsi_passthrough_and_cdrom() {
        let disks = extract_disks(&raw(&[
            ("scsi0:1.present", "TRUE"),
            ("scsi0:1.deviceType", "scsi-passthru"),
            ("scsi0:1.fileName", "tape.vmdk"),
            ("ide1:0.present", "TRUE"),
            ("ide1:0.deviceType", "cdrom-image"),
            ("ide1:0.fileName", "install.vmdk"),
            ("sata0:0.present", "TRUE"),
            ("sata0:0.deviceType", "atapi-cdrom"),
            ("sata0:0.fileName", "/vmfs/volumes/iso/ubuntu.iso"),
        ]))
        .unwrap();
        assert!(disks.is_empty());
    }

    #[test]
    fn test_extract_disks_orders_by_node() {
        let disks = extract_disks(&raw(&[
            ("nvme0:0.present", "TRUE"),
            ("nvme0:0.fileName", "c.vmdk"),
            ("scsi1:0.present", "TRUE"),
            ("scsi1:0.fileName", "b.vmdk"),
            ("scsi0:2.present", "TRUE"),
            ("scsi0:2.fileName", "a.vmdk"),
            ("ide0:0.present", "TRUE"),
            ("ide0:0.fileName", "d.vmdk"),
        ]))
        .unwrap();
        let nodes: Vec<_> = disks.iter().map(VmxDisk::node).collect();
        assert_eq!(nodes, ["ide0:0", "scsi0:2", "scsi1:0", "nvme0:0"]);
    }

    #[test]
    fn test_extract_disks_skips_not_present() {
        let disks = extract_disks(&raw(&[
            ("scsi0:0.present", "FALSE"),
            ("scsi0:0.fileName", "disk.vmdk"),
        ]))
        .unwrap();
        assert!(disks.is_empty());
    }

    #[test]
    fn test_bad_unit_number_is_an_error() {
        let result = extract_disks(&raw(&[
            ("scsi0:x.present", "TRUE"),
            ("scsi0:x.fileName", "disk.vmdk"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_extract_networks() {
        let networks = extract_networks(&raw(&[
            ("ethernet10.present", "TRUE"),
            ("ethernet10.addressType", "static"),
            ("ethernet10.address", "00:50:56:00:00:0a"),
            ("ethernet2.present", "TRUE"),
            ("ethernet2.networkName", "VM Network"),
            ("ethernet2.addressType", "generated"),
            ("ethernet2.generatedAddress", "00:0c:29:aa:bb:cc"),
            ("ethernet3.present", "FALSE"),
        ]));
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].name, "ethernet2");
        assert!(networks[0].is_generated());
        assert_eq!(networks[0].mac_address(), Some("00:0c:29:aa:bb:cc"));
        assert_eq!(networks[0].network_name.as_deref(), Some("VM Network"));
        assert_eq!(networks[1].name, "ethernet10");
        assert!(!networks[1].is_generated());
        assert_eq!(networks[1].mac_address(), Some("00:50:56:00:00:0a"));
    }

    #[test]
    fn test_parse_vmx_full() {
        let content = r#"
.encoding = "UTF-8"
displayName = "web|2d01"
guestOS = "ubuntu-64"
memsize = "4096"
numvcpus = "2"
firmware = "efi"
scsi0.virtualDev = "pvscsi"
scsi0:0.present = "TRUE"
scsi0:0.deviceType = "scsi-hardDisk"
scsi0:0.fileName = "web.vmdk"
ethernet0.present = "TRUE"
"#;
        let config = parse_vmx(content).unwrap();
        assert_eq!(config.display_name.as_deref(), Some("web-01"));
        assert_eq!(config.memory_mb, Some(4096));
        assert_eq!(config.num_cpus, Some(2));
        assert_eq!(config.firmware.as_deref(), Some("efi"));
        assert_eq!(config.disks.len(), 1);
        assert_eq!(config.networks.len(), 1);
        assert_eq!(config.require("guestOS").unwrap(), "ubuntu-64");
        assert!(config.require("nvram").is_err());
    }

    #[test]
    fn test_parse_vmx_rejects_bad_memsize() {
        assert!(parse_vmx("memsize = \"lots\"").is_err());
    }
}
