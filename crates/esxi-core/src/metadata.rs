//! VM descriptors assembled from property data and datastore files.
//!
//! A transferable descriptor combines the `VirtualMachine` properties with
//! the VMX, every disk descriptor it references and, when present, the VMSD
//! snapshot database.

use serde::Serialize;

use crate::client::Esxi;
use crate::collector::{PropertyMap, PropertyValue};
use crate::error::{Error, Result};
use crate::http::HttpBackend;
use crate::moref::ManagedObjectRef;
use crate::soap::{Transport, XmlNode};
use crate::vmdk::{parse_descriptor, VmdkDescriptor};
use crate::vmsd::parse_vmsd;
use crate::vmx::parse_vmx;

const VM_PROPERTIES: [&str; 5] = ["name", "config", "storage", "runtime", "snapshot"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    Bios,
    Uefi,
}

impl Firmware {
    fn parse(value: Option<&str>) -> Result<Self> {
        match value {
            None | Some("bios") => Ok(Firmware::Bios),
            Some("efi") => Ok(Firmware::Uefi),
            Some(other) => Err(Error::parse("VM config", format!("unknown firmware '{}'", other))),
        }
    }
}

/// Space used and reserved across all datastores, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    pub used: u64,
    pub free: u64,
}

/// Usage on one datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatastoreUsage {
    pub datastore: String,
    pub committed: u64,
    pub uncommitted: u64,
}

/// A datastore and the mount URL files on it are addressed by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatastoreInfo {
    pub name: String,
    /// Mount path with the `ds://` scheme and trailing slash removed.
    pub url: String,
}

impl DatastoreInfo {
    pub fn new(name: impl Into<String>, url: &str) -> Self {
        let url = url.strip_prefix("ds://").unwrap_or(url);
        Self {
            name: name.into(),
            url: url.trim_end_matches('/').to_string(),
        }
    }

    /// Alternative mount path naming the datastore instead of its uuid.
    fn named_url(&self) -> String {
        format!("/vmfs/volumes/{}", self.name)
    }
}

/// A file on a datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskLocation {
    pub datastore: String,
    /// Path relative to the datastore root.
    pub path: String,
}

impl DiskLocation {
    /// Directory of the file, empty at the datastore root.
    pub fn directory(&self) -> &str {
        self.path.rsplit_once('/').map_or("", |(dir, _)| dir)
    }
}

/// A disk with its parsed descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmDisk {
    /// Device node such as `scsi0:0`.
    pub node: String,
    pub location: DiskLocation,
    pub capacity: u64,
    pub descriptor: VmdkDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkAdapter {
    pub label: Option<String>,
    pub mac_address: Option<String>,
    pub is_generated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub uid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub description: String,
    /// Microseconds since the Unix epoch.
    pub create_time: Option<i64>,
    pub disks: Vec<VmDisk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotTree {
    pub current: Option<u32>,
    pub snapshots: Vec<Snapshot>,
}

/// Everything needed to recreate a VM elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmDescriptor {
    pub id: String,
    pub name_label: String,
    /// Memory in bytes.
    pub memory: u64,
    pub n_cpus: u32,
    pub firmware: Firmware,
    pub power_state: String,
    pub storage: StorageUsage,
    pub per_datastore: Vec<DatastoreUsage>,
    pub disks: Vec<VmDisk>,
    pub networks: Vec<NetworkAdapter>,
    /// `None` when the VM has no snapshot database.
    pub snapshots: Option<SnapshotTree>,
}

/// Property-only view of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmSummary {
    pub id: String,
    pub name_label: String,
    pub memory: u64,
    pub n_cpus: u32,
    pub firmware: Firmware,
    pub power_state: String,
    pub storage: StorageUsage,
}

/// Split `[datastore] dir/vm.vmx` into datastore and path.
pub fn parse_vm_path_name(vm_path_name: &str) -> Result<(String, String)> {
    let invalid = || Error::parse("vmPathName", format!("unexpected value '{}'", vm_path_name));
    let rest = vm_path_name.strip_prefix('[').ok_or_else(invalid)?;
    let (datastore, path) = rest.split_once("] ").ok_or_else(invalid)?;
    if path.len() <= ".vmx".len() || !path.ends_with(".vmx") {
        return Err(invalid());
    }
    Ok((datastore.to_string(), path.to_string()))
}

/// Locate a disk file named in a VMX or VMSD.
///
/// Relative names live next to the VMX. Absolute names are matched against
/// the datastore mount paths; the longest matching mount wins.
pub fn resolve_disk_location(
    datastores: &[DatastoreInfo],
    current_datastore: &str,
    vmx_directory: &str,
    file_name: &str,
) -> Result<DiskLocation> {
    if !file_name.starts_with('/') {
        let path = if vmx_directory.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", vmx_directory, file_name)
        };
        return Ok(DiskLocation {
            datastore: current_datastore.to_string(),
            path,
        });
    }

    datastores
        .iter()
        .flat_map(|ds| [(ds, ds.url.clone()), (ds, ds.named_url())])
        .filter_map(|(ds, mount)| {
            let rest = file_name.strip_prefix(mount.as_str())?.strip_prefix('/')?;
            Some((mount.len(), ds, rest))
        })
        .max_by_key(|(len, _, _)| *len)
        .map(|(_, ds, rest)| DiskLocation {
            datastore: ds.name.clone(),
            path: rest.to_string(),
        })
        .ok_or_else(|| Error::not_found(format!("datastore holding {}", file_name)))
}

fn prop<'a>(props: &'a PropertyMap, name: &str, vm: &str) -> Result<&'a XmlNode> {
    props
        .get(name)
        .and_then(PropertyValue::as_node)
        .ok_or_else(|| Error::not_found(format!("{} of VM {}", name, vm)))
}

fn text<'a>(node: &'a XmlNode, path: &[&str], vm: &str) -> Result<&'a str> {
    node.text_at(path)
        .ok_or_else(|| Error::not_found(format!("{} of VM {}", path.join("."), vm)))
}

fn number<N: std::str::FromStr>(value: &str, what: &str) -> Result<N> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::parse("VM properties", format!("invalid {}: '{}'", what, value)))
}

fn per_datastore_usage(storage: &XmlNode) -> Result<Vec<DatastoreUsage>> {
    storage
        .children_named("perDatastoreUsage")
        .map(|usage| {
            Ok(DatastoreUsage {
                datastore: usage.text_at(&["datastore"]).unwrap_or_default().to_string(),
                committed: number(usage.text_at(&["committed"]).unwrap_or("0"), "committed")?,
                uncommitted: number(usage.text_at(&["uncommitted"]).unwrap_or("0"), "uncommitted")?,
            })
        })
        .collect()
}

/// Build the property-only summary of one VM.
pub fn summarize(id: &str, props: &PropertyMap) -> Result<VmSummary> {
    let config = prop(props, "config", id)?;
    let runtime = prop(props, "runtime", id)?;
    let storage = props
        .get("storage")
        .and_then(PropertyValue::as_node)
        .ok_or_else(|| Error::not_found(format!("storage of VM {}", id)))?;

    let usage = per_datastore_usage(storage)?;
    let storage = usage.iter().fold(StorageUsage::default(), |acc, ds| StorageUsage {
        used: acc.used + ds.committed,
        free: acc.free + ds.uncommitted,
    });
    let memory_mb: u64 = number(text(config, &["hardware", "memoryMB"], id)?, "memoryMB")?;

    Ok(VmSummary {
        id: id.to_string(),
        name_label: text(config, &["name"], id)?.to_string(),
        memory: memory_mb * 1024 * 1024,
        n_cpus: number(text(config, &["hardware", "numCPU"], id)?, "numCPU")?,
        firmware: Firmware::parse(config.text_at(&["firmware"]))?,
        power_state: text(runtime, &["powerState"], id)?.to_string(),
        storage,
    })
}

impl<T: Transport, B: HttpBackend> Esxi<T, B> {
    /// Summaries of every VM on the host.
    pub fn get_all_vm_metadata(&self) -> Result<Vec<VmSummary>> {
        let vms = self.search("VirtualMachine", &["config", "storage", "runtime"])?;
        let mut summaries = vms
            .iter()
            .map(|(vm, props)| summarize(&vm.value, props))
            .collect::<Result<Vec<_>>>()?;
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    /// Datastores with their mount URLs.
    pub fn list_datastores(&self) -> Result<Vec<DatastoreInfo>> {
        let datastores = self.search("Datastore", &["summary"])?;
        datastores
            .iter()
            .map(|(ds, props)| {
                let summary = props
                    .get("summary")
                    .and_then(PropertyValue::as_node)
                    .ok_or_else(|| Error::not_found(format!("summary of {}", ds)))?;
                let name = summary
                    .text_at(&["name"])
                    .ok_or_else(|| Error::not_found(format!("name of {}", ds)))?;
                let url = summary
                    .text_at(&["url"])
                    .ok_or_else(|| Error::not_found(format!("url of {}", ds)))?;
                Ok(DatastoreInfo::new(name, url))
            })
            .collect()
    }

    /// Full descriptor of `vm_id`, including disks and snapshots.
    pub fn get_transferable_vm_metadata(&self, vm_id: &str) -> Result<VmDescriptor> {
        let vms = self.search("VirtualMachine", &VM_PROPERTIES)?;
        let props = vms
            .get(&ManagedObjectRef::new("VirtualMachine", vm_id))
            .ok_or_else(|| Error::not_found(format!("VM {}", vm_id)))?;
        let summary = summarize(vm_id, props)?;
        let per_datastore = per_datastore_usage(prop(props, "storage", vm_id)?)?;

        let config = prop(props, "config", vm_id)?;
        let (datastore, vmx_path) = parse_vm_path_name(text(config, &["files", "vmPathName"], vm_id)?)?;
        let vmx_directory = vmx_path.rsplit_once('/').map_or("", |(dir, _)| dir);

        let vmx = parse_vmx(&self.download_text(&datastore, &vmx_path)?)?;
        let datastores = self.list_datastores()?;
        tracing::debug!(vm = vm_id, %datastore, %vmx_path, disks = vmx.disks.len(), "parsed VMX");

        let inspect = |node: String, file_name: &str| -> Result<VmDisk> {
            let location = resolve_disk_location(&datastores, &datastore, vmx_directory, file_name)?;
            let descriptor = parse_descriptor(&self.download_text(&location.datastore, &location.path)?)?;
            Ok(VmDisk {
                node,
                capacity: descriptor.capacity_bytes(),
                location,
                descriptor,
            })
        };

        let disks = vmx
            .disks
            .iter()
            .map(|disk| inspect(disk.node(), &disk.file_name))
            .collect::<Result<Vec<_>>>()?;

        let networks = vmx
            .networks
            .iter()
            .map(|net| NetworkAdapter {
                label: net.network_name.clone(),
                mac_address: net.mac_address().map(str::to_string),
                is_generated: net.is_generated(),
            })
            .collect();

        let vmsd_path = format!("{}.vmsd", vmx_path.trim_end_matches(".vmx"));
        let snapshots = match self.download_optional_text(&datastore, &vmsd_path)? {
            Some(content) => {
                let vmsd = parse_vmsd(&content)?;
                let snapshots = vmsd
                    .snapshots
                    .into_iter()
                    .map(|snapshot| {
                        let disks = snapshot
                            .disks
                            .iter()
                            .map(|disk| inspect(disk.node.clone(), &disk.file_name))
                            .collect::<Result<Vec<_>>>()?;
                        Ok(Snapshot {
                            uid: snapshot.uid,
                            parent: snapshot.parent,
                            name: snapshot.display_name,
                            description: snapshot.description,
                            create_time: snapshot.create_time,
                            disks,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Some(SnapshotTree {
                    current: vmsd.current,
                    snapshots,
                })
            }
            None => {
                tracing::debug!(vm = vm_id, %vmsd_path, "no snapshot database");
                None
            }
        };

        Ok(VmDescriptor {
            id: summary.id,
            name_label: summary.name_label,
            memory: summary.memory,
            n_cpus: summary.n_cpus,
            firmware: summary.firmware,
            power_state: summary.power_state,
            storage: summary.storage,
            per_datastore,
            disks,
            networks,
            snapshots,
        })
    }
}
