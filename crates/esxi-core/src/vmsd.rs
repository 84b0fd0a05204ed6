//! VMSD snapshot database parsing.

use crate::error::{Error, Result};
use crate::kv;
use serde::Serialize;
use std::collections::HashMap;

const FILE: &str = "VMSD";

/// A disk captured by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmsdDisk {
    pub file_name: String,
    /// Device node such as `scsi0:0`.
    pub node: String,
}

/// One snapshot entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmsdSnapshot {
    pub uid: u32,
    pub parent: Option<u32>,
    pub file_name: Option<String>,
    pub display_name: String,
    pub description: String,
    /// Creation time in microseconds since the Unix epoch.
    pub create_time: Option<i64>,
    pub disks: Vec<VmsdDisk>,
}

/// Parsed snapshot database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Vmsd {
    /// uid of the snapshot the VM currently runs on.
    pub current: Option<u32>,
    /// Snapshots in file order.
    pub snapshots: Vec<VmsdSnapshot>,
}

/// Parse VMSD content. An empty file yields no snapshots.
pub fn parse_vmsd(content: &str) -> Result<Vmsd> {
    let raw = kv::parse_map(FILE, content)?;
    let get = |key: &str| raw.get(key).map(String::as_str);
    let number = |key: &str| -> Result<Option<u32>> {
        get(key).map(|v| kv::number(FILE, key, v)).transpose()
    };

    let mut indices: Vec<u32> = raw
        .keys()
        .filter_map(|key| key.strip_prefix("snapshot")?.strip_suffix(".uid"))
        .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .map(|n| kv::number(FILE, "snapshot index", n))
        .collect::<Result<_>>()?;
    indices.sort_unstable();

    let mut snapshots = Vec::with_capacity(indices.len());
    for index in indices {
        let prefix = format!("snapshot{}", index);
        let key = |field: &str| format!("{}.{}", prefix, field);

        let uid = number(&key("uid"))?
            .ok_or_else(|| Error::parse(FILE, format!("{} has no uid", prefix)))?;
        let num_disks = number(&key("numDisks"))?.unwrap_or(0);

        let mut disks = Vec::with_capacity(num_disks as usize);
        for disk in 0..num_disks {
            let disk_key = |field: &str| key(&format!("disk{}.{}", disk, field));
            let file_name = get(&disk_key("fileName"))
                .ok_or_else(|| Error::parse(FILE, format!("{} disk {} has no fileName", prefix, disk)))?;
            disks.push(VmsdDisk {
                file_name: file_name.to_string(),
                node: get(&disk_key("node")).unwrap_or_default().to_string(),
            });
        }

        snapshots.push(VmsdSnapshot {
            uid,
            parent: number(&key("parent"))?,
            file_name: get(&key("filename")).map(str::to_string),
            display_name: get(&key("displayName")).unwrap_or_default().to_string(),
            description: get(&key("description")).unwrap_or_default().to_string(),
            create_time: create_time(&raw, &prefix)?,
            disks,
        });
    }

    Ok(Vmsd {
        current: number("snapshot.current")?,
        snapshots,
    })
}

/// Combine `createTimeHigh` and the signed 32-bit `createTimeLow`.
fn create_time(raw: &HashMap<String, String>, prefix: &str) -> Result<Option<i64>> {
    let high = raw.get(&format!("{}.createTimeHigh", prefix));
    let low = raw.get(&format!("{}.createTimeLow", prefix));
    let (Some(high), Some(low)) = (high, low) else {
        return Ok(None);
    };
    let high: i64 = kv::number(FILE, "createTimeHigh", high)?;
    let low: i64 = kv::number(FILE, "createTimeLow", low)?;
    Ok(Some((high << 32) | (low & 0xFFFF_FFFF)))
}
