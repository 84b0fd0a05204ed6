//! VMDK descriptor file parsing.
//!
//! A descriptor names the extents holding the disk data, the parent of a
//! delta disk and the disk geometry.

use crate::error::{Error, Result};
use crate::kv::{self, Line};
use serde::Serialize;

const FILE: &str = "VMDK descriptor";

/// `parentCID` of a disk without a parent.
pub const NO_PARENT: u32 = 0xFFFF_FFFF;

/// The type of a VMDK extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtentType {
    Flat,
    Sparse,
    Zero,
    Vmfs,
    VmfsSparse,
    VmfsRdm,
    VmfsRaw,
    SeSparse,
}

impl ExtentType {
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "FLAT" => Ok(ExtentType::Flat),
            "SPARSE" => Ok(ExtentType::Sparse),
            "ZERO" => Ok(ExtentType::Zero),
            "VMFS" => Ok(ExtentType::Vmfs),
            "VMFSSPARSE" => Ok(ExtentType::VmfsSparse),
            "VMFSRDM" => Ok(ExtentType::VmfsRdm),
            "VMFSRAW" => Ok(ExtentType::VmfsRaw),
            "SESPARSE" => Ok(ExtentType::SeSparse),
            _ => Err(Error::parse(FILE, format!("unknown extent type: {}", s))),
        }
    }
}

/// One extent line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Extent {
    /// `RW`, `RDONLY` or `NOACCESS`.
    pub access: String,
    pub size_sectors: u64,
    pub extent_type: ExtentType,
    /// Extent file; absent for `ZERO` extents.
    pub filename: Option<String>,
    pub offset: u64,
}

/// Disk geometry from the disk database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub cylinders: u64,
    pub heads: u32,
    pub sectors: u32,
}

/// Parsed VMDK descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmdkDescriptor {
    pub version: u32,
    /// Content id, changes on every write.
    pub cid: u32,
    /// Content id of the parent, [`NO_PARENT`] for a base disk.
    pub parent_cid: u32,
    /// e.g. `vmfs`, `vmfsSparse`, `streamOptimized`.
    pub create_type: String,
    pub parent_file_name_hint: Option<String>,
    pub extents: Vec<Extent>,
    pub geometry: Geometry,
    pub adapter_type: Option<String>,
    pub uuid: Option<String>,
    pub hw_version: Option<String>,
}

impl VmdkDescriptor {
    /// Virtual size in sectors.
    pub fn capacity_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.size_sectors).sum()
    }

    /// Virtual size in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors() * 512
    }

    /// True for a base disk, false for a delta on top of a parent.
    pub fn is_full(&self) -> bool {
        self.parent_cid == NO_PARENT
    }

    /// The first extent file, which holds the data of single-extent disks.
    pub fn data_file(&self) -> Option<&str> {
        self.extents.iter().find_map(|e| e.filename.as_deref())
    }
}

/// Parse a VMDK descriptor from its text content.
///
/// # Errors
///
/// Returns an error for unknown line shapes, bad numbers, a malformed extent
/// line or a missing `createType`.
pub fn parse_descriptor(content: &str) -> Result<VmdkDescriptor> {
    let mut version = 1;
    let mut cid = 0u32;
    let mut parent_cid = NO_PARENT;
    let mut create_type = None;
    let mut parent_file_name_hint = None;
    let mut extents = Vec::new();
    let mut geometry = Geometry::default();
    let mut adapter_type = None;
    let mut uuid = None;
    let mut hw_version = None;

    for (number, line) in content.lines().enumerate() {
        let (key, value) = match kv::classify(line) {
            Line::Blank => continue,
            Line::Other(text) if is_extent_line(text) => {
                extents.push(parse_extent_line(text)?);
                continue;
            }
            Line::Other(text) => {
                return Err(Error::parse(
                    FILE,
                    format!("line {}: unexpected '{}'", number + 1, text),
                ))
            }
            Line::Entry { key, value } => (key, value),
        };

        match key {
            "version" => version = kv::number(FILE, key, &value)?,
            "CID" => cid = parse_hex(key, &value)?,
            "parentCID" => parent_cid = parse_hex(key, &value)?,
            "createType" => create_type = Some(value),
            "parentFileNameHint" => parent_file_name_hint = Some(value),
            "ddb.virtualHWVersion" => hw_version = Some(value),
            "ddb.geometry.cylinders" => geometry.cylinders = kv::number(FILE, key, &value)?,
            "ddb.geometry.heads" => geometry.heads = kv::number(FILE, key, &value)?,
            "ddb.geometry.sectors" => geometry.sectors = kv::number(FILE, key, &value)?,
            "ddb.adapterType" => adapter_type = Some(value),
            "ddb.uuid" => uuid = Some(value),
            _ => {}
        }
    }

    let create_type = create_type.ok_or_else(|| Error::parse(FILE, "missing createType"))?;

    Ok(VmdkDescriptor {
        version,
        cid,
        parent_cid,
        create_type,
        parent_file_name_hint,
        extents,
        geometry,
        adapter_type,
        uuid,
        hw_version,
    })
}

fn parse_hex(key: &str, value: &str) -> Result<u32> {
    u32::from_str_radix(value, 16)
        .map_err(|_| Error::parse(FILE, format!("invalid {}: {}", key, value)))
}

fn is_extent_line(line: &str) -> bool {
    ["RW ", "RDONLY ", "NOACCESS "]
        .iter()
        .any(|access| line.starts_with(access))
}

/// Parse an extent line like `RW 838860800 VMFS "web-flat.vmdk" 0`.
fn parse_extent_line(line: &str) -> Result<Extent> {
    let invalid = || Error::parse(FILE, format!("invalid extent line: {}", line));

    let mut parts = line.splitn(4, char::is_whitespace).filter(|p| !p.is_empty());
    let access = parts.next().ok_or_else(invalid)?.to_string();
    let size_sectors: u64 = parts
        .next()
        .ok_or_else(invalid)?
        .parse()
        .map_err(|_| invalid())?;
    let extent_type = ExtentType::from_str(parts.next().ok_or_else(invalid)?)?;
    let rest = parts.next().unwrap_or("").trim();

    if rest.is_empty() {
        if extent_type != ExtentType::Zero {
            return Err(invalid());
        }
        return Ok(Extent {
            access,
            size_sectors,
            extent_type,
            filename: None,
            offset: 0,
        });
    }

    let (filename, offset) = parse_quoted_filename_and_offset(rest)?;
    let offset = if offset.is_empty() {
        0
    } else {
        offset.parse().map_err(|_| invalid())?
    };

    Ok(Extent {
        access,
        size_sectors,
        extent_type,
        filename: Some(filename),
        offset,
    })
}

/// Parse `"file name.vmdk" 128` into the unquoted name and the rest.
fn parse_quoted_filename_and_offset(s: &str) -> Result<(String, &str)> {
    let inner = s
        .strip_prefix('"')
        .ok_or_else(|| Error::parse(FILE, format!("expected quoted filename, got: {}", s)))?;
    let end = inner
        .find('"')
        .ok_or_else(|| Error::parse(FILE, format!("unclosed quote in: {}", s)))?;
    Ok((inner[..end].to_string(), inner[end + 1..].trim()))
}
