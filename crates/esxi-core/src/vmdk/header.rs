//! Stream-optimized sparse extent header.
//!
//! A stream-optimized VMDK starts with a header whose grain directory offset
//! is the `GD_AT_END` sentinel, because the directory is only known once the
//! whole disk has been written. The complete header is repeated in the footer
//! inside the last 1024 bytes of the file:
//!
//! ```text
//! ... | footer marker (512) | footer header (512) | end-of-stream marker (512)
//!                           ^ file size - 1024
//! ```

use crate::error::{Error, Result};

/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// VMDK sparse extent magic number ("KDMV" in little-endian).
pub const VMDK_MAGIC: u32 = 0x564D444B;

/// Size of the trailing window that holds the footer header.
pub const FOOTER_WINDOW: u64 = 1024;

/// Size of the prefix of every grain record: LBA (8 bytes) + payload size (4 bytes).
pub const GRAIN_MARKER_SIZE: usize = 12;

/// Grain directory offset placeholder used by the leading header.
pub const GD_AT_END: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Deflate compression, the only algorithm stream-optimized extents use.
pub const COMPRESSION_DEFLATE: u16 = 1;

pub const FLAG_VALID_NEWLINE: u32 = 1 << 0;
pub const FLAG_REDUNDANT_GRAIN_TABLE: u32 = 1 << 1;
pub const FLAG_COMPRESSED: u32 = 1 << 16;
pub const FLAG_MARKERS: u32 = 1 << 17;

/// Parsed sparse extent header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
    pub version: u32,
    pub flags: u32,
    /// Virtual capacity in sectors.
    pub capacity: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    pub rgd_offset: u64,
    /// Grain directory offset in sectors.
    pub gd_offset: u64,
    pub overhead: u64,
    pub compress_algorithm: u16,
}

fn le_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn le_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

impl SparseHeader {
    /// Parse a header from the first sector of `data`.
    ///
    /// Only the layout is decoded here; see [`SparseHeader::validate_stream_optimized`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SECTOR_SIZE as usize {
            return Err(Error::vmdk(format!(
                "sparse header too short: {} bytes",
                data.len()
            )));
        }

        let magic = le_u32(data, 0);
        if magic != VMDK_MAGIC {
            return Err(Error::vmdk(format!(
                "invalid VMDK magic: expected 0x{:X}, got 0x{:X}",
                VMDK_MAGIC, magic
            )));
        }

        Ok(Self {
            version: le_u32(data, 4),
            flags: le_u32(data, 8),
            capacity: le_u64(data, 12),
            grain_size: le_u64(data, 20),
            descriptor_offset: le_u64(data, 28),
            descriptor_size: le_u64(data, 36),
            num_gtes_per_gt: le_u32(data, 44),
            rgd_offset: le_u64(data, 48),
            gd_offset: le_u64(data, 56),
            overhead: le_u64(data, 64),
            // singleEndLineChar..doubleEndLineChar2 occupy 73..77
            compress_algorithm: le_u16(data, 77),
        })
    }

    /// Reject headers this adapter cannot address in `block_size` units.
    pub fn validate_stream_optimized(&self, block_size: usize) -> Result<()> {
        if self.version > 3 {
            return Err(Error::vmdk(format!(
                "unsupported sparse VMDK version: {}",
                self.version
            )));
        }
        if !self.is_compressed() || !self.has_markers() {
            return Err(Error::vmdk(format!(
                "not a stream-optimized extent (flags 0x{:08X})",
                self.flags
            )));
        }
        if self.compress_algorithm != COMPRESSION_DEFLATE {
            return Err(Error::vmdk(format!(
                "unsupported compression algorithm: {}",
                self.compress_algorithm
            )));
        }
        if self.gd_offset == 0 || self.gd_offset == GD_AT_END {
            return Err(Error::vmdk(format!(
                "footer has no grain directory offset (0x{:X})",
                self.gd_offset
            )));
        }

        let max_grain_sectors = block_size as u64 / SECTOR_SIZE;
        if self.grain_size == 0 || self.grain_size > max_grain_sectors {
            return Err(Error::vmdk(format!(
                "grain size of {} sectors is outside 1..={}",
                self.grain_size, max_grain_sectors
            )));
        }
        let grain = self.grain_size_bytes()?;
        if block_size as u64 % grain != 0 {
            return Err(Error::vmdk(format!(
                "grain size {} does not divide block size {}",
                grain, block_size
            )));
        }
        let grains_per_block = block_size as u64 / grain;
        if self.num_gtes_per_gt == 0 || self.num_gtes_per_gt as u64 % grains_per_block != 0 {
            return Err(Error::vmdk(format!(
                "grain table of {} entries is not a multiple of {} grains per block",
                self.num_gtes_per_gt, grains_per_block
            )));
        }
        self.capacity_bytes()?;
        self.gd_offset_bytes()?;
        Ok(())
    }

    pub fn is_compressed(&self) -> bool {
        (self.flags & FLAG_COMPRESSED) != 0
    }

    pub fn has_markers(&self) -> bool {
        (self.flags & FLAG_MARKERS) != 0
    }

    /// Grain size in bytes.
    pub fn grain_size_bytes(&self) -> Result<u64> {
        sectors_to_bytes(self.grain_size, "grain size")
    }

    /// Virtual capacity in bytes.
    pub fn capacity_bytes(&self) -> Result<u64> {
        sectors_to_bytes(self.capacity, "capacity")
    }

    /// Byte offset of the grain directory.
    pub fn gd_offset_bytes(&self) -> Result<u64> {
        sectors_to_bytes(self.gd_offset, "grain directory offset")
    }

    /// Sectors addressed by one grain directory entry.
    pub fn sectors_per_directory_slot(&self) -> Result<u64> {
        self.grain_size
            .checked_mul(self.num_gtes_per_gt as u64)
            .ok_or_else(|| {
                Error::vmdk(format!(
                    "grain directory slot overflows: {} sectors x {} entries",
                    self.grain_size, self.num_gtes_per_gt
                ))
            })
    }

    /// Number of grain directory entries.
    pub fn num_gd_entries(&self) -> Result<u64> {
        let per_slot = self.sectors_per_directory_slot()?;
        if per_slot == 0 {
            return Ok(0);
        }
        Ok(self.capacity.div_ceil(per_slot))
    }
}

fn sectors_to_bytes(sectors: u64, field: &str) -> Result<u64> {
    sectors
        .checked_mul(SECTOR_SIZE)
        .ok_or_else(|| Error::vmdk(format!("{} of {} sectors overflows a byte offset", field, sectors)))
}
