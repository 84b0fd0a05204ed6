//! Stream-optimized VMDK exposed as fixed-size VHD-style blocks.
//!
//! A block is [`BLOCK_SIZE`] bytes of payload plus a [`BLOCK_BITMAP_SIZE`]
//! byte sector bitmap. With 64 KiB grains and 512-entry grain tables, one
//! block spans 32 grains and one grain table covers 16 blocks.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use flate2::read::ZlibDecoder;

use super::header::{SparseHeader, FOOTER_WINDOW, GRAIN_MARKER_SIZE, SECTOR_SIZE};
use super::reader::RangeReader;
use crate::error::{Error, Result};

/// Payload size of one target block.
pub const BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Size of the per-block sector bitmap.
pub const BLOCK_BITMAP_SIZE: usize = 512;

/// One target block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetBlock {
    pub id: u32,
    /// Sector bitmap; every sector is reported present.
    pub bitmap: [u8; BLOCK_BITMAP_SIZE],
    pub data: Vec<u8>,
}

impl TargetBlock {
    fn zeroed(id: u32) -> Self {
        Self {
            id,
            bitmap: [0xFF; BLOCK_BITMAP_SIZE],
            data: vec![0u8; BLOCK_SIZE],
        }
    }

    /// Bitmap followed by payload, as laid out in a dynamic VHD.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_BITMAP_SIZE + self.data.len());
        out.extend_from_slice(&self.bitmap);
        out.extend_from_slice(&self.data);
        out
    }

    /// True if the payload is all zeros.
    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }
}

type GrainTable = Arc<Vec<u32>>;
type GrainTableSlot = Arc<Mutex<Option<GrainTable>>>;

/// Block adapter over a stream-optimized sparse extent.
///
/// Call [`read_header`](Self::read_header) and
/// [`read_allocation_table`](Self::read_allocation_table) once, then
/// [`read_block`](Self::read_block) from as many threads as needed.
pub struct StreamOptimizedDisk<R> {
    reader: R,
    path: String,
    header: Option<SparseHeader>,
    /// File size captured with the header; every on-disk offset is checked against it.
    extent_size: u64,
    grain_directory: Option<Vec<u32>>,
    grain_tables: Mutex<HashMap<u32, GrainTableSlot>>,
}

impl<R: RangeReader> StreamOptimizedDisk<R> {
    /// Wrap `reader`; `path` only labels errors and logs.
    pub fn new(reader: R, path: impl Into<String>) -> Self {
        Self {
            reader,
            path: path.into(),
            header: None,
            extent_size: 0,
            grain_directory: None,
            grain_tables: Mutex::new(HashMap::new()),
        }
    }

    /// Open an extent and load its header and grain directory.
    pub fn open(reader: R, path: impl Into<String>) -> Result<Self> {
        let mut disk = Self::new(reader, path);
        disk.read_header()?;
        disk.read_allocation_table()?;
        Ok(disk)
    }

    /// Parse the footer header from the trailing window of the file.
    pub fn read_header(&mut self) -> Result<&SparseHeader> {
        let size = self.reader.size()?;
        if size < FOOTER_WINDOW {
            return Err(Error::vmdk(format!(
                "'{}' is {} bytes, too small for a stream-optimized footer",
                self.path, size
            )));
        }

        let mut window = vec![0u8; FOOTER_WINDOW as usize];
        self.reader.read_exact_at(&mut window, size - FOOTER_WINDOW)?;
        let header = SparseHeader::from_bytes(&window)?;
        header.validate_stream_optimized(BLOCK_SIZE)?;

        tracing::debug!(
            path = %self.path,
            capacity = header.capacity_bytes()?,
            grain = header.grain_size_bytes()?,
            gtes = header.num_gtes_per_gt,
            "read footer header"
        );
        self.extent_size = size;
        self.grain_directory = None;
        self.grain_tables.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(self.header.insert(header))
    }

    /// Load the grain directory named by the header.
    pub fn read_allocation_table(&mut self) -> Result<()> {
        let header = self.header()?;
        let entries = header.num_gd_entries()?;
        let offset = header.gd_offset_bytes()?;
        let len = self.check_extent("grain directory", offset, entries.saturating_mul(4))?;

        let mut raw = vec![0u8; len];
        self.reader.read_exact_at(&mut raw, offset)?;
        let directory: Vec<u32> = raw
            .chunks_exact(4)
            .map(|e| u32::from_le_bytes([e[0], e[1], e[2], e[3]]))
            .collect();

        tracing::debug!(path = %self.path, entries, "read grain directory");
        self.grain_directory = Some(directory);
        Ok(())
    }

    /// Label used in errors and logs.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reject a `len`-byte structure at `offset` that does not fit in the file.
    fn check_extent(&self, what: &str, offset: u64, len: u64) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.extent_size => usize::try_from(len)
                .map_err(|_| Error::vmdk(format!("{} of '{}' is too large", what, self.path))),
            _ => Err(Error::vmdk(format!(
                "{} of {} bytes at offset {} lies outside '{}' ({} bytes)",
                what, len, offset, self.path, self.extent_size
            ))),
        }
    }

    fn header(&self) -> Result<SparseHeader> {
        self.header
            .ok_or_else(|| Error::not_ready(format!("read '{}' before its header", self.path)))
    }

    fn directory(&self) -> Result<&[u32]> {
        self.grain_directory.as_deref().ok_or_else(|| {
            Error::not_ready(format!("read '{}' before its grain directory", self.path))
        })
    }

    /// Virtual disk size in bytes.
    pub fn capacity(&self) -> Result<u64> {
        self.header()?.capacity_bytes()
    }

    /// Number of target blocks covering the capacity.
    pub fn block_count(&self) -> Result<u32> {
        let count = self.capacity()?.div_ceil(BLOCK_SIZE as u64);
        u32::try_from(count)
            .map_err(|_| Error::vmdk(format!("'{}' has too many blocks: {}", self.path, count)))
    }

    /// Grains in one block and blocks covered by one grain table.
    fn geometry(&self, header: &SparseHeader) -> Result<(u32, u32)> {
        let grains_per_block = (BLOCK_SIZE as u64 / header.grain_size_bytes()?) as u32;
        let blocks_per_gt = header.num_gtes_per_gt / grains_per_block;
        Ok((grains_per_block, blocks_per_gt))
    }

    fn check_block(&self, id: u32) -> Result<()> {
        let count = self.block_count()?;
        if id >= count {
            return Err(Error::BlockOutOfRange {
                path: self.path.clone(),
                block: id,
                count,
            });
        }
        Ok(())
    }

    /// Grain table for `id`, or `None` when the block is unallocated.
    fn grain_table_for_block(&self, header: &SparseHeader, id: u32) -> Result<Option<(GrainTable, usize)>> {
        let (grains_per_block, blocks_per_gt) = self.geometry(header)?;
        let gt_index = id / blocks_per_gt;
        let first = ((id % blocks_per_gt) * grains_per_block) as usize;

        let directory = self.directory()?;
        let gt_sector = match directory.get(gt_index as usize) {
            Some(&sector) if sector != 0 => sector,
            _ => return Ok(None),
        };
        let table = self.grain_table(header, gt_index, gt_sector)?;
        Ok(Some((table, first)))
    }

    /// Fetch a grain table, at most once per index.
    fn grain_table(&self, header: &SparseHeader, index: u32, sector: u32) -> Result<GrainTable> {
        let slot = {
            let mut tables = self.grain_tables.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(tables.entry(index).or_default())
        };

        // Holding the slot lock keeps concurrent readers of this index waiting on one fetch.
        let mut cached = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(table) = cached.as_ref() {
            return Ok(Arc::clone(table));
        }

        let offset = sector as u64 * SECTOR_SIZE;
        let len = self.check_extent("grain table", offset, header.num_gtes_per_gt as u64 * 4)?;
        let mut raw = vec![0u8; len];
        self.reader.read_exact_at(&mut raw, offset)?;
        let table: GrainTable = Arc::new(
            raw.chunks_exact(4)
                .map(|e| u32::from_le_bytes([e[0], e[1], e[2], e[3]]))
                .collect(),
        );
        tracing::trace!(path = %self.path, index, sector, "loaded grain table");

        *cached = Some(Arc::clone(&table));
        Ok(table)
    }

    /// True if any grain of block `id` is stored in the extent.
    pub fn is_block_allocated(&self, id: u32) -> Result<bool> {
        let header = self.header()?;
        self.check_block(id)?;
        let (grains_per_block, _) = self.geometry(&header)?;
        Ok(match self.grain_table_for_block(&header, id)? {
            None => false,
            Some((table, first)) => table[first..first + grains_per_block as usize]
                .iter()
                .any(|&entry| entry != 0),
        })
    }

    /// Assemble block `id` from its grains.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::BlockOutOfRange`] past the end of the disk and with
    /// [`Error::GrainSize`] when a grain does not inflate to exactly one grain.
    pub fn read_block(&self, id: u32) -> Result<TargetBlock> {
        let header = self.header()?;
        self.check_block(id)?;

        let mut block = TargetBlock::zeroed(id);
        let Some((table, first)) = self.grain_table_for_block(&header, id)? else {
            return Ok(block);
        };

        let (grains_per_block, _) = self.geometry(&header)?;
        let grain_bytes = header.grain_size_bytes()? as usize;
        for (i, &entry) in table[first..first + grains_per_block as usize].iter().enumerate() {
            if entry == 0 {
                continue;
            }
            let grain = self.read_grain(entry as u64 * SECTOR_SIZE, grain_bytes)?;
            block.data[i * grain_bytes..(i + 1) * grain_bytes].copy_from_slice(&grain);
        }

        Ok(block)
    }

    /// Read and inflate the grain record at `offset`.
    fn read_grain(&self, offset: u64, grain_bytes: usize) -> Result<Vec<u8>> {
        let mut prefix = [0u8; GRAIN_MARKER_SIZE];
        self.reader.read_exact_at(&mut prefix, offset)?;
        let size = u32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]) as u64;

        // deflate may expand incompressible input slightly
        let limit = (grain_bytes + grain_bytes / 8 + 1024) as u64;
        if size > limit {
            return Err(Error::vmdk(format!(
                "grain at offset {} in '{}' claims {} compressed bytes, limit is {}",
                offset, self.path, size, limit
            )));
        }
        let payload = offset + GRAIN_MARKER_SIZE as u64;
        let len = self.check_extent("grain payload", payload, size)?;

        let mut compressed = vec![0u8; len];
        self.reader.read_exact_at(&mut compressed, payload)?;

        // One byte past a grain is enough to detect an oversized payload.
        let mut grain = Vec::with_capacity(grain_bytes);
        ZlibDecoder::new(compressed.as_slice())
            .take(grain_bytes as u64 + 1)
            .read_to_end(&mut grain)
            .map_err(|e| {
                Error::vmdk(format!(
                    "failed to inflate grain at offset {} in '{}': {}",
                    offset, self.path, e
                ))
            })?;

        if grain.len() != grain_bytes {
            return Err(Error::GrainSize {
                path: self.path.clone(),
                offset,
                expected: grain_bytes,
                actual: grain.len(),
            });
        }
        Ok(grain)
    }
}
