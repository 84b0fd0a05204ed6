//! VMDK disk handling.
//!
//! Descriptor parsing for the text side of a disk and a block adapter that
//! reads stream-optimized extents through any [`RangeReader`].

pub mod adapter;
pub mod descriptor;
pub mod header;
pub mod pipeline;
pub mod reader;

pub use adapter::{StreamOptimizedDisk, TargetBlock, BLOCK_BITMAP_SIZE, BLOCK_SIZE};
pub use descriptor::{parse_descriptor, Extent, ExtentType, Geometry, VmdkDescriptor, NO_PARENT};
pub use header::{SparseHeader, SECTOR_SIZE, VMDK_MAGIC};
pub use pipeline::{BlockPipeline, PipelineConfig};
pub use reader::{FileRangeReader, RangeReader};
