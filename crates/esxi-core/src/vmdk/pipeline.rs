//! Parallel block reading with in-order delivery.
//!
//! A producer thread reads windows of consecutive blocks on a rayon pool and
//! hands each finished window to the caller through a bounded channel, so at
//! most two windows are held in memory at once. Blocks reach the sink in id
//! order regardless of which worker finished first.

use std::thread;

use crossbeam_channel::{Receiver, Sender};
use rayon::prelude::*;

use super::adapter::{StreamOptimizedDisk, TargetBlock};
use super::reader::RangeReader;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Default number of blocks read per window.
pub const DEFAULT_WINDOW: usize = 16;

type Window = Vec<Result<TargetBlock>>;

/// Configuration for [`BlockPipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Worker threads; 0 lets rayon pick.
    pub threads: usize,
    /// Blocks read in parallel before they are handed to the sink.
    pub window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            window: DEFAULT_WINDOW,
        }
    }
}

impl PipelineConfig {
    pub fn new(threads: usize, window: usize) -> Self {
        Self {
            threads,
            window: window.max(1),
        }
    }
}

/// Reads every block of a disk in parallel.
#[derive(Debug, Clone, Default)]
pub struct BlockPipeline {
    config: PipelineConfig,
}

impl BlockPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> PipelineConfig {
        self.config
    }

    /// Feed every block of `disk` to `sink` in id order.
    ///
    /// Stops at the first read error, sink error or cancellation and returns
    /// it. On success returns the number of blocks delivered.
    pub fn run<R, F>(&self, disk: &StreamOptimizedDisk<R>, cancel: &CancelToken, mut sink: F) -> Result<u32>
    where
        R: RangeReader,
        F: FnMut(TargetBlock) -> Result<()>,
    {
        let count = disk.block_count()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads)
            .build()
            .map_err(|e| Error::pipeline(format!("failed to build thread pool: {}", e)))?;
        let window = self.config.window.max(1) as u32;

        tracing::debug!(path = disk.path(), blocks = count, window, "block pipeline started");

        thread::scope(|scope| {
            let (tx, rx) = crossbeam_channel::bounded::<Window>(1);
            let pool = &pool;
            scope.spawn(move || produce(disk, pool, count, window, cancel, tx));
            drain(rx, &mut sink)
        })
    }
}

fn produce<R: RangeReader>(
    disk: &StreamOptimizedDisk<R>,
    pool: &rayon::ThreadPool,
    count: u32,
    window: u32,
    cancel: &CancelToken,
    tx: Sender<Window>,
) {
    let mut start = 0;
    while start < count {
        if cancel.is_cancelled() {
            let _ = tx.send(vec![Err(Error::Cancelled {
                url: disk.path().to_string(),
            })]);
            return;
        }

        let end = start.saturating_add(window).min(count);
        let blocks: Window = pool.install(|| {
            (start..end)
                .into_par_iter()
                .map(|id| disk.read_block(id))
                .collect()
        });

        // The receiver is gone once the consumer stopped early.
        if tx.send(blocks).is_err() {
            return;
        }
        start = end;
    }
}

/// Consumes `rx` by value so an early return disconnects the producer.
fn drain<F>(rx: Receiver<Window>, sink: &mut F) -> Result<u32>
where
    F: FnMut(TargetBlock) -> Result<()>,
{
    let mut delivered = 0;
    for window in rx {
        for block in window {
            sink(block?)?;
            delivered += 1;
        }
    }
    Ok(delivered)
}
