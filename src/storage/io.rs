//! Write coalescing for cache flushes.
//!
//! Dirty blocks of a piece are combined into contiguous regions so a flush
//! issues one storage write per run of adjacent blocks instead of one per
//! block.

use std::collections::BTreeMap;
use std::ops::Range;

use bytes::{Bytes, BytesMut};

/// A contiguous region of a piece to write.
#[derive(Debug, Clone)]
pub struct WriteRegion {
    /// Byte offset of the region within the piece.
    pub offset: u32,
    /// The coalesced data to write.
    pub data: Bytes,
    /// Indices of the cache blocks covered by this region.
    pub blocks: Range<usize>,
}

/// Coalesces `(block index, data)` pairs into contiguous write regions.
///
/// Blocks are adjacent when their indices are consecutive and the earlier
/// block is full-sized, so a short trailing block still joins the region
/// before it.
pub fn coalesce_blocks(blocks: Vec<(usize, Bytes)>, block_size: usize) -> Vec<WriteRegion> {
    let sorted: BTreeMap<usize, Bytes> = blocks.into_iter().collect();
    let mut regions = Vec::new();
    let mut run: Vec<Bytes> = Vec::new();
    let mut run_start = 0usize;

    for (index, data) in sorted {
        let can_coalesce = !run.is_empty()
            && index == run_start + run.len()
            && run.last().map(|b| b.len()) == Some(block_size);

        if !can_coalesce && !run.is_empty() {
            regions.push(finish_region(run_start, std::mem::take(&mut run), block_size));
        }
        if run.is_empty() {
            run_start = index;
        }
        run.push(data);
    }

    if !run.is_empty() {
        regions.push(finish_region(run_start, run, block_size));
    }

    regions
}

fn finish_region(start: usize, run: Vec<Bytes>, block_size: usize) -> WriteRegion {
    let blocks = start..start + run.len();
    let data = if run.len() == 1 {
        run.into_iter().next().unwrap_or_default()
    } else {
        let mut buf = BytesMut::with_capacity(run.iter().map(|b| b.len()).sum());
        for block in &run {
            buf.extend_from_slice(block);
        }
        buf.freeze()
    };

    WriteRegion {
        offset: (start * block_size) as u32,
        data,
        blocks,
    }
}
