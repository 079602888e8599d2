//! Partitioning of one direction's shared memory region.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────┬─────────────────────────────────────┐
//! │          ICMsg area          │             Blocks area             │
//! │  pbuf: rd_idx | wr_idx | data│  block_size × block_count           │
//! └──────────────────────────────┴─────────────────────────────────────┘
//! ▲ region start rounded up to ALIGN           region end rounded down ▲
//! ```
//!
//! Both cores run the same computation over the same two regions, so they
//! agree on every boundary without exchanging any geometry.

use crate::control::CONTROL_MESSAGE_SIZE;
use crate::error::IcbError;
use crate::pbuf::{PBUF_PACKET_LEN_SZ, pbuf_header_overhead, round_down, round_up};
use icbmsg_shm::ShmView;

/// Alignment of region boundaries and block sizes.
pub const CACHE_ALIGNMENT: usize = 4;

/// Ring bytes taken by one control message, length slot included.
pub const BYTES_PER_ICMSG_MESSAGE: usize =
    round_up(CONTROL_MESSAGE_SIZE, CACHE_ALIGNMENT) + PBUF_PACKET_LEN_SZ;

/// Cursors plus two messages of slack.
pub const ICMSG_BUFFER_OVERHEAD: usize =
    pbuf_header_overhead(CACHE_ALIGNMENT) + 2 * BYTES_PER_ICMSG_MESSAGE;

/// String each core sends as its very first packet after (re)start.
///
/// ASCII `"Em1l1K0rn3li4"`.
pub const MAGIC: [u8; 13] = [
    0x45, 0x6d, 0x31, 0x6c, 0x31, 0x4b, 0x30, 0x72, 0x6e, 0x33, 0x6c, 0x69, 0x34,
];

/// Smallest ICMsg area for the given block counts.
///
/// Large enough for a data message per local block and a release message per
/// remote block, so the control path cannot run out of ring space while
/// blocks are available.
pub const fn icmsg_min_size(local_blocks: usize, remote_blocks: usize) -> usize {
    ICMSG_BUFFER_OVERHEAD + BYTES_PER_ICMSG_MESSAGE * (local_blocks + remote_blocks)
}

/// Boundaries of one direction's region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    /// Bytes from the aligned region start to the first block.
    pub icmsg_size: usize,
    pub block_size: usize,
    pub block_count: usize,
}

impl RegionLayout {
    /// Splits `region_size` aligned bytes between the ICMsg area and
    /// `local_blocks` evenly sized blocks. `remote_blocks` is the block count
    /// of the opposite direction, whose release messages travel here.
    pub fn compute(
        region_size: usize,
        local_blocks: usize,
        remote_blocks: usize,
    ) -> Result<Self, IcbError> {
        if !(1..=256).contains(&local_blocks) || !(1..=256).contains(&remote_blocks) {
            return Err(IcbError::Config("block counts must be within 1..=256"));
        }
        let min = icmsg_min_size(local_blocks, remote_blocks);
        let Some(spare) = region_size.checked_sub(min) else {
            return Err(IcbError::Config("region too small for the ICMsg area"));
        };
        let block_size = round_down(spare / local_blocks, CACHE_ALIGNMENT);
        if block_size <= crate::blocks::BLOCK_HEADER_SIZE {
            return Err(IcbError::Config("region too small for the requested blocks"));
        }
        Ok(Self {
            icmsg_size: region_size - block_size * local_blocks,
            block_size,
            block_count: local_blocks,
        })
    }
}

/// Narrows a region to its start rounded up and end rounded down to
/// [`CACHE_ALIGNMENT`].
pub fn aligned_window(region: &ShmView) -> Result<ShmView, IcbError> {
    let start = region.addr();
    let end = start + region.len();
    let aligned_start = round_up(start, CACHE_ALIGNMENT);
    let aligned_end = round_down(end, CACHE_ALIGNMENT);
    if aligned_end <= aligned_start {
        return Err(IcbError::Config("region empty after alignment"));
    }
    Ok(region.subview(aligned_start - start, aligned_end - aligned_start)?)
}

/// A region split into its ICMsg and blocks areas.
#[derive(Debug, Clone)]
pub struct RegionSplit {
    pub layout: RegionLayout,
    pub icmsg: ShmView,
    pub blocks: ShmView,
}

impl RegionSplit {
    pub fn new(region: &ShmView, local_blocks: usize, remote_blocks: usize) -> Result<Self, IcbError> {
        let window = aligned_window(region)?;
        let layout = RegionLayout::compute(window.len(), local_blocks, remote_blocks)?;
        let (icmsg, blocks) = window.split_at(layout.icmsg_size)?;
        Ok(Self {
            layout,
            icmsg,
            blocks,
        })
    }
}
