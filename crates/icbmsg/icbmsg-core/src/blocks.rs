//! Blocks area: fixed-size, index-addressed data buffers.
//!
//! A buffer spans one or more consecutive blocks. Its first block starts with
//! a 4-byte native-endian header holding the data size; the data follows.
//!
//! ```text
//! ┌───────────┬───────────┬───────────┬─   ─┬─────────────┐
//! │  Block 0  │  Block 1  │  Block 2  │ ... │  Block N-1  │
//! └───────────┴───────────┴───────────┴─   ─┴─────────────┘
//!       │
//!       ▼
//! ┌──────┬────────────────────────────┬─────────┐
//! │ size │ data[size] ...             │ padding │
//! └──────┴────────────────────────────┴─────────┘
//! ```
//!
//! Only the side that sends into a blocks area allocates from it, using a
//! bitset it keeps privately. The receiving side reads buffers by index and
//! reports them back for release. Headers live in memory both sides can
//! write, so every size read from one is validated before use.

use crate::bitset::Bitset;
use crate::error::IcbError;
use icbmsg_shm::ShmView;
use tracing::{debug, warn};

/// Size of the header (size field) of a buffer's first block.
pub const BLOCK_HEADER_SIZE: usize = 4;

/// Geometry of one direction's blocks area.
#[derive(Debug, Clone)]
pub struct BlockChannel {
    blocks: ShmView,
    block_size: usize,
    block_count: usize,
}

impl BlockChannel {
    pub fn new(blocks: ShmView, block_size: usize, block_count: usize) -> Result<Self, IcbError> {
        if block_size <= BLOCK_HEADER_SIZE || block_size % BLOCK_HEADER_SIZE != 0 {
            return Err(IcbError::Config("block size must be aligned and exceed the header"));
        }
        if block_count == 0 || block_count > crate::bitset::MAX_BITS {
            return Err(IcbError::Config("block count must be within 1..=256"));
        }
        let blocks = blocks.subview(0, block_size * block_count)?;
        Ok(Self {
            blocks,
            block_size,
            block_count,
        })
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Start address of the blocks area.
    #[inline]
    pub fn addr(&self) -> usize {
        self.blocks.addr()
    }

    /// Bytes covered by all blocks.
    #[inline]
    pub fn allocable_size(&self) -> usize {
        self.block_count * self.block_size
    }

    /// Blocks needed for a buffer of `size` data bytes. Saturates for sizes
    /// no blocks area could hold.
    #[inline]
    pub fn blocks_for(&self, size: usize) -> usize {
        size.saturating_add(BLOCK_HEADER_SIZE).div_ceil(self.block_size)
    }

    #[inline]
    fn block_offset(&self, index: usize) -> usize {
        index * self.block_size
    }

    /// Data offset of a block, with only the index checked.
    pub fn buffer_from_index_validate(&self, index: usize) -> Result<usize, IcbError> {
        if index >= self.block_count {
            warn!(block = index, "block index out of range");
            return Err(IcbError::InvalidBlock { index });
        }
        Ok(self.block_offset(index) + BLOCK_HEADER_SIZE)
    }

    /// Data offset and size of the buffer starting at `index`.
    ///
    /// The size comes from the header and is rejected unless it fits both the
    /// blocks area as a whole and the space left after this block's header.
    pub fn buffer_from_index_validate_sized(&self, index: usize) -> Result<(usize, usize), IcbError> {
        let data = self.buffer_from_index_validate(index)?;
        let allocable = self.allocable_size();
        // Read once; the peer may rewrite the header after validation.
        let size = self.blocks.read_u32_volatile(self.block_offset(index))? as usize;

        if size > allocable - BLOCK_HEADER_SIZE || data + size > allocable {
            warn!(block = index, size, "block header corrupted");
            return Err(IcbError::InvalidBlock { index });
        }
        Ok((data, size))
    }

    /// Writes the size header of the buffer starting at `index`.
    pub fn set_header_size(&self, index: usize, size: usize) -> Result<(), IcbError> {
        if index >= self.block_count {
            return Err(IcbError::InvalidBlock { index });
        }
        let size = u32::try_from(size).map_err(|_| IcbError::InvalidBlock { index })?;
        self.blocks.write_u32_volatile(self.block_offset(index), size)?;
        Ok(())
    }

    /// Copies buffer bytes out, `offset` being a data offset from validation.
    pub fn read_data(&self, offset: usize, dst: &mut [u8]) -> Result<(), IcbError> {
        self.blocks.read_bytes(offset, dst)?;
        Ok(())
    }

    pub fn write_data(&self, offset: usize, src: &[u8]) -> Result<(), IcbError> {
        self.blocks.write_bytes(offset, src)?;
        Ok(())
    }
}

/// A TX buffer reserved by [`TxAllocator::alloc`].
///
/// Owning one means owning its blocks until it is sent or released.
#[derive(Debug, PartialEq, Eq)]
pub struct TxBuffer {
    index: u8,
    data_offset: usize,
    capacity: usize,
}

impl TxBuffer {
    /// Index of the first block, as carried in control messages.
    #[inline]
    pub fn block_index(&self) -> u8 {
        self.index
    }

    /// Usable data bytes; may exceed the requested size.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn data_offset(&self) -> usize {
        self.data_offset
    }
}

/// First-fit allocator over this side's TX blocks.
#[derive(Debug)]
pub struct TxAllocator {
    channel: BlockChannel,
    usage: Bitset,
}

impl TxAllocator {
    pub fn new(channel: BlockChannel) -> Self {
        let usage = Bitset::new(channel.block_count());
        Self { channel, usage }
    }

    #[inline]
    pub fn channel(&self) -> &BlockChannel {
        &self.channel
    }

    /// Blocks currently reserved.
    pub fn in_use(&self) -> usize {
        self.usage.count_ones()
    }

    pub fn usage(&self) -> &Bitset {
        &self.usage
    }

    /// Reserves the lowest run of blocks that fits `size` data bytes and
    /// records the usable size in the header.
    pub fn alloc(&mut self, size: usize) -> Result<TxBuffer, IcbError> {
        let blocks = self.channel.blocks_for(size);
        if blocks > self.channel.block_count() {
            debug!(size, blocks, "request larger than the blocks area");
            return Err(IcbError::OutOfBlocks { blocks });
        }
        let Some(index) = self.usage.find_run_of_zeros(blocks) else {
            debug!(size, blocks, "no free run of blocks");
            return Err(IcbError::OutOfBlocks { blocks });
        };
        self.usage.set_range(index, blocks);

        let capacity = blocks * self.channel.block_size() - BLOCK_HEADER_SIZE;
        let data_offset = match self.channel.set_header_size(index, capacity) {
            Ok(()) => self.channel.buffer_from_index_validate(index)?,
            Err(e) => {
                self.usage.clear_range(index, blocks);
                return Err(e);
            }
        };
        debug!(block = index, blocks, capacity, "tx blocks reserved");
        Ok(TxBuffer {
            index: index as u8,
            data_offset,
            capacity,
        })
    }

    /// Frees the blocks a buffer of `size` bytes starting at `index` covers.
    ///
    /// Only this side's own allocations are ever echoed back, so the index is
    /// not checked against the allocation history.
    pub fn release(&mut self, index: usize, size: usize) {
        let blocks = self.channel.blocks_for(size);
        self.usage.clear_range(index, blocks);
        debug!(block = index, blocks, "tx blocks released");
    }

    /// Shrinks a reservation to what `used` bytes need, freeing its tail.
    pub(crate) fn trim(&mut self, buf: &TxBuffer, used: usize) {
        let index = buf.index as usize;
        let reserved = self.channel.blocks_for(buf.capacity);
        let needed = self.channel.blocks_for(used);
        if needed < reserved {
            self.usage.clear_range(index + needed, reserved - needed);
        }
    }
}
