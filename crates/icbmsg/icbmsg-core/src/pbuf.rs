//! Single-producer, single-consumer packet ring ("pbuf") over shared memory.
//!
//! One pbuf carries one direction of the link. The writer owns `wr_idx`, the
//! reader owns `rd_idx`; neither side ever writes the other's cursor, which is
//! what makes the ring lock-free without any cross-core atomic RMW.
//!
//! # Memory Layout
//!
//! ```text
//! A = max(cache_alignment, 4)
//!
//! ┌──────────────┬──────────────┬──────────────────────────────────────┐
//! │ rd_idx (u32) │ wr_idx (u32) │ data[len]                            │
//! │ @0, pad to A │ @A, pad to A │ @2A                                  │
//! └──────────────┴──────────────┴──────────────────────────────────────┘
//!
//! Packet inside data (may wrap past the end back to offset 0):
//! ┌───────────────┬──────────┬───────────────────┬────────────────┐
//! │ len (u16, BE) │ 0x0000   │ payload[len]      │ pad to 4 bytes │
//! └───────────────┴──────────┴───────────────────┴────────────────┘
//! ```
//!
//! # Publication order
//!
//! The writer stores the length prefix and payload first and only then
//! publishes `wr_idx` with Release ordering. The reader loads `wr_idx` with
//! Acquire ordering, so it never sees a cursor that points past bytes that
//! are not in place yet. The same holds in reverse for `rd_idx`.

use crate::error::PbufError;
use icbmsg_shm::ShmView;
use tracing::warn;

/// Size of a ring cursor.
pub const PBUF_IDX_SIZE: usize = 4;

/// Size of the length slot in front of every packet. Only the first two bytes
/// carry the length; the rest stay zero for future versioning.
pub const PBUF_PACKET_LEN_SZ: usize = 4;

/// Smallest data area that can hold a length slot plus the reserved slack.
pub const PBUF_MIN_DATA_LEN: usize = round_up(PBUF_PACKET_LEN_SZ, PBUF_IDX_SIZE) + PBUF_IDX_SIZE;

/// Bytes taken by the two cursors for a given cache alignment.
pub const fn pbuf_header_overhead(cache_alignment: usize) -> usize {
    2 * max(cache_alignment, PBUF_IDX_SIZE)
}

pub(crate) const fn round_up(x: usize, align: usize) -> usize {
    x.div_ceil(align) * align
}

pub(crate) const fn round_down(x: usize, align: usize) -> usize {
    (x / align) * align
}

const fn max(a: usize, b: usize) -> usize {
    if a > b { a } else { b }
}

/// Wraps an index that went past the end of the data area.
///
/// Callers never pass more than `2 * len`, so a single modulo is enough.
///
/// ```text
/// len = 32
/// idx =  8 →  8
/// idx = 32 →  0
/// idx = 36 →  4
/// ```
#[inline(always)]
pub fn idx_wrap(len: u32, idx: u32) -> u32 {
    if idx >= len { idx % len } else { idx }
}

/// Bytes between the read and write cursors.
///
/// The cursors never differ by more than `len`, so when `rd_idx` is ahead of
/// `wr_idx` the writer has wrapped and the occupied range is split in two.
///
/// ```text
/// len = 32
/// wr = 20, rd =  4 → 16
/// wr =  4, rd = 20 → 32 - 16 = 16
/// wr = rd          →  0 (empty)
/// ```
#[inline(always)]
pub fn idx_occupied(len: u32, wr_idx: u32, rd_idx: u32) -> u32 {
    if rd_idx > wr_idx {
        len - (rd_idx - wr_idx)
    } else {
        wr_idx - rd_idx
    }
}

#[inline(always)]
fn is_idx_aligned(idx: u32) -> bool {
    (idx as usize) % PBUF_IDX_SIZE == 0
}

/// Where the cursors and data of one pbuf live inside a shared view.
///
/// All locations are offsets into `mem`.
#[derive(Debug, Clone)]
pub struct PbufConfig {
    mem: ShmView,
    rd_idx_loc: usize,
    wr_idx_loc: usize,
    data_loc: usize,
    len: usize,
    cache_alignment: usize,
}

impl PbufConfig {
    /// Lays a pbuf out over the whole of `mem`: read cursor, write cursor,
    /// then the data area filling the rest.
    pub fn new(mem: ShmView, cache_alignment: usize) -> Self {
        let slot = max(cache_alignment, PBUF_IDX_SIZE);
        let len = mem.len().saturating_sub(2 * slot);
        Self {
            mem,
            rd_idx_loc: 0,
            wr_idx_loc: slot,
            data_loc: 2 * slot,
            len,
            cache_alignment,
        }
    }

    /// Explicit layout, for regions whose cursors are not placed by [`PbufConfig::new`].
    pub fn from_parts(
        mem: ShmView,
        rd_idx_loc: usize,
        wr_idx_loc: usize,
        data_loc: usize,
        len: usize,
        cache_alignment: usize,
    ) -> Self {
        Self {
            mem,
            rd_idx_loc,
            wr_idx_loc,
            data_loc,
            len,
            cache_alignment,
        }
    }

    /// Length of the data area.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn validate(&self) -> Result<(), PbufError> {
        let slot = max(self.cache_alignment, PBUF_IDX_SIZE);
        let base = self.mem.addr();

        let end = self.data_loc.checked_add(self.len);
        if end.is_none_or(|end| end > self.mem.len()) {
            return Err(PbufError::InvalidConfig("data area outside shared region"));
        }
        if (base + self.rd_idx_loc) % slot != 0 || (base + self.wr_idx_loc) % slot != 0 {
            return Err(PbufError::InvalidConfig("cursor not aligned"));
        }
        if (base + self.data_loc) % PBUF_IDX_SIZE != 0 {
            return Err(PbufError::InvalidConfig("data area not aligned"));
        }
        if self.len < PBUF_MIN_DATA_LEN || self.len % PBUF_IDX_SIZE != 0 {
            return Err(PbufError::InvalidConfig("data length too small or unaligned"));
        }
        if self.len > u32::MAX as usize {
            return Err(PbufError::InvalidConfig("data length exceeds cursor range"));
        }
        if !(self.rd_idx_loc < self.wr_idx_loc)
            || !(self.wr_idx_loc < self.data_loc)
            || self.rd_idx_loc + slot != self.wr_idx_loc
        {
            return Err(PbufError::InvalidConfig("cursors and data not contiguous"));
        }
        Ok(())
    }
}

/// One direction of the packet ring, seen from one side.
///
/// A side holds a writer instance for its TX pbuf and a reader instance for
/// its RX pbuf. Each keeps a private copy of the cursor it owns.
#[derive(Debug)]
pub struct Pbuf {
    cfg: PbufConfig,
    wr_idx: u32,
    rd_idx: u32,
}

impl Pbuf {
    /// Validates the layout and resets both shared cursors. Called by the
    /// writing side, which owns the ring's initial state.
    pub fn init(cfg: PbufConfig) -> Result<Self, PbufError> {
        cfg.validate()?;
        cfg.mem.store_u32(cfg.rd_idx_loc, 0)?;
        cfg.mem.store_u32(cfg.wr_idx_loc, 0)?;
        Ok(Self {
            cfg,
            wr_idx: 0,
            rd_idx: 0,
        })
    }

    /// Validates the layout and resets only the local cursor cache. The peer
    /// may already be writing, so the shared cursors are left alone.
    pub fn attach_reader(cfg: PbufConfig) -> Result<Self, PbufError> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            wr_idx: 0,
            rd_idx: 0,
        })
    }

    /// Length of the data area.
    pub fn capacity(&self) -> usize {
        self.cfg.len
    }

    /// Enqueues one packet. Returns the payload length.
    ///
    /// # Errors
    /// - `InvalidArgument` for an empty or oversized (> `u16::MAX`) payload
    /// - `Corrupted` if the peer's `rd_idx` is misaligned or out of range
    /// - `NoSpace` if the framed packet does not fit; nothing is written
    pub fn write(&mut self, data: &[u8]) -> Result<usize, PbufError> {
        if data.is_empty() || data.len() > u16::MAX as usize {
            return Err(PbufError::InvalidArgument);
        }
        let mem = &self.cfg.mem;
        let blen = self.cfg.len as u32;
        let data_loc = self.cfg.data_loc;
        let len = data.len();

        let rd_idx = mem.load_u32(self.cfg.rd_idx_loc)?;
        let mut wr_idx = self.wr_idx;

        if !is_idx_aligned(rd_idx) || rd_idx >= blen {
            warn!(rd_idx, "peer read cursor corrupted");
            return Err(PbufError::Corrupted { idx: rd_idx });
        }

        let free_space = (blen - idx_occupied(blen, wr_idx, rd_idx))
            .saturating_sub(PBUF_IDX_SIZE as u32) as usize;
        let plen = len + PBUF_PACKET_LEN_SZ;
        if free_space < plen {
            return Err(PbufError::NoSpace);
        }

        // The length slot is cleared in full; bytes 2..4 are reserved.
        let at = data_loc + wr_idx as usize;
        mem.write_bytes(at, &[0; PBUF_PACKET_LEN_SZ])?;
        mem.write_u16_be(at, len as u16)?;
        wr_idx = idx_wrap(blen, wr_idx + PBUF_PACKET_LEN_SZ as u32);

        let tail = len.min((blen - wr_idx) as usize);
        mem.write_bytes(data_loc + wr_idx as usize, &data[..tail])?;
        if len > tail {
            mem.write_bytes(data_loc, &data[tail..])?;
        }

        wr_idx = idx_wrap(
            blen,
            round_up(wr_idx as usize + len, PBUF_IDX_SIZE) as u32,
        );

        self.wr_idx = wr_idx;
        mem.store_u32(self.cfg.wr_idx_loc, wr_idx)?;
        Ok(len)
    }

    /// Length of the next packet without consuming it. `0` when empty.
    pub fn peek(&self) -> Result<usize, PbufError> {
        let wr_idx = self.load_peer_wr_idx()?;
        if self.rd_idx == wr_idx {
            return Ok(0);
        }
        let plen = self
            .cfg
            .mem
            .read_u16_be(self.cfg.data_loc + self.rd_idx as usize)?;
        Ok(plen as usize)
    }

    /// Dequeues one packet into `buf`. Returns the payload length, `0` when
    /// the ring is empty.
    ///
    /// # Errors
    /// - `Corrupted` if the peer's `wr_idx` is misaligned or out of range
    /// - `BufferTooSmall` if the packet is longer than `buf`; nothing is consumed
    /// - `Inconsistent` if the packet length runs past the write cursor
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, PbufError> {
        let mem = &self.cfg.mem;
        let blen = self.cfg.len as u32;
        let data_loc = self.cfg.data_loc;

        let wr_idx = self.load_peer_wr_idx()?;
        let mut rd_idx = self.rd_idx;

        if rd_idx == wr_idx {
            return Ok(0);
        }

        let plen = mem.read_u16_be(data_loc + rd_idx as usize)? as usize;
        if plen > buf.len() {
            return Err(PbufError::BufferTooSmall { needed: plen });
        }

        let occupied = idx_occupied(blen, wr_idx, rd_idx) as usize;
        if occupied < plen + PBUF_PACKET_LEN_SZ {
            return Err(PbufError::Inconsistent);
        }

        rd_idx = idx_wrap(blen, rd_idx + PBUF_PACKET_LEN_SZ as u32);

        let tail = plen.min((blen - rd_idx) as usize);
        mem.read_bytes(data_loc + rd_idx as usize, &mut buf[..tail])?;
        if plen > tail {
            mem.read_bytes(data_loc, &mut buf[tail..plen])?;
        }

        rd_idx = idx_wrap(
            blen,
            round_up(rd_idx as usize + plen, PBUF_IDX_SIZE) as u32,
        );

        self.rd_idx = rd_idx;
        mem.store_u32(self.cfg.rd_idx_loc, rd_idx)?;
        Ok(plen)
    }

    fn load_peer_wr_idx(&self) -> Result<u32, PbufError> {
        let wr_idx = self.cfg.mem.load_u32(self.cfg.wr_idx_loc)?;
        if !is_idx_aligned(wr_idx) || wr_idx >= self.cfg.len as u32 {
            warn!(wr_idx, "peer write cursor corrupted");
            return Err(PbufError::Corrupted { idx: wr_idx });
        }
        Ok(wr_idx)
    }
}
