//! ICBMsg: a zero-copy, two-core message transport over shared memory.
//!
//! Each direction of a link gets one region. A small packet ring (the pbuf)
//! carries 3-byte control messages; payloads travel in fixed-size blocks that
//! the sender allocates and the receiver hands back once it is done.

mod bitset;
mod blocks;
mod control;
mod doorbell;
mod endpoint;
mod error;
mod instance;
mod pbuf;
mod shm_layout;

pub use bitset::{Bitset, MAX_BITS};
pub use blocks::{BLOCK_HEADER_SIZE, BlockChannel, TxAllocator, TxBuffer};
pub use control::{CONTROL_MESSAGE_SIZE, ControlMessage, Decoded, MsgType};
pub use doorbell::{Doorbell, NoDoorbell};
pub use endpoint::{EPT_ADDR_INVALID, EndpointAddr, EndpointHandler, EndpointState, MAX_ENDPOINTS};
pub use error::{IcbError, PbufError};
pub use instance::{InstanceConfig, IpcInstance, LinkState, RX_SCRATCH_SIZE};
pub use pbuf::{
    PBUF_IDX_SIZE, PBUF_MIN_DATA_LEN, PBUF_PACKET_LEN_SZ, Pbuf, PbufConfig, idx_occupied, idx_wrap,
    pbuf_header_overhead,
};
pub use shm_layout::{
    BYTES_PER_ICMSG_MESSAGE, CACHE_ALIGNMENT, ICMSG_BUFFER_OVERHEAD, MAGIC, RegionLayout, RegionSplit,
    aligned_window, icmsg_min_size,
};
