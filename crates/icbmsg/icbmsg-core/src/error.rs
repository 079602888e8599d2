use icbmsg_shm::ShmError;

/// Failures of the packet ring.
#[derive(Debug, thiserror::Error)]
pub enum PbufError {
    #[error("invalid pbuf configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid argument")]
    InvalidArgument,

    #[error("not enough free space in ring")]
    NoSpace,

    #[error("packet of {needed} bytes does not fit the read buffer")]
    BufferTooSmall { needed: usize },

    /// A cursor published by the peer is misaligned or out of range.
    #[error("peer cursor {idx} is corrupted")]
    Corrupted { idx: u32 },

    /// Occupied space is smaller than the framed packet. Should never happen.
    #[error("ring occupancy inconsistent with packet length")]
    Inconsistent,

    #[error(transparent)]
    Shm(#[from] ShmError),
}

/// Failures of the ICBMsg link.
#[derive(Debug, thiserror::Error)]
pub enum IcbError {
    #[error("link is not synchronized with the peer yet")]
    Busy,

    #[error("no run of {blocks} free blocks")]
    OutOfBlocks { blocks: usize },

    #[error("block index {index} rejected")]
    InvalidBlock { index: usize },

    #[error("endpoint address {addr} is not valid")]
    InvalidEndpoint { addr: u8 },

    #[error("endpoint {addr} is not bound")]
    EndpointNotReady { addr: u8 },

    #[error("endpoint table is full")]
    EndpointTableFull,

    #[error("endpoint name must be non-empty and free of NUL bytes")]
    InvalidName,

    #[error("payload of {len} bytes exceeds buffer of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("unexpected bound message for remote endpoint {addr}")]
    UnexpectedBound { addr: u8 },

    #[error("first packet from peer is not the magic string")]
    MagicMismatch,

    #[error("invalid link configuration: {0}")]
    Config(&'static str),

    #[error(transparent)]
    Pbuf(#[from] PbufError),

    #[error(transparent)]
    Shm(#[from] ShmError),
}
