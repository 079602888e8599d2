//! The 3-byte control message, the only unit ever sent through a pbuf.
//!
//! ```text
//! ┌──────────┬──────────────────┬─────────────┐
//! │ msg_type │ endpoint address │ block index │
//! └──────────┴──────────────────┴─────────────┘
//! ```
//!
//! | type | meaning | ownership of the referenced block |
//! |---|---|---|
//! | `Data` | payload for an endpoint | receiver answers `ReleaseData` when done |
//! | `ReleaseData` | sender may free the block | back with the sender |
//! | `Bound` | bond the endpoint named in the block | receiver answers `ReleaseBound` on match |
//! | `ReleaseBound` | bonding done, name block may be freed | back with the sender |

pub const CONTROL_MESSAGE_SIZE: usize = 3;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    Data = 0,
    ReleaseData = 1,
    Bound = 2,
    /// Also tells the receiver that the sender has fully processed bonding.
    ReleaseBound = 3,
}

impl TryFrom<u8> for MsgType {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, u8> {
        match raw {
            0 => Ok(MsgType::Data),
            1 => Ok(MsgType::ReleaseData),
            2 => Ok(MsgType::Bound),
            3 => Ok(MsgType::ReleaseBound),
            other => Err(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlMessage {
    pub kind: MsgType,
    pub ept_addr: u8,
    pub block_index: u8,
}

/// Result of decoding a received packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decoded {
    Message(ControlMessage),
    /// A type this version does not know. Later protocol versions may send
    /// these, so they are skipped rather than treated as corruption.
    Unknown(u8),
    /// Fewer than three bytes.
    Short,
}

impl ControlMessage {
    pub fn new(kind: MsgType, ept_addr: u8, block_index: u8) -> Self {
        Self {
            kind,
            ept_addr,
            block_index,
        }
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; CONTROL_MESSAGE_SIZE] {
        [self.kind as u8, self.ept_addr, self.block_index]
    }

    /// Decodes the first three bytes of a packet; trailing bytes are ignored.
    pub fn decode(packet: &[u8]) -> Decoded {
        let &[kind, ept_addr, block_index, ..] = packet else {
            return Decoded::Short;
        };
        match MsgType::try_from(kind) {
            Ok(kind) => Decoded::Message(Self::new(kind, ept_addr, block_index)),
            Err(raw) => Decoded::Unknown(raw),
        }
    }
}
