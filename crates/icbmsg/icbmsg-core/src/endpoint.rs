//! Endpoint table and bonding state.
//!
//! ```text
//!   register                initiator: MSG_BOUND sent     any traffic / MSG_RELEASE_BOUND
//! UNCONFIGURED ──► CONFIGURED ─────────────────────────► BOUNDING ───────────────────────► READY
//!                      │                                                                   ▲
//!                      └──────────── follower: matching MSG_BOUND received ────────────────┘
//! ```
//!
//! Names are only compared during bonding. Afterwards every message carries
//! the initiator's small integer address for the endpoint.

use crate::error::IcbError;
use std::fmt;
use tracing::info;

/// Local handle to a registered endpoint: its slot in the table.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointAddr(pub u8);

/// Wire address of an endpoint whose remote address is not known yet.
pub const EPT_ADDR_INVALID: u8 = 0xFF;

/// `0xFF` is reserved, so a table holds at most 255 endpoints.
pub const MAX_ENDPOINTS: usize = 255;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EndpointState {
    #[default]
    Unconfigured,
    /// Registered, bonding not started yet.
    Configured,
    /// Initiator only: MSG_BOUND sent, nothing heard back yet.
    Bounding,
    Ready,
}

/// Application side of an endpoint.
pub trait EndpointHandler {
    /// A data buffer arrived. The slice is only valid for the call.
    fn received(&mut self, data: &[u8]);

    /// The endpoint reached READY. Called once.
    fn bound(&mut self) {}
}

impl<F: FnMut(&[u8])> EndpointHandler for F {
    fn received(&mut self, data: &[u8]) {
        self(data)
    }
}

struct Endpoint {
    name: String,
    handler: Box<dyn EndpointHandler + Send>,
    state: EndpointState,
    /// Address written into outgoing messages. On the initiator this is the
    /// slot itself; on the follower it is learned from MSG_BOUND.
    addr: u8,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    fn become_ready(&mut self) {
        self.state = EndpointState::Ready;
        info!(name = %self.name, addr = self.addr, "endpoint bound");
        self.handler.bound();
    }
}

#[derive(Debug)]
pub(crate) struct EndpointTable {
    endpoints: Vec<Endpoint>,
    capacity: usize,
    /// Remote (wire) address to local slot.
    ept_map: Vec<u8>,
    /// Remote address to the block of a MSG_BOUND nobody has claimed yet.
    waiting_bound: Vec<Option<u8>>,
}

impl EndpointTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            endpoints: Vec::with_capacity(capacity),
            capacity,
            ept_map: vec![EPT_ADDR_INVALID; capacity],
            waiting_bound: vec![None; capacity],
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Takes the next slot. Slots are handed out in registration order.
    pub(crate) fn register(
        &mut self,
        name: &str,
        handler: Box<dyn EndpointHandler + Send>,
    ) -> Result<usize, IcbError> {
        if self.endpoints.len() >= self.capacity {
            return Err(IcbError::EndpointTableFull);
        }
        self.endpoints.push(Endpoint {
            name: name.to_owned(),
            handler,
            state: EndpointState::Configured,
            addr: EPT_ADDR_INVALID,
        });
        Ok(self.endpoints.len() - 1)
    }

    pub(crate) fn state(&self, local: usize) -> EndpointState {
        self.endpoints
            .get(local)
            .map_or(EndpointState::Unconfigured, |e| e.state)
    }

    pub(crate) fn name(&self, local: usize) -> Option<&str> {
        self.endpoints.get(local).map(|e| e.name.as_str())
    }

    pub(crate) fn wire_addr(&self, local: usize) -> Option<u8> {
        self.endpoints
            .get(local)
            .map(|e| e.addr)
            .filter(|&a| a != EPT_ADDR_INVALID)
    }

    /// Slots still waiting for bonding to start.
    pub(crate) fn configured(&self) -> Vec<usize> {
        self.endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == EndpointState::Configured)
            .map(|(i, _)| i)
            .collect()
    }

    /// Initiator: the slot becomes the wire address.
    pub(crate) fn start_bounding(&mut self, local: usize) {
        let ept = &mut self.endpoints[local];
        ept.addr = local as u8;
        ept.state = EndpointState::Bounding;
        self.ept_map[local] = local as u8;
    }

    /// Initiator: sending MSG_BOUND failed, bonding has to start over.
    pub(crate) fn abort_bounding(&mut self, local: usize) {
        let ept = &mut self.endpoints[local];
        ept.addr = EPT_ADDR_INVALID;
        ept.state = EndpointState::Configured;
        self.ept_map[local] = EPT_ADDR_INVALID;
    }

    pub(crate) fn find_configured_by_name(&self, name: &[u8]) -> Option<usize> {
        self.endpoints
            .iter()
            .position(|e| e.state == EndpointState::Configured && e.name.as_bytes() == name)
    }

    /// Follower: adopts the initiator's address and goes straight to READY.
    pub(crate) fn bind(&mut self, local: usize, remote: u8) {
        self.ept_map[remote as usize] = local as u8;
        let ept = &mut self.endpoints[local];
        ept.addr = remote;
        ept.become_ready();
    }

    /// Local slot for an inbound message, if it may receive.
    ///
    /// Traffic for a BOUNDING endpoint proves the peer has bound it, so it is
    /// promoted to READY here.
    pub(crate) fn rx_validate(&mut self, remote: u8) -> Option<usize> {
        let local = *self.ept_map.get(remote as usize)?;
        let ept = self.endpoints.get_mut(local as usize)?;
        match ept.state {
            EndpointState::Ready => {}
            EndpointState::Bounding => ept.become_ready(),
            EndpointState::Unconfigured | EndpointState::Configured => return None,
        }
        Some(local as usize)
    }

    pub(crate) fn deliver(&mut self, local: usize, data: &[u8]) {
        self.endpoints[local].handler.received(data);
    }

    /// Parks a MSG_BOUND block, replacing an older one from the same address.
    pub(crate) fn park(&mut self, remote: u8, block: u8) {
        self.waiting_bound[remote as usize] = Some(block);
    }

    pub(crate) fn take_parked(&mut self, remote: u8) -> Option<u8> {
        self.waiting_bound[remote as usize].take()
    }

    pub(crate) fn parked(&self) -> usize {
        self.waiting_bound.iter().flatten().count()
    }
}
