//! One side of an ICBMsg link.
//!
//! An instance owns this core's view of both directions: the TX pbuf and TX
//! blocks it writes into, and the RX pbuf and RX blocks the peer writes into.
//! It never blocks. The platform calls [`IpcInstance::process_signal`]
//! whenever the peer may have produced data.
//!
//! # Data flow
//!
//! ```text
//! send ─► alloc TX blocks ─► copy payload ─► MSG_DATA ─► TX pbuf ─► doorbell
//!
//! process_signal ─► RX pbuf ─► MSG_DATA ─► validate RX block ─► handler
//!                                                            └─► MSG_RELEASE_DATA
//!                 ─► MSG_RELEASE_DATA ─► validate TX block ─► free TX blocks
//! ```

use crate::blocks::{BlockChannel, TxAllocator, TxBuffer};
use crate::control::{ControlMessage, Decoded, MsgType};
use crate::doorbell::{Doorbell, NoDoorbell};
use crate::endpoint::{EndpointAddr, EndpointHandler, EndpointState, EndpointTable, MAX_ENDPOINTS};
use crate::error::IcbError;
use crate::pbuf::{Pbuf, PbufConfig};
use crate::shm_layout::{CACHE_ALIGNMENT, MAGIC, RegionSplit};
use icbmsg_shm::ShmView;
use tracing::{debug, error, info, warn};

/// Largest packet taken off the RX pbuf. Control messages and the magic
/// string are far smaller; a longer packet stops the drain.
pub const RX_SCRATCH_SIZE: usize = 128;

/// Static link parameters. Both sides must use mirrored values: one side's
/// `tx_blocks` is the other's `rx_blocks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceConfig {
    pub tx_blocks: usize,
    pub rx_blocks: usize,
    pub num_endpoints: usize,
}

impl InstanceConfig {
    /// The same link seen from the other core.
    pub fn mirrored(&self) -> Self {
        Self {
            tx_blocks: self.rx_blocks,
            rx_blocks: self.tx_blocks,
            num_endpoints: self.num_endpoints,
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            tx_blocks: 16,
            rx_blocks: 16,
            num_endpoints: 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Magic sent, waiting for the peer's.
    Busy,
    Ready,
}

pub struct IpcInstance<D = NoDoorbell> {
    tx_pb: Pbuf,
    rx_pb: Pbuf,
    tx: TxAllocator,
    rx: BlockChannel,
    endpoints: EndpointTable,
    is_initiator: bool,
    state: LinkState,
    doorbell: D,
    /// Copy of the RX buffer being handed to an endpoint.
    rx_data: Vec<u8>,
}

impl<D: Doorbell> IpcInstance<D> {
    /// Partitions both regions, resets the TX ring and enqueues the magic
    /// string. The link is BUSY until the peer's magic arrives.
    ///
    /// The side whose RX blocks sit at the lower address is the initiator.
    /// Both sides see the same two regions, so they always agree.
    pub fn open(
        config: InstanceConfig,
        tx_region: &ShmView,
        rx_region: &ShmView,
        doorbell: D,
    ) -> Result<Self, IcbError> {
        if config.num_endpoints == 0 || config.num_endpoints > MAX_ENDPOINTS {
            return Err(IcbError::Config("endpoint count must be within 1..=255"));
        }
        let tx = RegionSplit::new(tx_region, config.tx_blocks, config.rx_blocks)?;
        let rx = RegionSplit::new(rx_region, config.rx_blocks, config.tx_blocks)?;

        let tx_blocks = BlockChannel::new(tx.blocks, tx.layout.block_size, tx.layout.block_count)?;
        let rx_blocks = BlockChannel::new(rx.blocks, rx.layout.block_size, rx.layout.block_count)?;
        let is_initiator = rx_blocks.addr() < tx_blocks.addr();

        let mut tx_pb = Pbuf::init(PbufConfig::new(tx.icmsg, CACHE_ALIGNMENT))?;
        let rx_pb = Pbuf::attach_reader(PbufConfig::new(rx.icmsg, CACHE_ALIGNMENT))?;

        tx_pb.write(&MAGIC)?;
        doorbell.ring();

        debug!(
            is_initiator,
            tx_block_size = tx.layout.block_size,
            tx_blocks = tx.layout.block_count,
            rx_block_size = rx.layout.block_size,
            rx_blocks = rx.layout.block_count,
            "icbmsg instance opened"
        );

        Ok(Self {
            tx_pb,
            rx_pb,
            tx: TxAllocator::new(tx_blocks),
            rx: rx_blocks,
            endpoints: EndpointTable::new(config.num_endpoints),
            is_initiator,
            state: LinkState::Busy,
            doorbell,
            rx_data: Vec::new(),
        })
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    #[inline]
    pub fn state(&self) -> LinkState {
        self.state
    }

    #[inline]
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn endpoint_state(&self, addr: EndpointAddr) -> EndpointState {
        self.endpoints.state(addr.0 as usize)
    }

    pub fn endpoint_ready(&self, addr: EndpointAddr) -> bool {
        self.endpoint_state(addr) == EndpointState::Ready
    }

    /// Address the peer uses for this endpoint, once known.
    pub fn endpoint_remote_addr(&self, addr: EndpointAddr) -> Option<u8> {
        self.endpoints.wire_addr(addr.0 as usize)
    }

    pub fn endpoint_name(&self, addr: EndpointAddr) -> Option<&str> {
        self.endpoints.name(addr.0 as usize)
    }

    /// TX blocks reserved and not yet released by the peer.
    pub fn tx_blocks_in_use(&self) -> usize {
        self.tx.in_use()
    }

    /// MSG_BOUND messages waiting for a local registration.
    pub fn pending_bounds(&self) -> usize {
        self.endpoints.parked()
    }

    /// Registers an endpoint under `name`.
    ///
    /// On the initiator with a ready link, MSG_BOUND goes out immediately;
    /// before the link is ready it goes out once the peer's magic arrives. If
    /// it cannot be sent for lack of blocks or ring space, the endpoint is
    /// still registered and stays CONFIGURED until [`Self::bind_pending`]
    /// succeeds. On the follower, any MSG_BOUND already received for this name
    /// is answered.
    pub fn register_endpoint<H>(&mut self, name: &str, handler: H) -> Result<EndpointAddr, IcbError>
    where
        H: EndpointHandler + Send + 'static,
    {
        if name.is_empty() || name.as_bytes().contains(&0) {
            return Err(IcbError::InvalidName);
        }
        let local = self.endpoints.register(name, Box::new(handler))?;
        debug!(name, slot = local, "endpoint registered");

        if self.is_initiator {
            if self.is_ready() {
                if let Err(e) = self.start_bounding(local) {
                    warn!(name, slot = local, error = %e, "bonding deferred until bind_pending");
                }
            }
        } else {
            self.replay_waiting_bounds();
        }
        Ok(EndpointAddr(local as u8))
    }

    /// Initiator: sends MSG_BOUND for every endpoint still CONFIGURED.
    ///
    /// Runs automatically when the link becomes ready. Call it again to retry
    /// bonds that could not be sent for lack of blocks or ring space. Every
    /// CONFIGURED endpoint is tried; the first failure is returned after the
    /// pass. Returns how many bonds were started.
    pub fn bind_pending(&mut self) -> Result<usize, IcbError> {
        if !self.is_initiator {
            return Ok(0);
        }
        if !self.is_ready() {
            return Err(IcbError::Busy);
        }
        let mut started = 0;
        let mut first_err = None;
        for local in self.endpoints.configured() {
            match self.start_bounding(local) {
                Ok(()) => started += 1,
                Err(e) => {
                    debug!(slot = local, error = %e, "bound not sent");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(started),
        }
    }

    /// Copies `data` into freshly reserved TX blocks and sends it.
    pub fn send(&mut self, addr: EndpointAddr, data: &[u8]) -> Result<(), IcbError> {
        let wire = self.ready_wire_addr(addr)?;
        let buf = self.tx.alloc(data.len())?;
        if let Err(e) = self.tx.channel().write_data(buf.data_offset(), data) {
            self.release_tx_buf(buf);
            return Err(e);
        }
        self.send_block(MsgType::Data, wire, buf.block_index() as usize, data.len())
    }

    /// Reserves a TX buffer of at least `size` bytes for zero-copy sending.
    pub fn alloc_tx_buf(&mut self, size: usize) -> Result<TxBuffer, IcbError> {
        self.tx.alloc(size)
    }

    /// Writes into a reserved buffer at `offset`.
    pub fn tx_buf_write(&self, buf: &TxBuffer, offset: usize, data: &[u8]) -> Result<(), IcbError> {
        let end = offset.saturating_add(data.len());
        if end > buf.capacity() {
            return Err(IcbError::PayloadTooLarge {
                len: end,
                capacity: buf.capacity(),
            });
        }
        self.tx.channel().write_data(buf.data_offset() + offset, data)
    }

    /// Sends the first `len` bytes of a reserved buffer. Blocks beyond what
    /// `len` needs are freed first. The buffer is released on failure.
    pub fn send_buf(&mut self, addr: EndpointAddr, buf: TxBuffer, len: usize) -> Result<(), IcbError> {
        if len > buf.capacity() {
            let capacity = buf.capacity();
            self.release_tx_buf(buf);
            return Err(IcbError::PayloadTooLarge { len, capacity });
        }
        let wire = match self.ready_wire_addr(addr) {
            Ok(wire) => wire,
            Err(e) => {
                self.release_tx_buf(buf);
                return Err(e);
            }
        };
        self.tx.trim(&buf, len);
        self.send_block(MsgType::Data, wire, buf.block_index() as usize, len)
    }

    /// Gives back a reserved buffer that will not be sent.
    pub fn release_tx_buf(&mut self, buf: TxBuffer) {
        self.tx.release(buf.block_index() as usize, buf.capacity());
    }

    /// Drains the RX pbuf and handles every packet in it. Returns the number
    /// of packets handled.
    ///
    /// Rejected peer input (bad index, corrupted header, unknown endpoint) is
    /// logged and skipped. A corrupted RX cursor or a wrong magic string ends
    /// the drain with an error.
    pub fn process_signal(&mut self) -> Result<usize, IcbError> {
        let mut processed = 0;
        loop {
            let len = self.rx_pb.peek()?;
            if len == 0 {
                return Ok(processed);
            }
            if len > RX_SCRATCH_SIZE {
                warn!(len, "packet exceeds receive buffer, leaving it queued");
                return Ok(processed);
            }
            let mut packet = [0u8; RX_SCRATCH_SIZE];
            let n = self.rx_pb.read(&mut packet)?;
            self.process_packet(&packet[..n])?;
            processed += 1;
        }
    }

    fn process_packet(&mut self, packet: &[u8]) -> Result<(), IcbError> {
        match self.state {
            LinkState::Ready => {
                match ControlMessage::decode(packet) {
                    Decoded::Message(msg) => self.control_received(msg),
                    Decoded::Unknown(kind) => debug!(kind, "ignoring unknown message type"),
                    Decoded::Short => debug!(len = packet.len(), "ignoring short packet"),
                }
                Ok(())
            }
            LinkState::Busy => {
                // Longer packets are accepted for future protocol versions.
                if packet.len() < MAGIC.len() || packet[..MAGIC.len()] != MAGIC {
                    error!(len = packet.len(), "peer did not start with the magic string");
                    return Err(IcbError::MagicMismatch);
                }
                self.state = LinkState::Ready;
                info!(is_initiator = self.is_initiator, "link synchronized with peer");
                if let Err(e) = self.bind_pending() {
                    warn!(error = %e, "could not start endpoint bonding");
                }
                Ok(())
            }
        }
    }

    fn control_received(&mut self, msg: ControlMessage) {
        if msg.ept_addr as usize >= self.endpoints.capacity() {
            warn!(ept = msg.ept_addr, kind = ?msg.kind, "endpoint address out of range");
            return;
        }
        debug!(kind = ?msg.kind, ept = msg.ept_addr, block = msg.block_index, "control message received");

        let block = msg.block_index as usize;
        let result = match msg.kind {
            MsgType::Data => self.received_data(block, msg.ept_addr),
            MsgType::ReleaseData => self.received_release_data(block),
            MsgType::Bound => self.received_bound(block, msg.ept_addr),
            MsgType::ReleaseBound => self.received_release_bound(block, msg.ept_addr),
        };
        if let Err(e) = result {
            warn!(kind = ?msg.kind, ept = msg.ept_addr, block, error = %e, "control message rejected");
        }
    }

    fn received_data(&mut self, rx_block: usize, ept_addr: u8) -> Result<(), IcbError> {
        let (offset, size) = self.rx.buffer_from_index_validate_sized(rx_block)?;
        let local = self
            .endpoints
            .rx_validate(ept_addr)
            .ok_or(IcbError::EndpointNotReady { addr: ept_addr })?;

        self.rx_data.clear();
        self.rx_data.resize(size, 0);
        self.rx.read_data(offset, &mut self.rx_data)?;
        self.endpoints.deliver(local, &self.rx_data);

        // The sender's blocks come back whatever the handler did with the data.
        let wire = self.endpoints.wire_addr(local).unwrap_or(ept_addr);
        self.send_control_message(MsgType::ReleaseData, wire, rx_block as u8)
    }

    fn received_release_data(&mut self, tx_block: usize) -> Result<(), IcbError> {
        let (_, size) = self.tx.channel().buffer_from_index_validate_sized(tx_block)?;
        self.tx.release(tx_block, size);
        Ok(())
    }

    fn received_bound(&mut self, rx_block: usize, remote_addr: u8) -> Result<(), IcbError> {
        if self.is_initiator {
            return Err(IcbError::UnexpectedBound { addr: remote_addr });
        }
        let (offset, size) = self.rx.buffer_from_index_validate_sized(rx_block)?;
        self.rx_data.clear();
        self.rx_data.resize(size, 0);
        self.rx.read_data(offset, &mut self.rx_data)?;

        let name_len = self
            .rx_data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.rx_data.len());
        let Some(local) = self.endpoints.find_configured_by_name(&self.rx_data[..name_len]) else {
            debug!(remote = remote_addr, block = rx_block, "bound for unregistered name parked");
            self.endpoints.park(remote_addr, rx_block as u8);
            return Ok(());
        };

        self.endpoints.bind(local, remote_addr);
        self.send_control_message(MsgType::ReleaseBound, remote_addr, rx_block as u8)
    }

    fn received_release_bound(&mut self, tx_block: usize, ept_addr: u8) -> Result<(), IcbError> {
        let released = self.received_release_data(tx_block);
        if self.endpoints.rx_validate(ept_addr).is_none() {
            warn!(ept = ept_addr, "release bound for endpoint not bounding");
        }
        released
    }

    /// Follower: answers parked MSG_BOUND messages that now match a name.
    /// Those that still match nothing stay parked.
    fn replay_waiting_bounds(&mut self) {
        for remote in 0..self.endpoints.capacity() {
            let remote = remote as u8;
            if let Some(block) = self.endpoints.take_parked(remote) {
                if let Err(e) = self.received_bound(block as usize, remote) {
                    warn!(remote, block, error = %e, "parked bound rejected");
                }
            }
        }
    }

    fn start_bounding(&mut self, local: usize) -> Result<(), IcbError> {
        self.endpoints.start_bounding(local);
        let result = self.send_bound_message(local);
        if result.is_err() {
            self.endpoints.abort_bounding(local);
        }
        result
    }

    /// Sends the endpoint's NUL-terminated name in a new TX buffer.
    fn send_bound_message(&mut self, local: usize) -> Result<(), IcbError> {
        let mut name = self
            .endpoints
            .name(local)
            .ok_or(IcbError::InvalidEndpoint { addr: local as u8 })?
            .as_bytes()
            .to_vec();
        name.push(0);

        let buf = self.tx.alloc(name.len())?;
        if let Err(e) = self.tx.channel().write_data(buf.data_offset(), &name) {
            self.release_tx_buf(buf);
            return Err(e);
        }
        let wire = local as u8;
        self.send_block(MsgType::Bound, wire, buf.block_index() as usize, name.len())
    }

    fn ready_wire_addr(&self, addr: EndpointAddr) -> Result<u8, IcbError> {
        if !self.is_ready() {
            return Err(IcbError::Busy);
        }
        let local = addr.0 as usize;
        if local >= self.endpoints.len() {
            return Err(IcbError::InvalidEndpoint { addr: addr.0 });
        }
        if self.endpoints.state(local) != EndpointState::Ready {
            return Err(IcbError::EndpointNotReady { addr: addr.0 });
        }
        self.endpoints
            .wire_addr(local)
            .ok_or(IcbError::EndpointNotReady { addr: addr.0 })
    }

    /// Records `size` in the buffer header and sends the block. The blocks are
    /// freed again if the message cannot be enqueued.
    fn send_block(&mut self, kind: MsgType, wire: u8, tx_block: usize, size: usize) -> Result<(), IcbError> {
        let result = self
            .tx
            .channel()
            .set_header_size(tx_block, size)
            .and_then(|()| self.send_control_message(kind, wire, tx_block as u8));
        if let Err(e) = result {
            self.tx.release(tx_block, size);
            return Err(e);
        }
        Ok(())
    }

    fn send_control_message(&mut self, kind: MsgType, ept_addr: u8, block_index: u8) -> Result<(), IcbError> {
        if !self.is_ready() {
            return Err(IcbError::Busy);
        }
        let msg = ControlMessage::new(kind, ept_addr, block_index);
        self.tx_pb.write(&msg.to_bytes())?;
        self.doorbell.ring();
        debug!(kind = ?kind, ept = ept_addr, block = block_index, "control message sent");
        Ok(())
    }
}
