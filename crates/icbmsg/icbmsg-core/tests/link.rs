//! Two link sides in one process over a heap-backed pair of regions.

use icbmsg_core::{
    BlockChannel, CACHE_ALIGNMENT, EndpointAddr, EndpointHandler, EndpointState, IcbError,
    InstanceConfig, IpcInstance, MAGIC, NoDoorbell, Pbuf, PbufConfig, RegionSplit,
};
use icbmsg_shm::{HeapRegion, ShmView};
use std::sync::{Arc, Mutex};

const REGION_SIZE: usize = 1024;

type Inbox = Arc<Mutex<Vec<Vec<u8>>>>;

fn inbox() -> (Inbox, impl FnMut(&[u8]) + Send + 'static) {
    let inbox: Inbox = Arc::default();
    let sink = inbox.clone();
    (inbox, move |data: &[u8]| sink.lock().unwrap().push(data.to_vec()))
}

/// Region 0 carries A→B, region 1 carries B→A. B's RX blocks sit lower, so B
/// is the initiator.
fn regions() -> (ShmView, ShmView) {
    let mem = ShmView::new(HeapRegion::new(2 * REGION_SIZE));
    mem.split_at(REGION_SIZE).expect("split")
}

fn open_pair() -> (IpcInstance, IpcInstance) {
    let (a_to_b, b_to_a) = regions();
    let cfg = InstanceConfig::default();
    let a = IpcInstance::open(cfg, &a_to_b, &b_to_a, NoDoorbell).expect("open a");
    let b = IpcInstance::open(cfg.mirrored(), &b_to_a, &a_to_b, NoDoorbell).expect("open b");
    (a, b)
}

/// Lets both sides handle signals until neither has anything left to read.
fn pump(a: &mut IpcInstance, b: &mut IpcInstance) {
    for _ in 0..32 {
        let handled = a.process_signal().expect("a drains") + b.process_signal().expect("b drains");
        if handled == 0 {
            return;
        }
    }
    panic!("link never went quiet");
}

#[test]
fn sides_synchronize_and_agree_on_initiator() {
    let (mut a, mut b) = open_pair();
    assert!(!a.is_ready() && !b.is_ready());
    assert!(!a.is_initiator());
    assert!(b.is_initiator());

    pump(&mut a, &mut b);
    assert!(a.is_ready() && b.is_ready());
}

#[test]
fn send_before_sync_is_busy() {
    let (mut a, mut b) = open_pair();
    let ept = b.register_endpoint("telemetry", |_: &[u8]| {}).expect("register");
    assert!(matches!(b.send(ept, &[1, 2, 3, 4]), Err(IcbError::Busy)));
    assert_eq!(b.tx_blocks_in_use(), 0);

    pump(&mut a, &mut b);
    // Synchronized, but nobody on A registered the name yet.
    assert_eq!(b.endpoint_state(ept), EndpointState::Bounding);
    assert!(matches!(
        b.send(ept, &[1]),
        Err(IcbError::EndpointNotReady { addr: 0 })
    ));
}

#[test]
fn telemetry_round_trip_returns_all_blocks() {
    let (mut a, mut b) = open_pair();
    let (a_inbox, a_handler) = inbox();
    let (b_inbox, b_handler) = inbox();

    let a_ept = a.register_endpoint("telemetry", a_handler).expect("register a");
    let b_ept = b.register_endpoint("telemetry", b_handler).expect("register b");
    pump(&mut a, &mut b);
    assert!(a.endpoint_ready(a_ept));
    assert!(b.endpoint_ready(b_ept));
    assert_eq!(b.tx_blocks_in_use(), 0, "bound name block released");

    b.send(b_ept, &[1, 2, 3, 4]).expect("send");
    assert_eq!(b.tx_blocks_in_use(), 1);
    pump(&mut a, &mut b);

    assert_eq!(*a_inbox.lock().unwrap(), vec![vec![1, 2, 3, 4]]);
    assert_eq!(b.tx_blocks_in_use(), 0);

    a.send(a_ept, b"pong").expect("send back");
    pump(&mut a, &mut b);
    assert_eq!(*b_inbox.lock().unwrap(), vec![b"pong".to_vec()]);
    assert_eq!(a.tx_blocks_in_use(), 0);
}

#[test]
fn bound_arriving_before_registration_is_parked_and_replayed() {
    let (mut a, mut b) = open_pair();
    let (a_inbox, a_handler) = inbox();

    let b_ept = b.register_endpoint("telemetry", |_: &[u8]| {}).expect("register b");
    b.register_endpoint("logs", |_: &[u8]| {}).expect("register b");
    pump(&mut a, &mut b);
    assert_eq!(a.pending_bounds(), 2);
    assert_eq!(b.tx_blocks_in_use(), 2);

    // Only one name matches; the other bound stays parked.
    let a_ept = a.register_endpoint("telemetry", a_handler).expect("register a");
    assert_eq!(a.pending_bounds(), 1);
    assert!(a.endpoint_ready(a_ept));

    pump(&mut a, &mut b);
    assert!(b.endpoint_ready(b_ept));
    assert_eq!(b.tx_blocks_in_use(), 1);

    b.send(b_ept, b"late").expect("send");
    pump(&mut a, &mut b);
    assert_eq!(*a_inbox.lock().unwrap(), vec![b"late".to_vec()]);

    a.register_endpoint("logs", |_: &[u8]| {}).expect("register a");
    pump(&mut a, &mut b);
    assert_eq!(a.pending_bounds(), 0);
    assert_eq!(b.tx_blocks_in_use(), 0);
}

#[test]
fn registration_order_may_differ_between_sides() {
    let (mut a, mut b) = open_pair();
    let (a_x, a_x_handler) = inbox();
    let (a_y, a_y_handler) = inbox();
    let (b_y, b_y_handler) = inbox();

    pump(&mut a, &mut b);
    let bx = b.register_endpoint("x", |_: &[u8]| {}).expect("register");
    let by = b.register_endpoint("y", b_y_handler).expect("register");
    let ay = a.register_endpoint("y", a_y_handler).expect("register");
    let ax = a.register_endpoint("x", a_x_handler).expect("register");
    pump(&mut a, &mut b);

    assert_eq!(ay, EndpointAddr(0));
    assert_eq!(a.endpoint_remote_addr(ay), Some(by.0));
    assert_eq!(a.endpoint_remote_addr(ax), Some(bx.0));

    b.send(bx, b"to x").expect("send");
    b.send(by, b"to y").expect("send");
    a.send(ay, b"from y").expect("send");
    pump(&mut a, &mut b);

    assert_eq!(*a_x.lock().unwrap(), vec![b"to x".to_vec()]);
    assert_eq!(*a_y.lock().unwrap(), vec![b"to y".to_vec()]);
    assert_eq!(*b_y.lock().unwrap(), vec![b"from y".to_vec()]);
}

#[test]
fn bound_callback_fires_once_per_side() {
    struct Bound(Arc<Mutex<u32>>);
    impl EndpointHandler for Bound {
        fn received(&mut self, _: &[u8]) {}
        fn bound(&mut self) {
            *self.0.lock().unwrap() += 1;
        }
    }

    let (mut a, mut b) = open_pair();
    let count = Arc::new(Mutex::new(0));
    a.register_endpoint("svc", Bound(count.clone())).expect("register");
    b.register_endpoint("svc", Bound(count.clone())).expect("register");
    pump(&mut a, &mut b);
    b.send(EndpointAddr(0), b"again").expect("send");
    pump(&mut a, &mut b);
    assert_eq!(*count.lock().unwrap(), 2);
}

#[test]
fn zero_copy_send_frees_unused_tail_blocks() {
    let (mut a, mut b) = open_pair();
    let (a_inbox, a_handler) = inbox();
    a.register_endpoint("bulk", a_handler).expect("register");
    let ept = b.register_endpoint("bulk", |_: &[u8]| {}).expect("register");
    pump(&mut a, &mut b);

    let buf = b.alloc_tx_buf(100).expect("alloc");
    let reserved = b.tx_blocks_in_use();
    assert!(reserved > 1);
    assert!(buf.capacity() >= 100);

    b.tx_buf_write(&buf, 0, b"head").expect("write");
    b.tx_buf_write(&buf, 4, b"-tail").expect("write");
    assert!(matches!(
        b.tx_buf_write(&buf, buf.capacity() - 1, b"xx"),
        Err(IcbError::PayloadTooLarge { .. })
    ));
    b.send_buf(ept, buf, 9).expect("send");
    assert_eq!(b.tx_blocks_in_use(), 1);

    pump(&mut a, &mut b);
    assert_eq!(*a_inbox.lock().unwrap(), vec![b"head-tail".to_vec()]);
    assert_eq!(b.tx_blocks_in_use(), 0);
}

#[test]
fn failed_or_dropped_tx_buffers_return_their_blocks() {
    let (mut a, mut b) = open_pair();
    let ept = b.register_endpoint("bulk", |_: &[u8]| {}).expect("register");
    pump(&mut a, &mut b);

    // Endpoint still BOUNDING: the buffer comes back with the error.
    let buf = b.alloc_tx_buf(10).expect("alloc");
    assert!(matches!(
        b.send_buf(ept, buf, 10),
        Err(IcbError::EndpointNotReady { .. })
    ));
    // One block is the name buffer of the pending bound.
    assert_eq!(b.tx_blocks_in_use(), 1);

    let buf = b.alloc_tx_buf(10).expect("alloc");
    let capacity = buf.capacity();
    assert!(matches!(
        b.send_buf(ept, buf, capacity + 1),
        Err(IcbError::PayloadTooLarge { .. })
    ));
    assert_eq!(b.tx_blocks_in_use(), 1);

    let buf = b.alloc_tx_buf(10).expect("alloc");
    b.release_tx_buf(buf);
    assert_eq!(b.tx_blocks_in_use(), 1);
}

#[test]
fn exhausting_blocks_recovers_after_release() {
    let (mut a, mut b) = open_pair();
    let (a_inbox, a_handler) = inbox();
    a.register_endpoint("bulk", a_handler).expect("register");
    let ept = b.register_endpoint("bulk", |_: &[u8]| {}).expect("register");
    pump(&mut a, &mut b);

    let payload = [0x5a; 80];
    let mut sent = 0;
    loop {
        match b.send(ept, &payload) {
            Ok(()) => sent += 1,
            Err(IcbError::OutOfBlocks { .. }) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(sent > 0);

    pump(&mut a, &mut b);
    assert_eq!(a_inbox.lock().unwrap().len(), sent);
    assert_eq!(b.tx_blocks_in_use(), 0);
    b.send(ept, &payload).expect("space again");
}

#[test]
fn bound_deferred_by_exhausted_blocks_is_sent_by_bind_pending() {
    let (mut a, mut b) = open_pair();
    pump(&mut a, &mut b);

    let mut held = Vec::new();
    while let Ok(buf) = b.alloc_tx_buf(1) {
        held.push(buf);
    }
    let ept = b.register_endpoint("svc", |_: &[u8]| {}).expect("register while full");
    assert_eq!(b.endpoint_state(ept), EndpointState::Configured);
    assert!(matches!(b.bind_pending(), Err(IcbError::OutOfBlocks { .. })));

    for buf in held {
        b.release_tx_buf(buf);
    }
    assert_eq!(b.tx_blocks_in_use(), 0);

    let (a_inbox, a_handler) = inbox();
    a.register_endpoint("svc", a_handler).expect("register a");
    assert_eq!(b.bind_pending().expect("bind"), 1);
    pump(&mut a, &mut b);

    assert!(b.endpoint_ready(ept));
    assert_eq!(b.endpoint_name(EndpointAddr(1)), None, "only one slot taken");
    assert_eq!(a.pending_bounds(), 0);
    assert_eq!(b.tx_blocks_in_use(), 0);

    b.send(ept, b"up").expect("send");
    pump(&mut a, &mut b);
    assert_eq!(*a_inbox.lock().unwrap(), vec![b"up".to_vec()]);
}

#[test]
fn bind_pending_tries_every_configured_endpoint() {
    let (mut a, mut b) = open_pair();
    pump(&mut a, &mut b);

    let mut held = Vec::new();
    while let Ok(buf) = b.alloc_tx_buf(1) {
        held.push(buf);
    }
    // A name block this long spans several blocks; the short one fits in one.
    let long_name = "l".repeat(120);
    let long = b.register_endpoint(&long_name, |_: &[u8]| {}).expect("register");
    let short = b.register_endpoint("s", |_: &[u8]| {}).expect("register");

    let spare = held.pop().expect("held a block");
    b.release_tx_buf(spare);
    assert!(matches!(b.bind_pending(), Err(IcbError::OutOfBlocks { .. })));
    assert_eq!(b.endpoint_state(long), EndpointState::Configured);
    assert_eq!(b.endpoint_state(short), EndpointState::Bounding);

    for buf in held {
        b.release_tx_buf(buf);
    }
    a.register_endpoint("s", |_: &[u8]| {}).expect("register a");
    a.register_endpoint(&long_name, |_: &[u8]| {}).expect("register a");
    assert_eq!(b.bind_pending().expect("bind"), 1);
    pump(&mut a, &mut b);

    assert!(b.endpoint_ready(long) && b.endpoint_ready(short));
    assert_eq!(a.pending_bounds(), 0);
    assert_eq!(b.tx_blocks_in_use(), 0);
}

#[test]
fn oversized_zero_copy_request_is_refused() {
    let (mut a, mut b) = open_pair();
    pump(&mut a, &mut b);
    assert!(matches!(b.alloc_tx_buf(usize::MAX), Err(IcbError::OutOfBlocks { .. })));
    assert_eq!(b.tx_blocks_in_use(), 0);
}

#[test]
fn sending_on_unknown_endpoint_is_rejected() {
    let (mut a, mut b) = open_pair();
    pump(&mut a, &mut b);
    assert!(matches!(
        b.send(EndpointAddr(3), b"x"),
        Err(IcbError::InvalidEndpoint { addr: 3 })
    ));
}

/// Drives one side of the link by hand so tests can send whatever bytes
/// they like.
struct RawPeer {
    tx: Pbuf,
    rx: Pbuf,
    blocks: BlockChannel,
}

impl RawPeer {
    fn new(tx_region: &ShmView, rx_region: &ShmView) -> Self {
        let cfg = InstanceConfig::default();
        let tx = RegionSplit::new(tx_region, cfg.tx_blocks, cfg.rx_blocks).expect("tx split");
        let rx = RegionSplit::new(rx_region, cfg.rx_blocks, cfg.tx_blocks).expect("rx split");
        Self {
            tx: Pbuf::init(PbufConfig::new(tx.icmsg, CACHE_ALIGNMENT)).expect("tx pbuf"),
            rx: Pbuf::attach_reader(PbufConfig::new(rx.icmsg, CACHE_ALIGNMENT)).expect("rx pbuf"),
            blocks: BlockChannel::new(tx.blocks, tx.layout.block_size, tx.layout.block_count)
                .expect("blocks"),
        }
    }

    fn packet(&mut self, bytes: &[u8]) {
        self.tx.write(bytes).expect("peer write");
    }

    fn block(&self, index: usize, data: &[u8]) {
        self.blocks.set_header_size(index, data.len()).expect("header");
        let offset = self.blocks.buffer_from_index_validate(index).expect("index");
        self.blocks.write_data(offset, data).expect("data");
    }

    fn received(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = self.rx.read(&mut buf).expect("peer read");
            if n == 0 {
                return out;
            }
            out.push(buf[..n].to_vec());
        }
    }
}

/// `a` is the follower, the raw peer plays the initiator.
fn follower_with_raw_peer() -> (IpcInstance, RawPeer) {
    let (a_to_b, b_to_a) = regions();
    let a = IpcInstance::open(InstanceConfig::default(), &a_to_b, &b_to_a, NoDoorbell).expect("open");
    let peer = RawPeer::new(&b_to_a, &a_to_b);
    (a, peer)
}

/// Synchronizes and bonds "telemetry" at remote address 0.
fn bonded_follower() -> (IpcInstance, RawPeer, Inbox) {
    let (mut a, mut peer) = follower_with_raw_peer();
    let (inbox, handler) = inbox();
    a.register_endpoint("telemetry", handler).expect("register");

    peer.packet(&MAGIC);
    peer.block(0, b"telemetry\0");
    peer.packet(&[2, 0, 0]);
    assert_eq!(a.process_signal().expect("drain"), 2);
    assert_eq!(peer.received(), vec![MAGIC.to_vec(), vec![3, 0, 0]]);
    (a, peer, inbox)
}

#[test]
fn first_packet_must_be_magic() {
    let (mut a, mut peer) = follower_with_raw_peer();
    peer.packet(b"not the magic");
    assert!(matches!(a.process_signal(), Err(IcbError::MagicMismatch)));
    assert!(!a.is_ready());

    let (mut a, mut peer) = follower_with_raw_peer();
    peer.packet(&MAGIC[..5]);
    assert!(matches!(a.process_signal(), Err(IcbError::MagicMismatch)));
}

#[test]
fn longer_magic_is_accepted() {
    let (mut a, mut peer) = follower_with_raw_peer();
    let mut extended = MAGIC.to_vec();
    extended.extend_from_slice(&[0x02, 0x00]);
    peer.packet(&extended);
    assert_eq!(a.process_signal().expect("drain"), 1);
    assert!(a.is_ready());
}

#[test]
fn data_is_delivered_and_released() {
    let (mut a, mut peer, inbox) = bonded_follower();
    peer.block(3, &[1, 2, 3, 4]);
    peer.packet(&[0, 0, 3]);
    a.process_signal().expect("drain");

    assert_eq!(*inbox.lock().unwrap(), vec![vec![1, 2, 3, 4]]);
    assert_eq!(peer.received(), vec![vec![1, 0, 3]]);
}

#[test]
fn corrupted_references_are_dropped_without_reply() {
    let (mut a, mut peer, inbox) = bonded_follower();

    // Index past the blocks area.
    peer.packet(&[0, 0, 200]);
    // Header claiming more than the area holds.
    peer.blocks.set_header_size(5, 100_000).expect("header");
    peer.packet(&[0, 0, 5]);
    // Endpoint address beyond the table.
    peer.block(6, b"x");
    peer.packet(&[0, 9, 6]);
    // Endpoint address inside the table but never bound.
    peer.packet(&[0, 4, 6]);
    // Release for a block we never had.
    peer.packet(&[1, 0, 200]);

    assert_eq!(a.process_signal().expect("drain"), 5);
    assert!(inbox.lock().unwrap().is_empty());
    assert!(peer.received().is_empty());

    // The link keeps working.
    peer.block(1, b"ok");
    peer.packet(&[0, 0, 1]);
    a.process_signal().expect("drain");
    assert_eq!(*inbox.lock().unwrap(), vec![b"ok".to_vec()]);
}

#[test]
fn unknown_message_types_and_short_packets_are_skipped() {
    let (mut a, mut peer, inbox) = bonded_follower();
    peer.packet(&[9, 0, 0]);
    peer.packet(&[0, 0]);
    peer.block(2, b"after");
    peer.packet(&[0, 0, 2]);

    assert_eq!(a.process_signal().expect("drain"), 3);
    assert_eq!(*inbox.lock().unwrap(), vec![b"after".to_vec()]);
}

#[test]
fn oversized_packet_stays_queued() {
    let (mut a, mut peer, inbox) = bonded_follower();
    peer.packet(&[0u8; 200]);
    peer.block(2, b"behind");
    peer.packet(&[0, 0, 2]);

    assert_eq!(a.process_signal().expect("drain"), 0);
    assert_eq!(a.process_signal().expect("drain"), 0);
    assert!(inbox.lock().unwrap().is_empty());
}

#[test]
fn initiator_rejects_bound_messages() {
    let (a_to_b, b_to_a) = regions();
    // Swapped regions make the instance the initiator.
    let mut a = IpcInstance::open(InstanceConfig::default(), &b_to_a, &a_to_b, NoDoorbell).expect("open");
    let mut peer = RawPeer::new(&a_to_b, &b_to_a);
    assert!(a.is_initiator());

    a.register_endpoint("svc", |_: &[u8]| {}).expect("register");
    peer.packet(&MAGIC);
    peer.block(0, b"svc\0");
    peer.packet(&[2, 0, 0]);
    assert_eq!(a.process_signal().expect("drain"), 2);

    // Magic, then the initiator's own MSG_BOUND; no MSG_RELEASE_BOUND.
    let replies = peer.received();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0], MAGIC.to_vec());
    assert_eq!(replies[1][0], 2);
    assert_eq!(a.endpoint_state(EndpointAddr(0)), EndpointState::Bounding);
}

#[test]
fn corrupted_peer_cursor_is_reported() {
    let (a_to_b, b_to_a) = regions();
    let mut a = IpcInstance::open(InstanceConfig::default(), &a_to_b, &b_to_a, NoDoorbell).expect("open");
    let split = RegionSplit::new(&b_to_a, 16, 16).expect("split");
    // wr_idx of the RX pbuf, misaligned.
    split.icmsg.store_u32(CACHE_ALIGNMENT, 3).expect("store");
    assert!(matches!(a.process_signal(), Err(IcbError::Pbuf(_))));
}
