use icbmsg_core::{
    BlockChannel, CACHE_ALIGNMENT, EndpointAddr, InstanceConfig, IpcInstance, NoDoorbell, Pbuf,
    PbufConfig, TxAllocator, pbuf_header_overhead,
};
use icbmsg_shm::{HeapRegion, ShmView};
use std::time::Instant;

// ─── Statistics ─────────────────────────────────────────────────────────────

/// Per-operation latency distribution of one report row, in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Stats {
    pub min: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub max: u64,
}

impl Stats {
    /// Nearest-rank percentiles. `None` when there are no samples.
    pub fn from_samples(mut samples: Vec<u64>) -> Option<Self> {
        samples.sort_unstable();
        let last = samples.len().checked_sub(1)?;
        let rank = |permille: usize| {
            let idx = (samples.len() * permille).div_ceil(1000).saturating_sub(1);
            samples[idx.min(last)]
        };
        Some(Self {
            min: samples[0],
            p50: rank(500),
            p90: rank(900),
            p99: rank(990),
            p999: rank(999),
            max: samples[last],
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BenchResult {
    pub name: String,
    pub unit: &'static str,
    pub stats: Stats,
}

// ─── Measurement Harness ────────────────────────────────────────────────────

/// How one report row is sampled: `count` timed batches of `size` calls,
/// after `warmup` untimed batches.
#[derive(Debug, Clone, Copy)]
pub struct Batches {
    pub count: usize,
    pub size: usize,
    pub warmup: usize,
}

impl Batches {
    /// Short ring and allocator operations.
    pub const FAST: Self = Self {
        count: 1_000,
        size: 1_000,
        warmup: 10,
    };
    /// Link round trips, which drain both sides per call.
    pub const LINK: Self = Self {
        count: 500,
        size: 200,
        warmup: 5,
    };
}

/// Times `op` in batches and reports the mean cost per call of each batch.
pub fn measure<F: FnMut()>(name: &str, batches: Batches, mut op: F) -> BenchResult {
    let size = batches.size.max(1);
    for _ in 0..batches.warmup * size {
        op();
    }

    let per_op: Vec<u64> = (0..batches.count.max(1))
        .map(|_| {
            let start = Instant::now();
            for _ in 0..size {
                op();
            }
            (start.elapsed().as_nanos() / size as u128).max(1) as u64
        })
        .collect();

    BenchResult {
        name: name.to_string(),
        unit: "ns/op",
        stats: Stats::from_samples(per_op).unwrap_or_default(),
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────────────

pub fn temp_shm_path(label: &str) -> String {
    let pid = std::process::id();
    format!("/tmp/icbmsg_bench_{label}_{pid}")
}

/// Writer and reader of one pbuf with a data area of `data_len` bytes.
pub fn pbuf_pair(data_len: usize) -> (Pbuf, Pbuf) {
    let mem = ShmView::new(HeapRegion::new(data_len + pbuf_header_overhead(CACHE_ALIGNMENT)));
    let writer = Pbuf::init(PbufConfig::new(mem.clone(), CACHE_ALIGNMENT)).expect("pbuf layout");
    let reader = Pbuf::attach_reader(PbufConfig::new(mem, CACHE_ALIGNMENT)).expect("pbuf layout");
    (writer, reader)
}

pub fn tx_allocator(block_size: usize, block_count: usize) -> TxAllocator {
    let mem = ShmView::new(HeapRegion::new(block_size * block_count));
    TxAllocator::new(BlockChannel::new(mem, block_size, block_count).expect("block geometry"))
}

/// Both sides of a synchronized link with one endpoint bound on each.
pub struct LinkedPair {
    pub follower: IpcInstance,
    pub initiator: IpcInstance,
    pub follower_ept: EndpointAddr,
    pub initiator_ept: EndpointAddr,
}

impl LinkedPair {
    /// Region 0 carries follower → initiator traffic, region 1 the reverse.
    pub fn new(region_size: usize, cfg: InstanceConfig) -> Self {
        let mem = ShmView::new(HeapRegion::new(2 * region_size));
        let (low, high) = mem.split_at(region_size).expect("split regions");
        let mut follower = IpcInstance::open(cfg, &low, &high, NoDoorbell).expect("open follower");
        let mut initiator =
            IpcInstance::open(cfg.mirrored(), &high, &low, NoDoorbell).expect("open initiator");

        let follower_ept = follower
            .register_endpoint("bench", |_: &[u8]| {})
            .expect("register");
        let initiator_ept = initiator
            .register_endpoint("bench", |_: &[u8]| {})
            .expect("register");

        let mut pair = Self {
            follower,
            initiator,
            follower_ept,
            initiator_ept,
        };
        pair.pump();
        assert!(pair.initiator.endpoint_ready(pair.initiator_ept), "link did not bond");
        pair
    }

    /// Processes signals on both sides until the link is quiet.
    pub fn pump(&mut self) {
        loop {
            let handled = self.follower.process_signal().expect("follower drains")
                + self.initiator.process_signal().expect("initiator drains");
            if handled == 0 {
                return;
            }
        }
    }
}

// ─── Output ─────────────────────────────────────────────────────────────────

pub fn print_result_row(r: &BenchResult) {
    println!(
        "  {:<30} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  {}",
        r.name,
        r.stats.min,
        r.stats.p50,
        r.stats.p90,
        r.stats.p99,
        r.stats.p999,
        r.stats.max,
        r.unit,
    );
}

pub fn print_table_header() {
    println!(
        "  {:<30} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  unit",
        "Benchmark", "min", "p50", "p90", "p99", "p99.9", "max",
    );
    println!("  {}", "─".repeat(90));
}

pub fn section_header(title: &str) {
    println!("\n{}", "─".repeat(90));
    println!("  {title}");
    println!("{}\n", "─".repeat(90));
}
