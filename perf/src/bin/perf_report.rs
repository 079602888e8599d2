use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use icbmsg_core::{IcbError, InstanceConfig, IpcInstance, NoDoorbell, PbufError};
use icbmsg_perf::*;
use icbmsg_shm::{MmapRegion, ShmView};

const REGION_SIZE: usize = 4096;
const STREAM_MESSAGES: u64 = 200_000;

/// Result of streaming messages between two threads over a mapped file.
#[derive(Debug, Default, serde::Serialize)]
struct StreamDiag {
    messages: u64,
    elapsed_ns: u64,
    msgs_per_sec: f64,
    send_retries: u64,
}

fn main() {
    let mut results: Vec<BenchResult> = Vec::new();

    // ═══════════════════════════════════════════════════════════════════════
    // 1. Packet ring
    // ═══════════════════════════════════════════════════════════════════════
    section_pbuf(&mut results);

    // ═══════════════════════════════════════════════════════════════════════
    // 2. Block allocator
    // ═══════════════════════════════════════════════════════════════════════
    section_blocks(&mut results);

    // ═══════════════════════════════════════════════════════════════════════
    // 3. Single-thread link (send + both sides drained)
    // ═══════════════════════════════════════════════════════════════════════
    section_link(&mut results);

    // ═══════════════════════════════════════════════════════════════════════
    // 4. Two threads over a file-backed mapping
    // ═══════════════════════════════════════════════════════════════════════
    let stream = section_stream();

    // ═══════════════════════════════════════════════════════════════════════
    // 5. JSON Output
    // ═══════════════════════════════════════════════════════════════════════
    save_results(&results, &stream);
}

fn section_pbuf(results: &mut Vec<BenchResult>) {
    section_header("pbuf: write + read of one control message");
    print_table_header();

    for &data_len in &[64usize, 312, 4096] {
        let (mut writer, mut reader) = pbuf_pair(data_len);
        let mut buf = [0u8; 16];
        let r = measure(&format!("write+read (len {data_len})"), Batches::FAST, || {
            writer.write(black_box(&[0u8, 1, 2][..])).expect("write");
            black_box(reader.read(&mut buf).expect("read"));
        });
        print_result_row(&r);
        results.push(r);
    }
}

fn section_blocks(results: &mut Vec<BenchResult>) {
    section_header("blocks: alloc + release");
    print_table_header();

    for &size in &[8usize, 200, 1000] {
        let mut tx = tx_allocator(236, 16);
        let r = measure(&format!("alloc+release ({size} B)"), Batches::FAST, || {
            let buf = tx.alloc(black_box(size)).expect("alloc");
            tx.release(buf.block_index() as usize, size);
        });
        print_result_row(&r);
        results.push(r);
    }
}

fn section_link(results: &mut Vec<BenchResult>) {
    section_header("link: send, deliver, release (one thread)");
    print_table_header();

    for &size in &[4usize, 64, 200] {
        let mut pair = LinkedPair::new(REGION_SIZE, InstanceConfig::default());
        let payload = vec![0xa5u8; size];
        let ept = pair.initiator_ept;
        let r = measure(&format!("round trip ({size} B)"), Batches::LINK, || {
            pair.initiator.send(ept, black_box(&payload)).expect("send");
            pair.pump();
        });
        print_result_row(&r);
        results.push(r);
    }
}

fn section_stream() -> StreamDiag {
    section_header("stream: initiator → follower on separate threads");

    let path = temp_shm_path("stream");
    let mem = ShmView::new(
        MmapRegion::create_rw(&path, 2 * REGION_SIZE as u64).expect("create shared file"),
    );
    let (low, high) = mem.split_at(REGION_SIZE).expect("split regions");
    let cfg = InstanceConfig::default();

    let received = Arc::new(AtomicU64::new(0));
    let counter = received.clone();
    let mut follower = IpcInstance::open(cfg, &low, &high, NoDoorbell).expect("open follower");
    let mut initiator = IpcInstance::open(cfg.mirrored(), &high, &low, NoDoorbell).expect("open initiator");
    follower
        .register_endpoint("stream", move |_: &[u8]| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .expect("register");
    let ept = initiator.register_endpoint("stream", |_: &[u8]| {}).expect("register");

    let consumer = std::thread::spawn(move || {
        while received.load(Ordering::Relaxed) < STREAM_MESSAGES {
            if follower.process_signal().expect("follower drains") == 0 {
                std::hint::spin_loop();
            }
        }
    });

    while !initiator.endpoint_ready(ept) {
        initiator.process_signal().expect("initiator drains");
    }

    let start = Instant::now();
    let mut retries = 0u64;
    for seq in 0..STREAM_MESSAGES {
        loop {
            match initiator.send(ept, &seq.to_le_bytes()) {
                Ok(()) => break,
                Err(IcbError::OutOfBlocks { .. }) | Err(IcbError::Pbuf(PbufError::NoSpace)) => {
                    retries += 1;
                    initiator.process_signal().expect("initiator drains");
                }
                Err(e) => panic!("send failed: {e}"),
            }
        }
    }
    consumer.join().expect("consumer thread");
    let elapsed = start.elapsed();

    let _ = std::fs::remove_file(&path);

    let diag = StreamDiag {
        messages: STREAM_MESSAGES,
        elapsed_ns: elapsed.as_nanos() as u64,
        msgs_per_sec: STREAM_MESSAGES as f64 / elapsed.as_secs_f64(),
        send_retries: retries,
    };
    println!("  messages:     {}", diag.messages);
    println!("  elapsed:      {elapsed:?}");
    println!("  throughput:   {:.0} msg/s", diag.msgs_per_sec);
    println!("  send retries: {}", diag.send_retries);
    diag
}

fn save_results(results: &[BenchResult], stream: &StreamDiag) {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let results_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/results");
    let _ = std::fs::create_dir_all(results_dir);
    let json_path = format!("{results_dir}/{timestamp}_report.json");

    let output = serde_json::json!({
        "report_type": "icbmsg",
        "timestamp": timestamp,
        "benchmarks": results,
        "stream": stream,
    });

    let bar = "\u{2550}".repeat(90);
    let written = serde_json::to_string_pretty(&output)
        .map_err(std::io::Error::other)
        .and_then(|json| std::fs::write(&json_path, json));
    match written {
        Ok(()) => {
            println!("\n{bar}");
            println!("  Results saved to: {json_path}");
            println!("{bar}\n");
        }
        Err(e) => eprintln!("\n  [failed to save results: {e}]\n"),
    }
}
