//! icbmsg-node: runs one core of an ICBMsg link over a file-backed mapping.
//!
//! # Usage
//!
//! ```bash
//! icbmsg-node --config link.toml --side a
//! icbmsg-node --config link.toml --side b
//! ```
//!
//! Side A creates the mapping, so start it first. Each side registers the
//! configured endpoints and, once they are bound, sends an incrementing
//! counter on each of them every `telemetry_interval_ms`.

use anyhow::{Context, bail};
use clap::Parser;
use icbmsg_config::{LinkConfig, Side};
use icbmsg_core::{EndpointAddr, EndpointHandler, IcbError, IpcInstance, NoDoorbell};
use icbmsg_shm::{MmapRegion, ShmView};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// How long side B waits for side A to create the mapping.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "icbmsg-node")]
#[command(about = "One side of an ICBMsg shared memory link")]
struct Args {
    /// Link configuration (TOML)
    #[arg(long)]
    config: String,

    /// Which core of the link to run: "a" creates the mapping, "b" opens it
    #[arg(long)]
    side: Side,

    /// Stop after this many seconds instead of running forever
    #[arg(long)]
    duration_secs: Option<u64>,
}

/// Logs every counter received on one endpoint.
struct TelemetryLogger {
    name: String,
    received: u64,
}

impl EndpointHandler for TelemetryLogger {
    fn received(&mut self, data: &[u8]) {
        self.received += 1;
        match <[u8; 8]>::try_from(data) {
            Ok(bytes) => debug!(
                endpoint = %self.name,
                counter = u64::from_le_bytes(bytes),
                total = self.received,
                "telemetry received"
            ),
            Err(_) => debug!(endpoint = %self.name, len = data.len(), "payload received"),
        }
    }

    fn bound(&mut self) {
        info!(endpoint = %self.name, "endpoint ready for telemetry");
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = LinkConfig::load(args.config.as_str())
        .with_context(|| format!("loading {}", args.config))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mem = map_shared_file(&config, args.side)?;
    let region = |index: usize| mem.subview(index * config.region_size, config.region_size);
    let tx = region(args.side.tx_region()).context("tx region")?;
    let rx = region(args.side.rx_region()).context("rx region")?;

    let mut inst = IpcInstance::open(config.instance_config(args.side), &tx, &rx, NoDoorbell)
        .context("opening link")?;
    info!(
        side = %args.side,
        initiator = inst.is_initiator(),
        path = %config.shm_file_path,
        "link opened, waiting for peer"
    );

    let mut endpoints = Vec::with_capacity(config.endpoints.len());
    for ept in &config.endpoints {
        let handler = TelemetryLogger {
            name: ept.name.clone(),
            received: 0,
        };
        let addr = inst
            .register_endpoint(&ept.name, handler)
            .with_context(|| format!("registering endpoint '{}'", ept.name))?;
        endpoints.push((ept.name.as_str(), addr));
    }

    run(&mut inst, &endpoints, &config, args.duration_secs.map(Duration::from_secs))
}

/// Side A creates the mapping; side B waits until it exists at full size.
fn map_shared_file(config: &LinkConfig, side: Side) -> anyhow::Result<ShmView> {
    let path = config.shm_file_path.as_str();
    let size = config.mapping_size();
    let region = match side {
        Side::A => MmapRegion::create_rw(path, size as u64)
            .with_context(|| format!("creating {path}"))?,
        Side::B => {
            let deadline = Instant::now() + OPEN_TIMEOUT;
            loop {
                let ready = std::fs::metadata(path).is_ok_and(|m| m.len() >= size as u64);
                if ready {
                    break MmapRegion::open_rw(path).with_context(|| format!("opening {path}"))?;
                }
                if Instant::now() >= deadline {
                    bail!("{path} did not appear with {size} bytes within {OPEN_TIMEOUT:?}");
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    };
    Ok(ShmView::new(region))
}

fn run(
    inst: &mut IpcInstance,
    endpoints: &[(&str, EndpointAddr)],
    config: &LinkConfig,
    duration: Option<Duration>,
) -> anyhow::Result<()> {
    let interval = Duration::from_millis(config.telemetry_interval_ms);
    let started = Instant::now();
    let mut last_tick = Instant::now();
    let mut counter = 0u64;

    loop {
        match inst.process_signal() {
            Ok(0) => std::thread::sleep(Duration::from_micros(50)),
            Ok(_) => {}
            Err(e @ IcbError::MagicMismatch) => return Err(e).context("peer handshake failed"),
            Err(e) => warn!(error = %e, "receive failed"),
        }

        if inst.is_ready() && last_tick.elapsed() >= interval {
            last_tick = Instant::now();
            counter += 1;
            for &(name, addr) in endpoints {
                if !inst.endpoint_ready(addr) {
                    continue;
                }
                match inst.send(addr, &counter.to_le_bytes()) {
                    Ok(()) => debug!(endpoint = name, counter, "telemetry sent"),
                    Err(e) => warn!(endpoint = name, error = %e, "telemetry not sent"),
                }
            }
            info!(counter, tx_blocks_in_use = inst.tx_blocks_in_use(), "telemetry tick");
        }

        if duration.is_some_and(|d| started.elapsed() >= d) {
            info!("run time elapsed, exiting");
            return Ok(());
        }
    }
}
