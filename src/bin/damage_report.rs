//! damage-report: example reporting client for the damage transport.
//!
//! Exercises the full non-blocking poll + drain workflow against a
//! synthetic producer thread: every request shape, injected copy faults,
//! ignored non-update requests, and overflow under pressure. Prints one
//! line per delivered record with every field, no matter the format (the
//! transport guarantees sane defaults for fields a shape does not carry).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use fbdamage::raw::{
    LocalMemory, RawAltBuffer, RawAltBufferNtx, RawDisp2Update, RawRect, RawUpdateV1,
    RawUpdateV1Ntx, RawUpdateV2, REQ_EINK_UPDATE2, REQ_SEND_UPDATE_V1, REQ_SEND_UPDATE_V1_NTX,
    REQ_SEND_UPDATE_V2,
};
use fbdamage::{DamageError, DamageProducer, DamageTracker, DamageUpdate};

/// Report configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Config {
    /// Ring capacity (power of two).
    ring_capacity: usize,
    /// Total synthetic update requests to produce.
    events: u64,
    /// Producer rate in events per second.
    rate_hz: u32,
    /// Inject a copy fault every Nth event (0 disables).
    fault_every: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ring_capacity: 64,
            events: 200,
            rate_hz: 500,
            fault_every: 13,
        }
    }
}

impl Config {
    /// Load configuration from file, or use defaults if the file doesn't
    /// exist (auto-generating it for next time).
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Config file not found at {:?}, using defaults", path);
            if let Err(e) = Self::save_default(path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    fn save_default(path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;
        std::fs::write(path, toml_string).context("Failed to write default config file")?;
        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Simple rolling-average event rate counter.
struct EventRate {
    last_report: Instant,
    count: u32,
    report_interval: Duration,
}

impl EventRate {
    fn new() -> Self {
        Self {
            last_report: Instant::now(),
            count: 0,
            report_interval: Duration::from_millis(500),
        }
    }

    /// Call after each delivered record.
    /// Returns Some(rate) when a new measurement is available.
    fn tick(&mut self) -> Option<f64> {
        self.count += 1;

        let elapsed = self.last_report.elapsed();
        if elapsed >= self.report_interval {
            let rate = f64::from(self.count) / elapsed.as_secs_f64();
            self.count = 0;
            self.last_report = Instant::now();
            Some(rate)
        } else {
            None
        }
    }
}

// Staging addresses for the synthetic requests.
const UPDATE_ARG: u64 = 0x1000;
const DISP2_DESCRIPTOR: u64 = 0x5000;
const DISP2_ROTATION: u64 = 0x6000;
const FAULT_ARG: u64 = 0xF000;

/// Produce `events` synthetic update requests, cycling through every
/// shape, with periodic copy faults and the odd unrelated request mixed in.
fn produce(mut producer: DamageProducer, config: Config, done: Arc<AtomicBool>) {
    let mut mem = LocalMemory::new();
    mem.poison(FAULT_ARG);
    let pause = Duration::from_secs_f64(1.0 / f64::from(config.rate_hz.max(1)));

    for n in 0..config.events {
        let marker = n as u32;
        let region = RawRect {
            top: (marker % 8) * 100,
            left: 0,
            width: 600,
            height: 100,
        };

        if config.fault_every != 0 && n % config.fault_every == config.fault_every - 1 {
            // Payload that cannot be copied in: recorded as an ERROR event.
            producer.capture(REQ_SEND_UPDATE_V2, FAULT_ARG, &mem);
        } else {
            match n % 4 {
                0 => {
                    mem.stage(
                        UPDATE_ARG,
                        &RawUpdateV1Ntx {
                            update_region: region,
                            waveform_mode: 2,
                            update_mode: 0,
                            update_marker: marker,
                            temp: 21,
                            flags: 0x0100,
                            alt_buffer_data: RawAltBufferNtx {
                                virt_addr: 0x7F00_0000,
                                phys_addr: 0x8000_0000,
                                width: 600,
                                height: 800,
                                alt_update_region: region,
                                ..Default::default()
                            },
                            ..Default::default()
                        },
                    );
                    producer.capture(REQ_SEND_UPDATE_V1_NTX, UPDATE_ARG, &mem);
                }
                1 => {
                    mem.stage(
                        UPDATE_ARG,
                        &RawUpdateV1 {
                            update_region: region,
                            waveform_mode: 3,
                            update_mode: 0,
                            update_marker: marker,
                            temp: 21,
                            flags: 0,
                            alt_buffer_data: RawAltBuffer::default(),
                        },
                    );
                    producer.capture(REQ_SEND_UPDATE_V1, UPDATE_ARG, &mem);
                }
                2 => {
                    mem.stage(
                        UPDATE_ARG,
                        &RawUpdateV2 {
                            update_region: region,
                            waveform_mode: 2,
                            update_mode: 1,
                            update_marker: marker,
                            temp: 0x1000,
                            flags: 0x2000,
                            dither_mode: 1,
                            quant_bit: 4,
                            alt_buffer_data: RawAltBuffer::default(),
                        },
                    );
                    producer.capture(REQ_SEND_UPDATE_V2, UPDATE_ARG, &mem);
                }
                _ => {
                    mem.stage(
                        DISP2_DESCRIPTOR,
                        &RawDisp2Update {
                            area: region,
                            layer_num: 1,
                            update_mode: 1,
                            waveform_mode: 4,
                            update_marker: marker,
                            temp: 19,
                            flags: 0,
                            pen_mode: marker % 2,
                        },
                    );
                    mem.stage(DISP2_ROTATION, &((marker % 4) * 90));
                    mem.stage(UPDATE_ARG, &[DISP2_DESCRIPTOR, DISP2_ROTATION, 0u64, 0u64]);
                    producer.capture(REQ_EINK_UPDATE2, UPDATE_ARG, &mem);
                }
            }
        }

        // Unrelated intercepted requests never reach the ring.
        if n % 17 == 0 {
            producer.capture(0x5441, 0, &mem);
        }

        std::thread::sleep(pause);
    }

    done.store(true, Ordering::Release);
}

fn print_update(update: &DamageUpdate) {
    let data = &update.data;
    println!(
        "[{}.{:09}] {}: overflow_notify={}, queue_size={} {{update_region={{top={}, left={}, width={}, height={}}}, \
         waveform_mode={}, update_mode={:?}, update_marker={}, temp={}, flags={:#06x}, \
         dither_mode={}, quant_bit={}, rotation={}, pen_mode={}, \
         alt_buffer_data={{virt_addr={:#x}, phys_addr={:#x}, width={}, height={}, \
         alt_update_region={{top={}, left={}, width={}, height={}}}}}}}",
        update.timestamp / 1_000_000_000,
        update.timestamp % 1_000_000_000,
        update.format.label(),
        update.overflow_notify,
        update.queue_size,
        data.update_region.top,
        data.update_region.left,
        data.update_region.width,
        data.update_region.height,
        data.waveform_mode,
        data.update_mode,
        data.update_marker,
        data.temp,
        data.flags.bits(),
        data.dither_mode,
        data.quant_bit,
        data.rotation,
        data.pen_mode,
        data.alt_buffer.virt_addr,
        data.alt_buffer.phys_addr,
        data.alt_buffer.width,
        data.alt_buffer.height,
        data.alt_buffer.alt_update_region.top,
        data.alt_buffer.alt_update_region.left,
        data.alt_buffer.alt_update_region.width,
        data.alt_buffer.alt_update_region.height,
    );
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "damage-report.toml".into());
    let config = Config::load(Path::new(&config_path))?;
    debug!("Config: {:?}", config);
    anyhow::ensure!(
        config.ring_capacity.is_power_of_two(),
        "ring_capacity must be a power of two, got {}",
        config.ring_capacity
    );

    let tracker = Arc::new(DamageTracker::with_capacity(config.ring_capacity));
    let producer = tracker
        .producer()
        .context("Failed to claim the producer handle")?;
    let mut reader = tracker.open().context("Failed to open the reader session")?;

    let done = Arc::new(AtomicBool::new(false));
    let producer_done = Arc::clone(&done);
    let producer_config = config.clone();
    let producer_thread =
        std::thread::spawn(move || produce(producer, producer_config, producer_done));

    let mut rate = EventRate::new();
    let mut delivered = 0u64;
    let mut dropped = 0u64;

    // Non-blocking poll + drain workflow; blocking reads work just as well
    // if that's more your speed.
    loop {
        match reader.try_read() {
            Ok(update) => {
                delivered += 1;
                dropped += u64::from(update.overflow_notify);
                print_update(&update);
                if let Some(rate) = rate.tick() {
                    info!("Draining {:.0} events/sec", rate);
                }
            }
            Err(DamageError::WouldBlock) => {
                if done.load(Ordering::Acquire) && !reader.poll_ready() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => return Err(err).context("Damage read failed"),
        }
    }

    producer_thread
        .join()
        .map_err(|_| anyhow::anyhow!("Producer thread panicked"))?;

    info!(
        delivered,
        dropped,
        rotation = tracker.last_rotation(),
        "Report complete"
    );
    Ok(())
}
