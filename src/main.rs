// FASTPATH — Executive
// Loopback demo of the full data-plane flow: a producer thread synthesizes
// tunnel packets into the ring; the dispatcher drains slots, submits crypto
// jobs, awaits them in submission order, feeds the burst tracker and the
// pacing gate, and accounts egress. Real deployments replace the producer
// with the tunnel reader and the sink with the connection-pool egress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fastpath::boundary::Substrate;
use fastpath::config::Config;
use fastpath::engine::burst::BurstLevel;
use fastpath::engine::caps;
use fastpath::engine::runtime::clock_ns;
use fastpath::engine::slot::{META_FLAG_CRYPTO, META_FLAG_PRIO_HIGH};
use fastpath::network::pacer::PacingGate;
use fastpath::network::sched::{EgressFrame, EgressScheduler};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
extern "C" fn signal_handler(_sig: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn main() {
    // SAFETY: signal_handler has a stable address and only performs a
    // single relaxed atomic store, which is async-signal-safe per POSIX.
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
    }

    let args: Vec<String> = std::env::args().collect();
    let mut packet_count: u64 = 100_000;
    let mut payload_len: usize = 1200;
    let mut show_stats = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--packets" | "-n" => {
                i += 1;
                if i < args.len() {
                    packet_count = args[i].parse().unwrap_or(packet_count);
                }
            }
            "--payload" => {
                i += 1;
                if i < args.len() {
                    payload_len = args[i].parse().unwrap_or(payload_len);
                }
            }
            "--stats" => {
                show_stats = true;
            }
            other => {
                eprintln!("[FP-EXEC] Unknown argument: {}", other);
                eprintln!("usage: fastpath [--packets N] [--payload BYTES] [--stats]");
                std::process::exit(2);
            }
        }
        i += 1;
    }

    let mask = caps::caps_mask();
    eprintln!(
        "[FP-EXEC] CPU caps: 0x{:x} (simd={} aes={})",
        mask,
        caps::has_simd(),
        caps::has_aes()
    );

    let cfg = Config::from_env().normalized();
    // Demo key material; production receives the master secret from the
    // key-management layer above.
    let master: [u8; 32] = rand::random();
    let substrate = match Substrate::new(&cfg, &master) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("[FP-EXEC] FATAL: substrate init failed: {}", e);
            std::process::exit(1);
        }
    };
    eprintln!(
        "[FP-EXEC] Ring {} slots x {}B slab, {} crypto workers, pool {:?}",
        cfg.ring_capacity,
        cfg.ring_payload_size,
        substrate.crypto_workers(),
        substrate.conns.class_sizes()
    );

    // ── Producer: the stand-in tunnel reader ────────────────────────────
    let prod_sub = substrate.clone();
    let producer = std::thread::Builder::new()
        .name("fp-producer".into())
        .spawn(move || {
            let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();
            let mut written = 0u64;
            let mut full_backoffs = 0u64;
            while written < packet_count && !SHUTDOWN.load(Ordering::Relaxed) {
                // Every 64th packet rides the latency-sensitive class.
                let flags = if written % 64 == 0 {
                    META_FLAG_CRYPTO | META_FLAG_PRIO_HIGH
                } else {
                    META_FLAG_CRYPTO
                };
                let rc = prod_sub.ring_write(&payload, clock_ns(), flags, 0);
                if rc > 0 {
                    written += 1;
                } else if rc == 0 {
                    // Ring full: producer back-pressure.
                    full_backoffs += 1;
                    std::thread::yield_now();
                } else {
                    break;
                }
            }
            eprintln!(
                "[FP-EXEC] Producer done: {} packets, {} full-backoffs",
                written, full_backoffs
            );
            written
        })
        .expect("producer spawn failed");

    // ── Dispatcher: drain → submit → await in order → pace → schedule ──
    let mut gate = PacingGate::new(cfg.link_bps);
    let mut sched = EgressScheduler::new();
    let mut inflight: Vec<(u64, u16)> = Vec::with_capacity(cfg.batch_size);
    let mut forwarded = 0u64;
    let mut failed = 0u64;
    let mut bytes_out = 0u64;
    let mut drain_grace = false;
    let start_ns = clock_ns();

    while forwarded + failed < packet_count && !SHUTDOWN.load(Ordering::Relaxed) {
        // Drain up to one batch of slots into crypto jobs.
        inflight.clear();
        while inflight.len() < cfg.batch_size {
            let sh = substrate.ring_read();
            if sh <= 0 {
                break;
            }
            let Some(meta) = substrate.slot_meta(sh as u64) else {
                failed += 1;
                continue;
            };
            substrate.burst_update(meta.length as u64, meta.timestamp_ns);
            let jh = substrate.crypto_submit(sh as u64);
            if jh > 0 {
                inflight.push((jh as u64, meta.flags));
            } else {
                failed += 1;
            }
        }
        if inflight.is_empty() && sched.is_empty() {
            // One grace pass after the producer exits so its final writes
            // (visible after is_finished) are drained before stopping.
            if producer.is_finished() {
                if drain_grace {
                    break;
                }
                drain_grace = true;
            }
            std::thread::yield_now();
            continue;
        }

        // Await in submission order: the ring gave us FIFO, the pool gives
        // us parallelism, ordering is re-imposed here. Each ciphertext gets
        // a departure time from the pacing gate and queues for egress.
        let level = BurstLevel::from_u32(substrate.burst_level() as u32);
        for &(jh, flags) in &inflight {
            let n = substrate.crypto_await(jh, 1000);
            if n > 0 {
                let frame = EgressFrame {
                    job_handle: jh,
                    len: n as u32,
                    release_ns: gate.pace(clock_ns(), n as u32, level),
                };
                let queued = if flags & META_FLAG_PRIO_HIGH != 0 {
                    sched.enqueue_critical(frame)
                } else {
                    sched.enqueue_bulk(frame)
                };
                if !queued {
                    // Egress queue full: drop, release, account.
                    substrate.crypto_release(jh);
                    failed += 1;
                }
            } else {
                substrate.crypto_release(jh);
                failed += 1;
            }
        }

        // Emit everything whose departure time has arrived. The demo sink
        // just counts; real deployments hand the bytes to the egress
        // writer over a pool socket here.
        while let Some(frame) = sched.dequeue_ready(clock_ns()) {
            bytes_out += frame.len as u64;
            substrate.crypto_release(frame.job_handle);
            forwarded += 1;
        }
    }

    // Flush the tail of the egress queue.
    while !sched.is_empty() {
        if let Some(frame) = sched.dequeue_ready(clock_ns()) {
            bytes_out += frame.len as u64;
            substrate.crypto_release(frame.job_handle);
            forwarded += 1;
        } else {
            std::thread::yield_now();
        }
    }

    let produced = producer.join().unwrap_or(0);
    let elapsed_ns = clock_ns().saturating_sub(start_ns).max(1);
    let mbps = bytes_out as f64 * 8.0 / (elapsed_ns as f64 / 1e9) / 1e6;
    eprintln!(
        "[FP-EXEC] Done: produced={} forwarded={} failed={} bytes_out={} ({:.1} Mbit/s) burst_level={} paced={}",
        produced,
        forwarded,
        failed,
        bytes_out,
        mbps,
        substrate.burst_level(),
        gate.paced_count()
    );

    if show_stats {
        for s in substrate.crypto_stats() {
            eprintln!(
                "[FP-EXEC]   worker {}: packets={} bytes={} last_ts={}",
                s.worker_id, s.packets, s.bytes, s.last_timestamp_ns
            );
        }
    }
}
