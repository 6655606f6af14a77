// FASTPATH — INTEGRATION TESTS
// Exercises the full substrate flow: ring transport → crypto pool →
// connection pool egress, plus the boundary surface conventions. Socket
// tests run against local listeners on 127.0.0.1 — no privileges needed.

use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use fastpath::boundary::Substrate;
use fastpath::config::Config;
use fastpath::cryptography::aead::{self, DIR_EGRESS, TAG_LEN};
use fastpath::cryptography::pool::CryptoPool;
use fastpath::engine::burst::{BurstConfig, BurstLevel, BurstTracker};
use fastpath::engine::slot::META_FLAG_CRYPTO;
use fastpath::network::conn::{ConnectionPool, ConnectProgress, TrafficClass};

const MASTER: [u8; 32] = [0x3Cu8; 32];

fn test_config() -> Config {
    Config {
        ring_capacity: 64,
        ring_payload_size: 512,
        worker_count: 4,
        ..Config::default()
    }
}

// ============================================================================
// RING → CRYPTO → VERIFY: the §2 data flow end to end
// ============================================================================

#[test]
fn pipeline_encrypts_ring_traffic_in_order() {
    let s = Substrate::new(&test_config(), &MASTER).unwrap();
    let key = aead::derive_job_key(&MASTER, DIR_EGRESS).unwrap();

    let payloads: Vec<Vec<u8>> = (0..32).map(|i| vec![i as u8 ^ 0x5A; 100 + i]).collect();
    for (i, p) in payloads.iter().enumerate() {
        let h = s.ring_write(p, i as u64, META_FLAG_CRYPTO, 0);
        assert!(h > 0, "write {} failed: {}", i, h);
    }

    // Dispatcher: drain in FIFO order, submit, await in submission order.
    let mut jobs = Vec::new();
    loop {
        let sh = s.ring_read();
        if sh <= 0 {
            break;
        }
        let jh = s.crypto_submit(sh as u64);
        assert!(jh > 0);
        jobs.push(jh as u64);
    }
    assert_eq!(jobs.len(), payloads.len());

    for (i, &jh) in jobs.iter().enumerate() {
        let n = s.crypto_await(jh, 5000);
        assert_eq!(n as usize, payloads[i].len() + TAG_LEN);
        let mut ct = s.crypto_output_copy(jh).unwrap();
        assert_ne!(&ct[..payloads[i].len()], &payloads[i][..]);
        // Decrypt with the derived key to prove the ciphertext is real.
        // Job sequences are assigned in submission order starting at 1.
        let m = aead::open_packet(&key, (i + 1) as u64, DIR_EGRESS, &mut ct).unwrap();
        assert_eq!(&ct[..m], &payloads[i][..], "payload {} corrupted", i);
        assert_eq!(s.crypto_release(jh), 1);
    }
}

#[test]
fn crypto_parallelism_over_many_jobs() {
    let pool = CryptoPool::new(&MASTER, DIR_EGRESS, 8, 64).unwrap();
    let payloads: Vec<Vec<u8>> = (0..1000).map(|i| vec![(i % 251) as u8; 200]).collect();

    let jobs: Vec<_> = payloads
        .iter()
        .map(|p| {
            // SAFETY: payloads outlive every job in this test.
            unsafe { pool.submit(p.as_ptr(), p.len(), 0).unwrap() }
        })
        .collect();

    for (i, job) in jobs.iter().enumerate() {
        let n = pool.await_job(job, Duration::from_secs(30)).unwrap();
        assert!(job.is_done());
        assert!(n >= payloads[i].len(), "output shorter than input");
        assert_ne!(job.output()[..payloads[i].len()], payloads[i][..]);
    }

    // Every job was processed by exactly one worker: per-worker packet
    // counts sum to the job count.
    let stats = pool.stats();
    let total: u64 = stats.iter().map(|s| s.packets).sum();
    assert_eq!(total, 1000);
    let busy = stats.iter().filter(|s| s.packets > 0).count();
    assert!(busy >= 2, "expected parallelism across workers, got {}", busy);
}

#[test]
fn dispatcher_thread_against_producer_thread() {
    let s = Arc::new(Substrate::new(&test_config(), &MASTER).unwrap());
    const N: u64 = 2000;

    let prod = s.clone();
    let producer = std::thread::spawn(move || {
        let mut written = 0u64;
        while written < N {
            let payload = [written as u8; 64];
            let rc = prod.ring_write(&payload, written, META_FLAG_CRYPTO, 0);
            if rc > 0 {
                written += 1;
            } else if rc == 0 {
                std::thread::yield_now();
            } else {
                panic!("write failed: {}", rc);
            }
        }
    });

    let mut forwarded = 0u64;
    while forwarded < N {
        let sh = s.ring_read();
        if sh <= 0 {
            std::thread::yield_now();
            continue;
        }
        let meta = s.slot_meta(sh as u64).unwrap();
        assert_eq!(meta.length, 64);
        s.burst_update(meta.length as u64, meta.timestamp_ns);
        let jh = s.crypto_submit(sh as u64);
        assert!(jh > 0);
        let n = s.crypto_await(jh as u64, 5000);
        assert_eq!(n as usize, 64 + TAG_LEN);
        s.crypto_release(jh as u64);
        forwarded += 1;
    }
    producer.join().unwrap();
}

// ============================================================================
// RING INVARIANTS THROUGH THE BOUNDARY
// ============================================================================

#[test]
fn boundary_roundtrip_and_idempotent_teardown() {
    let mut s = Substrate::new(&test_config(), &MASTER).unwrap();
    let h = s.ring_write(b"payload", 123, 0, 2);
    assert!(h > 0);
    let rh = s.ring_read();
    assert_eq!(rh, h);
    let meta = s.slot_meta(rh as u64).unwrap();
    assert_eq!(meta.timestamp_ns, 123);
    assert_eq!(meta.queue, 2);
    assert_eq!(s.slot_payload_copy(rh as u64).unwrap(), b"payload");

    // Destroy twice is safe; writes refuse after teardown.
    s.shutdown();
    s.shutdown();
    assert!(s.ring_write(b"x", 0, 0, 0) < 0);
}

#[test]
fn capability_surface_is_stable() {
    let s = Substrate::new(&test_config(), &MASTER).unwrap();
    let mask = s.caps_mask();
    assert_eq!(mask, s.caps_mask());
    assert_eq!(s.has_simd(), mask & fastpath::engine::caps::CAP_SIMD != 0);
    assert_eq!(s.has_aes(), mask & fastpath::engine::caps::CAP_AES != 0);
}

// ============================================================================
// BURST CLASSIFIER DRIVEN THROUGH THE BOUNDARY
// ============================================================================

#[test]
fn burst_levels_follow_traffic_rate_steps() {
    // Tight alpha so each rate step converges within a few windows.
    let t = BurstTracker::new(BurstConfig {
        alpha: 0.9,
        ..BurstConfig::default()
    });
    let ms = 1_000_000u64;
    let mut now = 1u64;
    let run_windows = |t: &BurstTracker, now: &mut u64, mbps: u64, windows: usize| {
        for _ in 0..windows {
            let bytes = mbps * 1_000_000 / 8 / 100; // one 10 ms window
            t.update(bytes, *now);
            *now += 10 * ms + 1;
            t.update(0, *now);
        }
    };
    run_windows(&t, &mut now, 2, 8);
    assert_eq!(t.current_level(), BurstLevel::Low);
    run_windows(&t, &mut now, 20, 8);
    assert_eq!(t.current_level(), BurstLevel::Medium);
    run_windows(&t, &mut now, 120, 8);
    assert_eq!(t.current_level(), BurstLevel::Extreme);
}

// ============================================================================
// CONNECTION POOL AGAINST REAL SOCKETS
// ============================================================================

fn local_listener() -> (TcpListener, u16) {
    let l = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = l.local_addr().unwrap().port();
    (l, port)
}

/// Wait for a non-blocking connect to resolve, then report liveness.
fn connect_settled(fd: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    // SAFETY: pfd references a live stack value.
    unsafe { libc::poll(&mut pfd, 1, 2000) };
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: valid fd and out-pointers.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    rc == 0 && err == 0
}

#[test]
fn endpoint_switch_redials_fresh_socket() {
    let (_l1, port1) = local_listener();
    let (_l2, port2) = local_listener();
    let pool = ConnectionPool::new([40, 35, 25]);
    pool.init(8);

    let fd = pool.acquire(TrafficClass::Stream).unwrap();
    let (fd1, p1) = pool
        .connect(TrafficClass::Stream, fd, Ipv4Addr::LOCALHOST, port1)
        .unwrap();
    assert_eq!(fd1, fd, "first dial keeps the acquired socket");
    assert!(matches!(p1, ConnectProgress::Ok | ConnectProgress::InProgress));
    assert!(connect_settled(fd1));

    // Same endpoint again: reuse, no redial.
    let (fd_same, p_same) = pool
        .connect(TrafficClass::Stream, fd1, Ipv4Addr::LOCALHOST, port1)
        .unwrap();
    assert_eq!(fd_same, fd1);
    assert_eq!(p_same, ConnectProgress::Ok);

    // New endpoint: prior connection is shut down and a fresh socket dials.
    let (fd2, _p2) = pool
        .connect(TrafficClass::Stream, fd1, Ipv4Addr::LOCALHOST, port2)
        .unwrap();
    assert_ne!(fd2, -1);
    assert!(connect_settled(fd2));
    // The old descriptor is gone: fcntl on it fails with EBADF.
    // SAFETY: querying flags of a (possibly closed) fd is harmless.
    if fd2 != fd1 {
        let rc = unsafe { libc::fcntl(fd1, libc::F_GETFD) };
        assert_eq!(rc, -1, "old socket should be closed after endpoint switch");
    }
    pool.release(TrafficClass::Stream, fd2);
    pool.destroy();
}

#[test]
fn broken_socket_replaced_on_release() {
    let (_l, port) = local_listener();
    let pool = ConnectionPool::new([40, 35, 25]);
    pool.init(8);

    let fd = pool.acquire(TrafficClass::Vision).unwrap();
    let (fd, _) = pool
        .connect(TrafficClass::Vision, fd, Ipv4Addr::LOCALHOST, port)
        .unwrap();
    assert!(connect_settled(fd));

    // Break the socket out from under the pool.
    // SAFETY: fd is live; external close simulates a dead transport.
    unsafe { libc::close(fd) };
    pool.release(TrafficClass::Vision, fd);

    // The slot was invalidated: the fd no longer resolves.
    assert!(pool.slot_index_of(TrafficClass::Vision, fd).is_none());

    // Next acquire hands out a freshly created socket.
    let fd2 = pool.acquire(TrafficClass::Vision).unwrap();
    assert!(fd2 >= 0);
    pool.release(TrafficClass::Vision, fd2);
    pool.destroy();
}

#[test]
fn healthy_socket_survives_release_for_reuse() {
    let (listener, port) = local_listener();
    let pool = ConnectionPool::new([40, 35, 25]);
    pool.init(8);

    let fd = pool.acquire(TrafficClass::Stream).unwrap();
    let (fd, _) = pool
        .connect(TrafficClass::Stream, fd, Ipv4Addr::LOCALHOST, port)
        .unwrap();
    assert!(connect_settled(fd));
    let _peer = listener.accept().unwrap();

    pool.release(TrafficClass::Stream, fd);
    let fd2 = pool.acquire(TrafficClass::Stream).unwrap();
    assert_eq!(fd2, fd, "healthy socket should be reused");
    pool.destroy();
}

#[test]
fn pool_never_opens_beyond_class_budget() {
    let (_l, port) = local_listener();
    let pool = ConnectionPool::new([40, 35, 25]);
    pool.init(4); // reserve class: exactly 1 slot
    let mut opened = std::collections::HashSet::new();

    for round in 0..10 {
        let fd = pool.acquire(TrafficClass::Reserve).unwrap();
        opened.insert(fd);
        if round % 3 == 0 {
            let (fd_c, _) = pool
                .connect(TrafficClass::Reserve, fd, Ipv4Addr::LOCALHOST, port)
                .unwrap();
            opened.insert(fd_c);
            pool.release(TrafficClass::Reserve, fd_c);
        } else {
            pool.release(TrafficClass::Reserve, fd);
        }
    }
    // One slot may be replaced when a dial/endpoint switch retires a
    // socket, so the distinct-fd set stays within slot_count + 1 at any
    // class budget of 1. Kernel fd-number reuse can only shrink the set.
    assert!(
        opened.len() <= 2,
        "reserve class opened {} distinct sockets",
        opened.len()
    );
    pool.destroy();
}

// ============================================================================
// PACED EGRESS: scheduler + gate + writer over a pool socket
// ============================================================================

#[test]
fn paced_egress_over_a_pool_socket() {
    use fastpath::network::egress::EgressWriter;
    use fastpath::network::pacer::PacingGate;
    use fastpath::network::sched::{EgressFrame, EgressScheduler};
    use std::io::Read;

    let (listener, port) = local_listener();
    let s = Substrate::new(&test_config(), &MASTER).unwrap();

    // Egress socket from the pool.
    let fd = s.conn_acquire(TrafficClass::Stream as i64);
    assert!(fd >= 0);
    let fd = s.conn_connect(TrafficClass::Stream as i64, fd, "127.0.0.1", port);
    assert!(fd >= 0);
    assert!(connect_settled(fd as i32));
    let (mut server, _) = listener.accept().unwrap();

    // Seal a handful of packets and schedule them with a tight fixed gap.
    let mut gate = PacingGate::with_fixed_gap_ns(1);
    let mut sched = EgressScheduler::new();
    let mut expected_total = 0usize;
    for i in 0..10u64 {
        let wh = s.ring_write(&[i as u8; 300], i, META_FLAG_CRYPTO, 0);
        let rh = s.ring_read();
        assert_eq!(wh, rh);
        let jh = s.crypto_submit(rh as u64);
        let n = s.crypto_await(jh as u64, 5000);
        assert!(n > 0);
        expected_total += n as usize;
        let now = fastpath::engine::runtime::clock_ns();
        let frame = EgressFrame {
            job_handle: jh as u64,
            len: n as u32,
            release_ns: gate.pace(now, n as u32, BurstLevel::None),
        };
        assert!(sched.enqueue_bulk(frame));
    }

    // Drain the scheduler through the writer in chunk-sized sends.
    let writer = EgressWriter::new();
    let mut sent_total = 0usize;
    while !sched.is_empty() {
        let now = fastpath::engine::runtime::clock_ns();
        let Some(frame) = sched.dequeue_ready(now) else {
            std::thread::yield_now();
            continue;
        };
        let ct = s.crypto_output_copy(frame.job_handle).unwrap();
        assert_eq!(ct.len(), frame.len as usize);
        let mut queued = 0;
        while queued < ct.len() {
            match writer.send_chunked(fd as i32, &ct[queued..], 128, false) {
                Ok(n) => queued += n,
                Err(fastpath::error::Error::WouldBlock) => std::thread::yield_now(),
                Err(e) => panic!("egress send failed: {}", e),
            }
        }
        sent_total += queued;
        s.crypto_release(frame.job_handle);
    }
    assert_eq!(sent_total, expected_total);

    // The peer sees every ciphertext byte.
    let mut received = vec![0u8; expected_total];
    server.read_exact(&mut received).unwrap();

    s.conn_release(TrafficClass::Stream as i64, fd);
}

// ============================================================================
// BACK-PRESSURE AND SHUTDOWN SEMANTICS
// ============================================================================

#[test]
fn sustained_full_ring_applies_producer_backpressure() {
    let cfg = Config {
        ring_capacity: 4,
        ring_payload_size: 64,
        worker_count: 1,
        ..Config::default()
    };
    let s = Substrate::new(&cfg, &MASTER).unwrap();
    let mut accepted = 0;
    let mut rejected = 0;
    for _ in 0..64 {
        let rc = s.ring_write(&[1u8; 16], 0, 0, 0);
        if rc > 0 {
            accepted += 1;
        } else {
            assert_eq!(rc, 0, "full ring must report try-again, not failure");
            rejected += 1;
        }
    }
    assert_eq!(accepted, 4);
    assert_eq!(rejected, 60);
}

#[test]
fn shutdown_drains_inflight_jobs() {
    let mut s = Substrate::new(&test_config(), &MASTER).unwrap();
    for i in 0..8 {
        let h = s.ring_write(&[i as u8; 128], i as u64, META_FLAG_CRYPTO, 0);
        assert!(h > 0);
        let rh = s.ring_read();
        let jh = s.crypto_submit(rh as u64);
        assert!(jh > 0);
        // Intentionally neither awaited nor released.
    }
    s.shutdown();
    // Ring writes refuse, crypto submits refuse.
    assert!(s.ring_write(&[0u8; 8], 0, 0, 0) < 0);
}
