// FASTPATH — PERSISTENT CONNECTION POOL
// Small fixed sets of persistent TCP sockets per traffic class, handed to
// egress users and taken back with a zero-cost liveness probe. A socket is
// closed at most once per lifetime: invalidation is a CAS on the fd so
// concurrent releases can never double-close.
//
// Classes: Stream (multiplexed bulk), Vision (latency-sensitive media),
// Reserve (failover spares). Slot counts follow configurable ratios over a
// total clamped to [4, 16], floor one slot per class.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};

pub const CLASS_COUNT: usize = 3;
pub const POOL_MIN_TOTAL: usize = 4;
pub const POOL_MAX_TOTAL: usize = 16;

/// Sentinel for "no socket". `fd < 0 ⇒ not connected` is an invariant.
const FD_NONE: i32 = -1;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum TrafficClass {
    Stream = 0,
    Vision = 1,
    Reserve = 2,
}

impl TrafficClass {
    pub fn from_index(i: usize) -> Option<TrafficClass> {
        match i {
            0 => Some(TrafficClass::Stream),
            1 => Some(TrafficClass::Vision),
            2 => Some(TrafficClass::Reserve),
            _ => None,
        }
    }
}

/// Non-blocking connect outcome.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConnectProgress {
    /// Connected (immediately, or the slot was already bound here).
    Ok,
    /// Kernel signalled asynchronous completion (EINPROGRESS).
    InProgress,
}

struct ConnSlot {
    fd: AtomicI32,
    in_use: bool,
    connected: bool,
    remote_ip: [u8; 4],
    remote_port: u16,
}

impl ConnSlot {
    fn fresh() -> Self {
        ConnSlot {
            fd: AtomicI32::new(FD_NONE),
            in_use: false,
            connected: false,
            remote_ip: [0; 4],
            remote_port: 0,
        }
    }

    /// Invalidate-and-close, CAS-guarded: exactly one caller wins the CAS
    /// from the live fd to the sentinel and performs the single close.
    fn invalidate(&mut self) {
        let fd = self.fd.load(Ordering::Acquire);
        if fd >= 0
            && self
                .fd
                .compare_exchange(fd, FD_NONE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // SAFETY: fd was owned by this slot and the CAS guarantees no
            // second close of the same descriptor.
            unsafe { libc::close(fd) };
        }
        self.connected = false;
        self.remote_ip = [0; 4];
        self.remote_port = 0;
    }
}

/// Split `total` slots across classes by ratio, floor one per class.
/// Leftover slots (integer truncation) land on the first class.
pub fn distribute_slots(total: usize, ratios: [u32; 3]) -> [usize; 3] {
    let total = total.clamp(POOL_MIN_TOTAL, POOL_MAX_TOTAL);
    let sum: u64 = ratios.iter().map(|&r| r.max(1) as u64).sum();
    let mut out = [0usize; 3];
    let mut used = 0;
    for i in 0..CLASS_COUNT {
        let share = (total as u64 * ratios[i].max(1) as u64 / sum) as usize;
        out[i] = share.max(1);
        used += out[i];
    }
    while used > total {
        // Over-allocation can only come from the floor; shave the largest.
        let i = (0..CLASS_COUNT).max_by_key(|&i| out[i]).unwrap();
        out[i] -= 1;
        used -= 1;
    }
    out[0] += total - used;
    out
}

pub struct ConnectionPool {
    classes: [Mutex<Vec<ConnSlot>>; CLASS_COUNT],
    ratios: [u32; 3],
    tfo_supported: AtomicBool,
    tfo_probed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(ratios: [u32; 3]) -> Self {
        ConnectionPool {
            classes: [Mutex::new(Vec::new()), Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            ratios,
            tfo_supported: AtomicBool::new(false),
            tfo_probed: AtomicBool::new(false),
        }
    }

    /// (Re)initialize the pool: clamp the total, distribute to classes,
    /// close any prior sockets, reset every slot. Idempotent — repeated
    /// `init(n)` is observably a single `init(n)`.
    pub fn init(&self, total_slots: usize) {
        let split = distribute_slots(total_slots, self.ratios);
        for (ci, class) in self.classes.iter().enumerate() {
            let mut slots = class.lock().unwrap();
            for s in slots.iter_mut() {
                s.invalidate();
            }
            slots.clear();
            slots.resize_with(split[ci], ConnSlot::fresh);
        }
        eprintln!(
            "[FP-POOL] Initialized: stream={} vision={} reserve={} (total {})",
            split[0],
            split[1],
            split[2],
            split.iter().sum::<usize>()
        );
    }

    /// Hand out a free slot's socket, creating and configuring one lazily
    /// if the slot had none. The fresh slot always starts disconnected.
    pub fn acquire(&self, class: TrafficClass) -> Result<i32> {
        let mut slots = self.classes[class as usize].lock().unwrap();
        for slot in slots.iter_mut() {
            if slot.in_use {
                continue;
            }
            if slot.fd.load(Ordering::Acquire) < 0 {
                let fd = self.create_socket()?;
                slot.fd.store(fd, Ordering::Release);
                slot.connected = false;
                slot.remote_ip = [0; 4];
                slot.remote_port = 0;
            }
            slot.in_use = true;
            return Ok(slot.fd.load(Ordering::Acquire));
        }
        Err(Error::Exhausted)
    }

    /// Resolve a caller-held fd back to its slot index.
    pub fn slot_index_of(&self, class: TrafficClass, fd: i32) -> Option<usize> {
        if fd < 0 {
            return None;
        }
        let slots = self.classes[class as usize].lock().unwrap();
        slots.iter().position(|s| s.fd.load(Ordering::Acquire) == fd)
    }

    /// Connect a held slot to `host:port`. A slot already connected to the
    /// same endpoint is reused as-is. A different endpoint always tears
    /// the old socket down (shutdown + close) and dials a fresh one — the
    /// new fd is returned alongside the progress. Non-blocking semantics:
    /// `Ok` on immediate success, `InProgress` on EINPROGRESS.
    pub fn connect(
        &self,
        class: TrafficClass,
        fd: i32,
        host: Ipv4Addr,
        port: u16,
    ) -> Result<(i32, ConnectProgress)> {
        if port == 0 {
            return Err(Error::InvalidArgument);
        }
        let ip = host.octets();
        let mut slots = self.classes[class as usize].lock().unwrap();
        let slot = slots
            .iter_mut()
            .find(|s| s.fd.load(Ordering::Acquire) == fd)
            .ok_or(Error::InvalidArgument)?;

        if slot.connected && slot.remote_ip == ip && slot.remote_port == port {
            return Ok((fd, ConnectProgress::Ok));
        }

        let mut dial_fd = fd;
        if slot.connected {
            // Endpoint switch: a connected TCP socket cannot re-dial.
            // SAFETY: fd is this slot's live descriptor.
            unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
            slot.invalidate();
            dial_fd = self.create_socket()?;
            slot.fd.store(dial_fd, Ordering::Release);
        }

        // SAFETY: sockaddr_in is repr(C); all-zeroes then explicit fields.
        let res = unsafe {
            let mut addr: libc::sockaddr_in = std::mem::zeroed();
            addr.sin_family = libc::AF_INET as libc::sa_family_t;
            addr.sin_port = port.to_be();
            addr.sin_addr.s_addr = u32::from_ne_bytes(ip);
            libc::connect(
                dial_fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };

        if res == 0 {
            slot.connected = true;
            slot.remote_ip = ip;
            slot.remote_port = port;
            return Ok((dial_fd, ConnectProgress::Ok));
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::EINPROGRESS {
            slot.connected = true;
            slot.remote_ip = ip;
            slot.remote_port = port;
            return Ok((dial_fd, ConnectProgress::InProgress));
        }
        Err(Error::System(errno))
    }

    /// Return a slot. The liveness probe (zero-timeout poll + SO_ERROR)
    /// decides whether the socket survives for reuse: a broken socket is
    /// invalidated via the fd CAS and closed; a healthy one is kept. A
    /// never-connected socket skips the probe — a TCP socket in CLOSE
    /// state polls as HUP even though it is perfectly reusable.
    pub fn release(&self, class: TrafficClass, fd: i32) {
        let mut slots = self.classes[class as usize].lock().unwrap();
        let Some(slot) = slots.iter_mut().find(|s| s.fd.load(Ordering::Acquire) == fd) else {
            return;
        };
        if slot.connected && socket_broken(fd) {
            slot.invalidate();
        }
        slot.in_use = false;
    }

    /// Close all sockets and clear every class. Idempotent.
    pub fn destroy(&self) {
        for class in &self.classes {
            let mut slots = class.lock().unwrap();
            for s in slots.iter_mut() {
                s.invalidate();
            }
            slots.clear();
        }
    }

    /// Per-class slot counts (for tests and the stats surface).
    pub fn class_sizes(&self) -> [usize; CLASS_COUNT] {
        let mut out = [0; CLASS_COUNT];
        for (i, class) in self.classes.iter().enumerate() {
            out[i] = class.lock().unwrap().len();
        }
        out
    }

    /// Create a non-blocking TCP socket with the egress option set:
    /// SO_REUSEADDR, TCP_NODELAY, SO_KEEPALIVE, and best-effort TFO.
    fn create_socket(&self) -> Result<i32> {
        // SAFETY: plain socket(2) call; fd ownership transfers to the slot.
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            let e = Error::last_os();
            eprintln!("[FP-POOL] ERROR: socket() failed: {}", e);
            return Err(e);
        }
        // SAFETY: valid fd; option pointers reference live stack values.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
            let one: libc::c_int = 1;
            let one_ptr = &one as *const libc::c_int as *const libc::c_void;
            let len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            libc::setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, one_ptr, len);
            libc::setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, one_ptr, len);
            libc::setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, one_ptr, len);
            if self.tfo_available() {
                // Best-effort: a kernel that rejects it simply dials with a
                // normal SYN.
                libc::setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_FASTOPEN_CONNECT, one_ptr, len);
            }
        }
        Ok(fd)
    }

    /// One-shot probe for TCP_FASTOPEN_CONNECT support.
    fn tfo_available(&self) -> bool {
        if self.tfo_probed.load(Ordering::Acquire) {
            return self.tfo_supported.load(Ordering::Relaxed);
        }
        // SAFETY: throwaway probe socket, closed before returning.
        let supported = unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            if fd < 0 {
                false
            } else {
                let one: libc::c_int = 1;
                let r = libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_FASTOPEN_CONNECT,
                    &one as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
                libc::close(fd);
                r == 0
            }
        };
        self.tfo_supported.store(supported, Ordering::Relaxed);
        self.tfo_probed.store(true, Ordering::Release);
        eprintln!(
            "[FP-POOL] TCP Fast Open: {}",
            if supported { "available" } else { "unavailable (normal SYN)" }
        );
        supported
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Zero-cost liveness probe: non-blocking poll with zero timeout plus
/// SO_ERROR. Any error condition marks the socket broken.
fn socket_broken(fd: i32) -> bool {
    if fd < 0 {
        return true;
    }
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    // SAFETY: pfd references a live stack value; timeout 0 never blocks.
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc < 0 {
        return true;
    }
    if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return true;
    }
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: valid fd and out-pointers to live stack values.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    rc != 0 || err != 0
}

// ============================================================================
// TESTS
// ============================================================================
