// FASTPATH — EGRESS WRITER
// Non-blocking socket emission for paced ciphertext. Two pieces:
//
//   ChunkIter — zero-copy iterator yielding chunk-sized slices of an
//   oversized output buffer. No allocation, just pointer arithmetic.
//
//   EgressWriter — send wrapper with one-shot MSG_ZEROCOPY probing.
//   Zerocopy is enabled per socket on a best-effort basis and applied
//   only to payloads large enough to beat the page-pinning cost; every
//   failure falls back to a plain copy send automatically.

use crate::error::{Error, Result};

/// Payloads below this size copy faster than they pin.
const ZEROCOPY_MIN_BYTES: usize = 16 * 1024;

// ============================================================================
// CHUNK SLICER
// ============================================================================

/// Zero-copy iterator over chunk-sized slices of a payload.
pub struct ChunkIter<'a> {
    data: &'a [u8],
    offset: usize,
    chunk: usize,
}

impl<'a> ChunkIter<'a> {
    #[inline(always)]
    pub fn new(data: &'a [u8], chunk: usize) -> Self {
        ChunkIter { data, offset: 0, chunk: chunk.max(1) }
    }

    /// Number of total chunks.
    #[inline(always)]
    pub fn total_chunks(&self) -> usize {
        if self.data.is_empty() {
            return 0;
        }
        self.data.len().div_ceil(self.chunk)
    }
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = &'a [u8];

    #[inline(always)]
    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let end = (self.offset + self.chunk).min(self.data.len());
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Some(slice)
    }

    #[inline(always)]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.offset >= self.data.len() {
            0
        } else {
            (self.data.len() - self.offset).div_ceil(self.chunk)
        };
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for ChunkIter<'a> {}

/// Convenience: slice a buffer into chunk-sized pieces.
#[inline]
pub fn chunks(data: &[u8], chunk: usize) -> ChunkIter<'_> {
    ChunkIter::new(data, chunk)
}

// ============================================================================
// EGRESS WRITER
// ============================================================================

pub struct EgressWriter {
    zerocopy: bool,
}

impl Default for EgressWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl EgressWriter {
    /// Probe MSG_ZEROCOPY support once (SO_ZEROCOPY on a throwaway
    /// socket). Unsupported kernels silently stay on the copy path.
    pub fn new() -> Self {
        // SAFETY: throwaway probe socket, closed before returning.
        let zerocopy = unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            if fd < 0 {
                false
            } else {
                let one: libc::c_int = 1;
                let r = libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ZEROCOPY,
                    &one as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
                libc::close(fd);
                r == 0
            }
        };
        eprintln!(
            "[FP-NET] MSG_ZEROCOPY: {}",
            if zerocopy { "available" } else { "unavailable (copy path)" }
        );
        EgressWriter { zerocopy }
    }

    pub fn zerocopy_available(&self) -> bool {
        self.zerocopy
    }

    /// Opt a socket into zerocopy. Best-effort; returns whether it took.
    pub fn enable_zerocopy(&self, fd: i32) -> bool {
        if !self.zerocopy {
            return false;
        }
        let one: libc::c_int = 1;
        // SAFETY: valid fd, option pointer references a live stack value.
        let r = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ZEROCOPY,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        r == 0
    }

    /// Non-blocking send. Returns bytes queued, `WouldBlock` when the
    /// socket buffer is full, `System(errno)` otherwise. Large payloads on
    /// a zerocopy-enabled socket use MSG_ZEROCOPY with an automatic
    /// fallback to the copy path when the kernel refuses.
    pub fn send(&self, fd: i32, data: &[u8], socket_zerocopy: bool) -> Result<usize> {
        if fd < 0 {
            return Err(Error::InvalidArgument);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let use_zc = self.zerocopy && socket_zerocopy && data.len() >= ZEROCOPY_MIN_BYTES;
        if use_zc {
            // SAFETY: fd and data are valid for the duration of the call.
            let n = unsafe {
                libc::send(
                    fd,
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                    libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL | libc::MSG_ZEROCOPY,
                )
            };
            if n >= 0 {
                self.drain_completions(fd);
                return Ok(n as usize);
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EAGAIN {
                return Err(Error::WouldBlock);
            }
            // ENOBUFS/EINVAL: the kernel cannot pin right now — fall back.
        }
        // SAFETY: fd and data are valid for the duration of the call.
        let n = unsafe {
            libc::send(
                fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::EAGAIN {
            return Err(Error::WouldBlock);
        }
        Err(Error::System(errno))
    }

    /// Send a buffer in chunk-sized pieces, stopping at the first
    /// would-block. Returns bytes queued.
    pub fn send_chunked(
        &self,
        fd: i32,
        data: &[u8],
        chunk: usize,
        socket_zerocopy: bool,
    ) -> Result<usize> {
        let mut sent = 0;
        for piece in chunks(data, chunk) {
            match self.send(fd, piece, socket_zerocopy) {
                Ok(n) => {
                    sent += n;
                    if n < piece.len() {
                        return Ok(sent);
                    }
                }
                Err(Error::WouldBlock) if sent > 0 => return Ok(sent),
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    /// Reap zerocopy completion notifications from the socket error queue
    /// so they don't pile up against the send buffer accounting.
    fn drain_completions(&self, fd: i32) {
        let mut buf = [0u8; 256];
        loop {
            // SAFETY: msghdr is zero-initialized and control buffer points
            // at a live stack array; MSG_DONTWAIT never blocks.
            let n = unsafe {
                let mut msg: libc::msghdr = std::mem::zeroed();
                msg.msg_control = buf.as_mut_ptr() as *mut libc::c_void;
                msg.msg_controllen = buf.len();
                libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT)
            };
            if n < 0 {
                break;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
