//! Persistence primitives
//!
//! Stores into the persistent region only become durable once the cache
//! lines holding them are written back and a store fence orders them
//! against later stores. On x86_64 this uses `clflush`, non-temporal
//! stores and `sfence`; other targets fall back to a sequentially
//! consistent fence and rely on `msync` at shutdown.

#![allow(unsafe_code)]

use nvcache_common::CACHE_LINE;
use std::ptr;

/// Copies larger than this use non-temporal stores
pub const NT_STORE_THRESHOLD: usize = 256;

/// Order all previous persistent stores before any later store.
#[inline]
pub fn persist_fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: sfence has no memory operands; SSE is part of the x86_64 baseline.
    unsafe {
        core::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Write back every cache line overlapping `[addr, addr + len)`.
///
/// # Safety
///
/// The range must lie inside a live mapping.
#[inline]
pub unsafe fn write_back(addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    #[cfg(target_arch = "x86_64")]
    {
        let start = addr as usize & !(CACHE_LINE - 1);
        let end = addr as usize + len;
        let mut line = start;
        while line < end {
            // SAFETY: the line overlaps the caller's range, which is mapped.
            unsafe { core::arch::x86_64::_mm_clflush(line as *const u8) };
            line += CACHE_LINE;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (addr, len, CACHE_LINE);
    }
}

/// Copy `src` to `dst` so that the bytes are on their way to persistence
/// once the next [`persist_fence`] completes.
///
/// Large, 8-byte aligned copies bypass the cache with non-temporal stores;
/// everything else is a plain copy followed by [`write_back`].
///
/// # Safety
///
/// `dst` must be valid for `src.len()` bytes of writes and must not overlap
/// `src`.
pub unsafe fn durable_store(dst: *mut u8, src: &[u8]) {
    #[cfg(target_arch = "x86_64")]
    if src.len() > NT_STORE_THRESHOLD && (dst as usize) % 8 == 0 {
        let words = src.len() / 8;
        for i in 0..words {
            // SAFETY: i * 8 + 8 <= src.len(), and dst has room for src.len() bytes.
            unsafe {
                let word = ptr::read_unaligned(src.as_ptr().add(i * 8).cast::<i64>());
                core::arch::x86_64::_mm_stream_si64(dst.add(i * 8).cast::<i64>(), word);
            }
        }
        let rest = &src[words * 8..];
        if !rest.is_empty() {
            // SAFETY: the remainder fits in dst after the streamed words.
            unsafe {
                let tail = dst.add(words * 8);
                ptr::copy_nonoverlapping(rest.as_ptr(), tail, rest.len());
                write_back(tail, rest.len());
            }
        }
        return;
    }

    // SAFETY: guaranteed by the caller.
    unsafe {
        ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        write_back(dst, src.len());
    }
}
