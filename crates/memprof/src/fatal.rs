//! Unrecoverable conditions of the bookkeeping subsystem.
//!
//! The profiler cannot hand an error back to the code that triggered an
//! allocation: if it fails to get memory for its own records, the frame tree
//! and the ownership index would go out of sync. Both paths here print a fixed
//! message straight to fd 2 (formatting would allocate) and exit.

const OUT_OF_MEMORY: &str = "memprof: System out of memory, try lowering memory_limit\n";
const INT_OVERFLOW: &str =
    "memprof: Integer overflow in memory allocation, try lowering memory_limit\n";

#[cold]
fn die(message: &str) -> ! {
    // SAFETY: `message` is a valid buffer of `message.len()` bytes. A short or
    // failed write is ignored, the process is about to exit anyway.
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            message.as_ptr().cast::<libc::c_void>(),
            message.len(),
        );
    }
    std::process::exit(1);
}

/// The real allocator refused to give us bookkeeping memory.
#[cold]
pub fn out_of_memory() -> ! {
    die(OUT_OF_MEMORY)
}

/// A bookkeeping byte count does not fit in `usize`.
#[cold]
pub fn int_overflow() -> ! {
    die(INT_OVERFLOW)
}

/// Computes `nmemb * size + offset`, exiting through [`int_overflow`] when
/// the result is not representable.
#[inline]
pub fn safe_size(nmemb: usize, size: usize, offset: usize) -> usize {
    match nmemb.checked_mul(size).and_then(|r| r.checked_add(offset)) {
        Some(total) => total,
        None => int_overflow(),
    }
}
