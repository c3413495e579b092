//! OS-level thread identifiers.
//!
//! A session belongs to the thread that enabled it. The id is read on every
//! intercepted event, so it is cached per thread after the first syscall.

use std::cell::Cell;

thread_local! {
    static CACHED_TID: Cell<u64> = const { Cell::new(0) };
}

/// Return the OS thread ID (TID) of the calling thread.
///
/// - **Linux**: `syscall(SYS_gettid)`
/// - **macOS**: `pthread_mach_thread_np(pthread_self())`
#[inline]
pub fn current_tid() -> u64 {
    CACHED_TID.with(|cached| {
        let tid = cached.get();
        if tid != 0 {
            return tid;
        }
        let tid = os_tid();
        cached.set(tid);
        tid
    })
}

#[inline]
fn os_tid() -> u64 {
    #[cfg(target_os = "linux")]
    {
        unsafe { libc::syscall(libc::SYS_gettid) as u64 }
    }

    #[cfg(target_os = "macos")]
    {
        unsafe { libc::pthread_mach_thread_np(libc::pthread_self()) as u64 }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        compile_error!("current_tid() is only implemented for Linux and macOS");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_is_stable_per_thread() {
        let main = current_tid();
        assert_ne!(main, 0);
        assert_eq!(main, current_tid());

        let other = std::thread::spawn(current_tid).join().unwrap();
        assert_ne!(main, other);
    }
}
