/*!
 * Received Signals
 *
 * A registrar handler records every delivered signal in a process-wide
 * bitmap that callers read back later. Bit `n - 1` stands for signal `n`.
 */

use crate::core::errors::{AgentError, Result};
use crate::core::limits::MAX_TRACKED_SIGNAL;
use crate::core::types::Address;
use libc::c_int;
use nix::errno::Errno;
use std::sync::atomic::{AtomicU64, Ordering};

static RECEIVED: AtomicU64 = AtomicU64::new(0);

/// Handler that records `signum` in the received set
pub extern "C" fn signal_registrar(signum: c_int) {
    if signum > 0 && (signum as usize) <= MAX_TRACKED_SIGNAL {
        RECEIVED.fetch_or(1u64 << (signum - 1), Ordering::SeqCst);
    }
}

/// Bitmap of signals received so far
pub fn received_mask() -> u64 {
    RECEIVED.load(Ordering::SeqCst)
}

/// Received signal numbers in ascending order
pub fn received_signals() -> Vec<i32> {
    let mask = received_mask();
    (1..=MAX_TRACKED_SIGNAL as i32)
        .filter(|sig| mask & (1u64 << (sig - 1)) != 0)
        .collect()
}

pub fn clear_received() {
    RECEIVED.store(0, Ordering::SeqCst);
}

/// Install the handler at `handler` for `signum`, returning the previous
/// handler address (`SIG_DFL` and `SIG_IGN` pass through as their values)
pub fn install_handler(signum: c_int, handler: Address) -> Result<Address> {
    // SAFETY: sigaction structs are plain data; zeroed is a valid start
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler;
    action.sa_flags = libc::SA_RESTART;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    // SAFETY: the caller vouches that `handler` is a signal handler
    if unsafe { libc::sigaction(signum, &action, &mut previous) } != 0 {
        return Err(AgentError::os("sigaction", Errno::last()));
    }
    tracing::debug!(signum, "signal handler installed");
    Ok(previous.sa_sigaction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_registrar_records_signal() {
        clear_received();
        install_handler(libc::SIGUSR1, signal_registrar as usize).unwrap();

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR1).unwrap();

        assert!(received_signals().contains(&libc::SIGUSR1));
        assert_ne!(received_mask() & (1 << (libc::SIGUSR1 - 1)), 0);
        clear_received();
        assert_eq!(received_mask(), 0);
    }

    #[test]
    #[serial]
    fn test_out_of_range_signal_ignored() {
        clear_received();
        signal_registrar(0);
        signal_registrar(200);
        assert_eq!(received_mask(), 0);
    }
}
