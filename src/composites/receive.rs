/*!
 * Receivers
 * Drain, count and check data arriving on a socket
 */

use super::{is_retry, secs, with_counters, CompositeError, CompositeResult};
use crate::core::errors::Result;
use crate::core::limits::{RECV_VERIFY_BUF_LEN, SIMPLE_RECEIVER_BUF_LEN, SIMPLE_RECEIVER_WAIT};
use crate::core::types::Fd;
use crate::iomux::{Flavor, IoEvents, Iomux};
use crate::symbols::Primitives;
use std::time::Instant;
use tracing::{debug, info};

/// Receive everything queued on `sock` without blocking
///
/// With a `pattern`, byte `n` of the stream must equal
/// `pattern[n % pattern.len()]`. On a mismatch the count covers the
/// chunks received before the bad one.
pub fn recv_verify(prims: &Primitives, sock: Fd, pattern: Option<&[u8]>) -> CompositeResult<u64> {
    with_counters(0, |total| drain_checked(prims, sock, pattern, total))
}

fn drain_checked(prims: &Primitives, sock: Fd, pattern: Option<&[u8]>, total: &mut u64) -> Result<()> {
    let mut buf = vec![0u8; RECV_VERIFY_BUF_LEN];
    let pattern = pattern.filter(|p| !p.is_empty());

    loop {
        let received = match prims.recv(sock, &mut buf, libc::MSG_DONTWAIT) {
            Ok(0) => {
                debug!(sock, "peer shut the socket down");
                break;
            }
            Ok(n) => n,
            Err(e) if is_retry(&e) => break,
            Err(e) => return Err(e),
        };

        if let Some(pattern) = pattern {
            let mismatch = buf[..received]
                .iter()
                .enumerate()
                .find(|(i, b)| **b != pattern[((*total + *i as u64) % pattern.len() as u64) as usize]);
            if let Some((i, _)) = mismatch {
                return Err(CompositeError::PatternMismatch {
                    offset: *total + i as u64,
                    received: *total,
                }
                .into());
            }
        }
        *total += received as u64;
    }

    info!(sock, total = *total, "recv_verify finished");
    Ok(())
}

/// Receive until `time2run_s` has passed
///
/// Each round waits one second for data. With `time2run_s == 0` the run
/// ends on the first idle round after some data was seen. A zero-length
/// receive ends the run.
pub fn simple_receiver(prims: &Primitives, sock: Fd, time2run_s: u32) -> CompositeResult<u64> {
    with_counters(0, |bytes| receive(prims, sock, time2run_s, bytes))
}

fn receive(prims: &Primitives, sock: Fd, time2run_s: u32, bytes: &mut u64) -> Result<()> {
    let mut mux = Iomux::create(prims, Flavor::Select)?;
    mux.add(sock, IoEvents::IN)?;

    let mut buf = vec![0u8; SIMPLE_RECEIVER_BUF_LEN];
    let start = Instant::now();
    let wait_ms = SIMPLE_RECEIVER_WAIT.as_millis() as i32;
    info!(sock, time2run_s, "simple_receiver started");

    while time2run_s == 0 || start.elapsed() <= secs(time2run_s) {
        let (rc, ret) = mux.wait(wait_ms)?;
        if rc == 0 {
            if time2run_s != 0 || *bytes == 0 {
                continue;
            }
            break;
        }
        if !mux.ready(&ret).iter().any(|(fd, _)| *fd == sock) {
            return Err(CompositeError::NotInSet { fd: sock, rc }.into());
        }

        let len = prims.recv(sock, &mut buf, 0)?;
        if len == 0 {
            debug!(sock, "peer shut the socket down");
            break;
        }
        if *bytes == 0 {
            debug!(sock, len, "first bytes received");
        }
        *bytes += len as u64;
    }

    info!(sock, bytes = *bytes, "simple_receiver stopped");
    Ok(())
}

/// Whether `sock` becomes readable within `timeout_ms`
pub fn wait_readable(prims: &Primitives, sock: Fd, timeout_ms: u32) -> Result<bool> {
    let mut mux = Iomux::create(prims, Flavor::Select)?;
    mux.add(sock, IoEvents::IN)?;
    let (rc, ret) = mux.wait(timeout_ms.min(i32::MAX as u32) as i32)?;
    if rc > 0 && !mux.ready(&ret).iter().any(|(fd, _)| *fd == sock) {
        return Err(CompositeError::NotInSet { fd: sock, rc }.into());
    }
    Ok(rc > 0)
}
