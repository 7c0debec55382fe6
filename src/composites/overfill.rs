/*!
 * Overfill
 *
 * Fill a descriptor's send queue until the kernel stops accepting data.
 * `overfill_buffers` is for sockets and stops after
 * `OVERFILL_STABLE_ROUNDS` consecutive rounds without progress;
 * `overfill_fd` is for pipes and other descriptors and writes until the
 * first would-block. Original descriptor flags are restored on every path.
 */

use super::{is_retry, with_counters, CompositeError, CompositeResult};
use crate::core::errors::Result;
use crate::core::guard::FlagsGuard;
use crate::core::limits::{OVERFILL_CHUNK_LEN, OVERFILL_FILL_BYTE, OVERFILL_STABLE_ROUNDS, OVERFILL_WAIT_MS};
use crate::core::types::Fd;
use crate::iomux::{Flavor, IoEvents, Iomux};
use crate::symbols::{flag_setter, Primitives};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverfillParams {
    pub sock: Fd,
    /// The socket is already non-blocking; leave its flags alone
    pub is_nonblocking: bool,
    pub iomux: Flavor,
}

/// Switch `fd` to non-blocking until the returned guard is dropped
fn make_nonblocking(prims: &Primitives, fd: Fd) -> Result<Option<FlagsGuard>> {
    let flags = prims.fcntl_getfl(fd)?;
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(None);
    }
    let guard = FlagsGuard::new(fd, flags, flag_setter(prims.fcntl_fn()?));
    prims.fcntl_setfl(fd, flags | libc::O_NONBLOCK)?;
    Ok(Some(guard))
}

fn restore(guard: Option<FlagsGuard>) -> Result<()> {
    if let Some(guard) = guard {
        guard.restore()?;
    }
    Ok(())
}

pub fn overfill_buffers(prims: &Primitives, params: &OverfillParams) -> CompositeResult<u64> {
    with_counters(0, |bytes| fill_socket(prims, params, bytes))
}

fn fill_socket(prims: &Primitives, params: &OverfillParams, bytes: &mut u64) -> Result<()> {
    let sock = params.sock;
    let guard = if params.is_nonblocking {
        None
    } else {
        make_nonblocking(prims, sock)?
    };

    let mut mux = Iomux::create(prims, params.iomux)?;
    mux.add(sock, IoEvents::OUT)?;

    let buf = vec![OVERFILL_FILL_BYTE; OVERFILL_CHUNK_LEN];
    let mut total: u64 = 0;
    let mut unchanged = 0u32;

    while unchanged < OVERFILL_STABLE_ROUNDS {
        let (rc, ret) = match mux.wait(OVERFILL_WAIT_MS) {
            Ok(r) => r,
            Err(e) if is_retry(&e) => continue,
            Err(e) => return Err(e),
        };
        let mut writable = mux.fd_is_writable(sock, &ret, rc)?;

        loop {
            match prims.send(sock, &buf, libc::MSG_DONTWAIT) {
                Ok(sent) if sent > 0 => *bytes += sent as u64,
                Ok(_) => break,
                Err(e) if is_retry(&e) => {
                    if writable {
                        error!(sock, flavor = %params.iomux, "writable event but send accepted nothing");
                        return Err(CompositeError::SpuriousWritable { fd: sock }.into());
                    }
                    break;
                }
                Err(e) => {
                    error!(sock, error = %e, "overfill send failed");
                    return Err(e);
                }
            }
            writable = false;
        }

        if total != *bytes {
            total = *bytes;
            unchanged = 0;
        } else {
            unchanged += 1;
        }
        debug!(sock, bytes = *bytes, unchanged, "overfill round");
    }

    drop(mux);
    restore(guard)?;
    info!(sock, bytes = *bytes, "send queue overfilled");
    Ok(())
}

pub fn overfill_fd(prims: &Primitives, write_end: Fd) -> CompositeResult<u64> {
    with_counters(0, |bytes| fill_fd(prims, write_end, bytes))
}

fn fill_fd(prims: &Primitives, write_end: Fd, bytes: &mut u64) -> Result<()> {
    let guard = make_nonblocking(prims, write_end)?;
    let buf = vec![OVERFILL_FILL_BYTE; OVERFILL_CHUNK_LEN];

    loop {
        match prims.write(write_end, &buf) {
            Ok(written) if written > 0 => *bytes += written as u64,
            Ok(_) => break,
            Err(e) if is_retry(&e) => break,
            Err(e) => {
                error!(fd = write_end, error = %e, "overfill write failed");
                return Err(e);
            }
        }
    }

    restore(guard)?;
    info!(fd = write_end, bytes = *bytes, "descriptor overfilled");
    Ok(())
}
