/*!
 * Socket to File
 * Copy everything readable from a socket into a file until it goes quiet
 */

use super::{is_retry, ms_until, secs, with_counters, CompositeError, CompositeResult};
use crate::core::errors::{AgentError, Result};
use crate::core::guard::FdGuard;
use crate::core::limits::{SOCK2FILE_BUF_LEN, SOCK2FILE_DRAIN_WAIT_MS};
use crate::core::types::Fd;
use crate::iomux::{Flavor, IoEvents, Iomux};
use crate::symbols::Primitives;
use nix::errno::Errno;
use std::ffi::CString;
use std::time::Instant;
use tracing::{debug, info, warn};

fn close_fd(fd: Fd) -> std::result::Result<(), Errno> {
    // SAFETY: the guard owns `fd` and closes it exactly once
    Errno::result(unsafe { libc::close(fd) }).map(drop)
}

/// Returns the number of bytes copied
///
/// The run ends when `time2run_s` has passed and one drain wait sees no
/// data, or when the peer shuts the socket down.
pub fn socket_to_file(prims: &Primitives, sock: Fd, path: &str, time2run_s: u32) -> CompositeResult<u64> {
    with_counters(0, |total| copy(prims, sock, path, time2run_s, total))
}

fn copy(prims: &Primitives, sock: Fd, path: &str, time2run_s: u32, total: &mut u64) -> Result<()> {
    let c_path = CString::new(path).map_err(|_| AgentError::invalid_arg("path contains NUL"))?;
    let file_fd = prims.open(&c_path, libc::O_CREAT | libc::O_RDWR, 0o777)?;
    let file = FdGuard::new(file_fd, Some(path.to_string()), close_fd);
    info!(sock, path, file_fd, time2run_s, "socket to file started");

    let mut mux = Iomux::create(prims, Flavor::Select)?;
    mux.add(sock, IoEvents::IN)?;

    let mut buffer = vec![0u8; SOCK2FILE_BUF_LEN];
    let stop = Instant::now() + secs(time2run_s);
    let mut expired = false;

    loop {
        let timeout = if expired { SOCK2FILE_DRAIN_WAIT_MS } else { ms_until(stop) };
        let (rc, ret) = match mux.wait(timeout) {
            Ok(r) => r,
            Err(e) if is_retry(&e) => continue,
            Err(e) => {
                warn!(sock, error = %e, "socket to file wait failed");
                return Err(e);
            }
        };

        let mut session_rx = false;
        let mut eof = false;
        if rc > 0 && mux.ready(&ret).iter().any(|(fd, ev)| *fd == sock && ev.is_readable()) {
            let received = prims.read(sock, &mut buffer)?;
            if received == 0 {
                eof = true;
            } else {
                session_rx = true;
                let written = prims.write(file.fd(), &buffer[..received])?;
                if written != received {
                    warn!(sock, received, written, "file accepted a partial write");
                    return Err(CompositeError::PartialWrite {
                        fd: sock,
                        received,
                        written,
                    }
                    .into());
                }
                *total += received as u64;
            }
        }

        if eof {
            debug!(sock, "peer shut the socket down");
            break;
        }
        if !expired && Instant::now() >= stop {
            expired = true;
            debug!(sock, "socket to file run time expired, draining");
            continue;
        }
        if expired && !session_rx {
            break;
        }
    }

    file.close_early()?;
    info!(sock, path, total = *total, "socket to file finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_copies_until_eof() {
        let prims = Primitives::new(true);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let (a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();

        b.write_all(&[7u8; 10_000]).unwrap();
        drop(b);

        let total = socket_to_file(&prims, a.as_raw_fd(), path.to_str().unwrap(), 5).unwrap();
        assert_eq!(total, 10_000);
        assert_eq!(std::fs::read(&path).unwrap().len(), 10_000);
    }
}
