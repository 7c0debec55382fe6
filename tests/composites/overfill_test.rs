/*!
 * Overfill Tests
 * Filling socket buffers with every multiplexer flavor
 */

use rpc_agent::composites::{overfill_buffers, OverfillParams};
use rpc_agent::iomux::Flavor;
use rpc_agent::symbols::Primitives;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

/// Read everything queued on `stream` without blocking
pub fn drain(stream: &mut UnixStream) -> u64 {
    stream.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => total += n as u64,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => panic!("drain failed: {}", e),
        }
    }
    total
}

#[test]
fn test_overfill_every_flavor() {
    let prims = Primitives::new(true);

    for flavor in Flavor::ALL {
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let params = OverfillParams {
            sock: fd,
            is_nonblocking: false,
            iomux: flavor,
        };

        let sent = overfill_buffers(&prims, &params).unwrap();
        assert!(sent > 0, "{}: nothing written", flavor);

        let flags = prims.fcntl_getfl(fd).unwrap();
        assert_eq!(flags & libc::O_NONBLOCK, 0, "{}: blocking mode not restored", flavor);

        let mut writer = &a;
        writer.set_nonblocking(true).unwrap();
        let err = writer.write(&[0u8]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock, "{}: send queue not full", flavor);

        assert_eq!(drain(&mut b), sent, "{}: peer saw a different amount", flavor);
    }
}

#[test]
fn test_overfill_keeps_nonblocking_socket() {
    let prims = Primitives::new(true);
    let (a, mut b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();

    let params = OverfillParams {
        sock: a.as_raw_fd(),
        is_nonblocking: true,
        iomux: Flavor::Poll,
    };
    let sent = overfill_buffers(&prims, &params).unwrap();

    let flags = prims.fcntl_getfl(a.as_raw_fd()).unwrap();
    assert_ne!(flags & libc::O_NONBLOCK, 0);
    assert_eq!(drain(&mut b), sent);
}
