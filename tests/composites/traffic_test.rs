/*!
 * Traffic Tests
 * Flooder and echoer running against real socket pairs
 */

use super::overfill_test::drain;
use pretty_assertions::assert_eq;
use rpc_agent::composites::{echoer, flooder, overfill_buffers, EchoerParams, FlooderParams, OverfillParams};
use rpc_agent::core::errors::{RpcErrno, ToRpcErrno};
use rpc_agent::iomux::Flavor;
use rpc_agent::symbols::Primitives;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

fn flood(senders: Vec<i32>, receivers: Vec<i32>, iomux: Flavor, time2wait_ms: u32) -> FlooderParams {
    FlooderParams {
        receivers,
        senders,
        size_min: 100,
        size_max: 1000,
        delay_min_us: 0,
        delay_max_us: 0,
        time2run_s: 1,
        time2wait_ms,
        iomux,
        ignore_err: false,
    }
}

#[test]
fn test_flooder_self_loop_conserves_bytes() {
    let prims = Primitives::new(true);

    for flavor in [Flavor::Select, Flavor::Poll, Flavor::Epoll] {
        let (a, b) = UnixStream::pair().unwrap();
        let params = flood(vec![a.as_raw_fd()], vec![b.as_raw_fd()], flavor, 200);

        let stats = flooder(&prims, &params).unwrap();
        assert!(stats.tx[0] > 0, "{}: nothing sent", flavor);
        assert_eq!(stats.tx[0], stats.rx[0], "{}: bytes lost in the loop", flavor);
    }
}

#[test]
fn test_flooder_both_ends_both_roles() {
    let prims = Primitives::new(true);
    let (a, b) = UnixStream::pair().unwrap();
    let fds = vec![a.as_raw_fd(), b.as_raw_fd()];

    let params = FlooderParams {
        receivers: fds.clone(),
        senders: fds,
        size_min: 64,
        size_max: 1024,
        delay_min_us: 0,
        delay_max_us: 100,
        time2run_s: 2,
        time2wait_ms: 1000,
        iomux: Flavor::Ppoll,
        ignore_err: false,
    };
    let stats = flooder(&prims, &params).unwrap();

    assert!(stats.tx[0] > 0 && stats.tx[1] > 0);
    assert_eq!(stats.rx[1], stats.tx[0]);
    assert_eq!(stats.rx[0], stats.tx[1]);
}

#[test]
fn test_flooder_against_echoer() {
    let (a, b) = UnixStream::pair().unwrap();
    let echo_fd = b.as_raw_fd();

    let echo = std::thread::spawn(move || {
        let prims = Primitives::new(true);
        let params = EchoerParams {
            sockets: vec![echo_fd],
            time2run_s: 3,
            iomux: Flavor::Poll,
        };
        let stats = echoer(&prims, &params);
        drop(b);
        stats
    });

    let prims = Primitives::new(true);
    let fd = a.as_raw_fd();
    let sent = flooder(&prims, &flood(vec![fd], vec![fd], Flavor::EpollPwait, 1000)).unwrap();
    let echoed = echo.join().unwrap().unwrap();

    assert!(sent.tx[0] > 0);
    assert_eq!(sent.tx[0], sent.rx[0]);
    assert_eq!(echoed.rx[0], sent.tx[0]);
    assert_eq!(echoed.tx[0], echoed.rx[0]);
}

#[test]
fn test_flooder_rejects_oversized_chunks() {
    let prims = Primitives::new(true);
    let (a, _b) = UnixStream::pair().unwrap();
    let mut params = flood(vec![a.as_raw_fd()], vec![], Flavor::Poll, 0);
    params.size_max = u32::MAX;

    assert!(flooder(&prims, &params).is_err());
}

#[test]
fn test_flooder_ignore_err_survives_closed_peer() {
    let prims = Primitives::new(true);
    let (a, b) = UnixStream::pair().unwrap();
    drop(b);
    let mut params = flood(vec![a.as_raw_fd()], vec![], Flavor::Poll, 0);

    let err = flooder(&prims, &params).unwrap_err();
    assert_eq!(err.rpc_errno(), RpcErrno::Pipe);
    assert_eq!(err.partial.tx, vec![0]);

    params.ignore_err = true;
    let stats = flooder(&prims, &params).unwrap();
    assert_eq!(stats.tx, vec![0]);
}

#[test]
fn test_overfill_drain_overfill_round_trip() {
    let prims = Primitives::new(true);
    let (a, mut b) = UnixStream::pair().unwrap();
    let params = OverfillParams {
        sock: a.as_raw_fd(),
        is_nonblocking: false,
        iomux: Flavor::Epoll,
    };

    let first = overfill_buffers(&prims, &params).unwrap();
    assert!(first > 0);
    assert_eq!(drain(&mut b), first);

    let second = overfill_buffers(&prims, &params).unwrap();
    assert_eq!(drain(&mut b), second);
    // The emptied queue takes about as much again
    assert!(second >= first / 2 && second <= first * 2, "first {} second {}", first, second);
}

#[test]
fn test_flooder_repeated_fds_use_first_slot() {
    let prims = Primitives::new(true);
    let (a, b) = UnixStream::pair().unwrap();
    let params = flood(
        vec![a.as_raw_fd(), a.as_raw_fd()],
        vec![b.as_raw_fd(), b.as_raw_fd()],
        Flavor::Epoll,
        200,
    );

    let stats = flooder(&prims, &params).unwrap();
    assert!(stats.tx[0] > 0);
    assert_eq!(stats.tx[1], 0);
    assert_eq!(stats.rx[1], 0);
    assert_eq!(stats.tx[0], stats.rx[0]);
}
