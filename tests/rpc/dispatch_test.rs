/*!
 * Dispatch Tests
 * Calls executed through the default handler set
 */

use pretty_assertions::assert_eq;
use rpc_agent::composites::{OverfillParams, SimpleSenderParams};
use rpc_agent::core::errors::RpcErrno;
use rpc_agent::iomux::{Flavor, IoEvents};
use rpc_agent::rpc::{default_registry, Dispatcher, PollFd, Reply, Request, RpcCall, RpcOutput};
use serial_test::serial;

fn call(dispatcher: &Dispatcher, call: RpcCall) -> Reply {
    dispatcher.dispatch(Request::sync(call))
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(default_registry(None))
}

#[test]
fn test_handle_zero_is_null() {
    let d = dispatcher();

    assert_eq!(call(&d, RpcCall::FdZero { set: 0 }).header.errno, RpcErrno::Fault);
    assert_eq!(call(&d, RpcCall::SigFillSet { set: 0 }).header.errno, RpcErrno::Fault);

    let written = call(&d, RpcCall::SetBuf { src: vec![1], dst: 0, offset: 0 });
    assert_eq!(written.header.errno, RpcErrno::Fault);

    let empty = call(&d, RpcCall::GetBuf { src: 0, offset: 0, len: 0 });
    assert!(empty.is_ok());
    assert_eq!(empty.output, RpcOutput::Bytes(Vec::new()));

    // Freeing the null handle is a no-op
    assert!(call(&d, RpcCall::Free { buf: 0 }).is_ok());
}

#[test]
fn test_buffer_lifecycle() {
    let d = dispatcher();

    let buf = match call(&d, RpcCall::Malloc { size: 64 }).output {
        RpcOutput::Handle(id) => id,
        other => panic!("unexpected output {:?}", other),
    };
    assert_ne!(buf, 0);

    assert!(call(&d, RpcCall::SetBuf { src: b"hello".to_vec(), dst: buf, offset: 4 }).is_ok());
    let got = call(&d, RpcCall::GetBuf { src: buf, offset: 4, len: 5 });
    assert_eq!(got.output, RpcOutput::Bytes(b"hello".to_vec()));

    let outside = call(&d, RpcCall::GetBuf { src: buf, offset: 60, len: 10 });
    assert_eq!(outside.header.errno, RpcErrno::InvalidArg);

    assert!(call(&d, RpcCall::Free { buf }).is_ok());
    let stale = call(&d, RpcCall::GetBuf { src: buf, offset: 0, len: 1 });
    assert_eq!(stale.header.errno, RpcErrno::InvalidArg);
}

#[test]
fn test_pipe_round_trip_returns_whole_buffer() {
    let d = dispatcher();

    let (r, w) = match call(&d, RpcCall::Pipe).output {
        RpcOutput::FdPair(r, w) => (r, w),
        other => panic!("unexpected output {:?}", other),
    };

    let wrote = call(&d, RpcCall::Write { fd: w, buf: b"abcdef".to_vec(), len: 6 });
    assert_eq!(wrote.output, RpcOutput::Int(6));

    let ready = call(
        &d,
        RpcCall::IomuxWait {
            flavor: Flavor::Pselect,
            fds: vec![PollFd { fd: r, events: IoEvents::IN }],
            timeout_ms: 1000,
        },
    );
    match ready.output {
        RpcOutput::Ready(fds) => {
            assert_eq!(fds.len(), 1);
            assert_eq!(fds[0].0, r);
            assert!(fds[0].1.contains(IoEvents::IN));
        }
        other => panic!("unexpected output {:?}", other),
    }

    let read = call(&d, RpcCall::Read { fd: r, buf: vec![0xAA; 16], len: 16 });
    assert!(read.is_ok());
    match read.output {
        RpcOutput::Io { rc, buf } => {
            assert_eq!(rc, 6);
            assert_eq!(buf.len(), 16);
            assert_eq!(&buf[..6], b"abcdef");
            assert!(buf[6..].iter().all(|b| *b == 0xAA));
        }
        other => panic!("unexpected output {:?}", other),
    }

    let too_long = call(&d, RpcCall::Read { fd: r, buf: vec![0; 4], len: 8 });
    assert_eq!(too_long.header.errno, RpcErrno::InvalidArg);

    assert!(call(&d, RpcCall::Close { fd: r }).is_ok());
    assert!(call(&d, RpcCall::Close { fd: w }).is_ok());
}

#[test]
fn test_zero_timeout_wait_on_idle_pipe() {
    let d = dispatcher();
    let (r, w) = match call(&d, RpcCall::Pipe).output {
        RpcOutput::FdPair(r, w) => (r, w),
        other => panic!("unexpected output {:?}", other),
    };

    for flavor in Flavor::ALL {
        let reply = call(
            &d,
            RpcCall::IomuxWait {
                flavor,
                fds: vec![PollFd { fd: r, events: IoEvents::IN }],
                timeout_ms: 0,
            },
        );
        assert_eq!(reply.output, RpcOutput::Ready(Vec::new()), "{}", flavor);
    }

    call(&d, RpcCall::Close { fd: r });
    call(&d, RpcCall::Close { fd: w });
}

#[test]
fn test_meta_queries() {
    let d = dispatcher();

    assert_eq!(
        call(&d, RpcCall::GetSizeof { type_name: "*".into() }).output,
        RpcOutput::Int(std::mem::size_of::<usize>() as i64)
    );
    assert_eq!(
        call(&d, RpcCall::GetSizeof { type_name: "no_such_type".into() }).output,
        RpcOutput::Int(-1)
    );
    assert_eq!(
        call(&d, RpcCall::FindFunc { name: "no_such_function_xyz".into() }).output,
        RpcOutput::Bool(false)
    );
    assert_eq!(
        call(&d, RpcCall::GetPid).output,
        RpcOutput::Pid(std::process::id() as i32)
    );
}

#[test]
#[serial]
fn test_setlibname_is_idempotent() {
    let d = dispatcher();

    assert!(call(&d, RpcCall::SetLibName { name: None }).is_ok());
    assert!(call(&d, RpcCall::SetLibName { name: None }).is_ok());

    let other = call(&d, RpcCall::SetLibName { name: Some("libother.so".into()) });
    assert_eq!(other.header.errno, RpcErrno::Exists);
}

#[test]
fn test_helper_calls_need_a_launcher() {
    let d = dispatcher();
    let reply = call(&d, RpcCall::ThreadCreate { name: "nobody".into() });
    assert_eq!(reply.header.errno, RpcErrno::NotSupported);
}

fn socket_pair(d: &Dispatcher) -> (i32, i32) {
    let pair = RpcCall::SocketPair {
        domain: libc::AF_UNIX,
        ty: libc::SOCK_STREAM,
        protocol: 0,
    };
    match call(d, pair).output {
        RpcOutput::FdPair(a, b) => (a, b),
        other => panic!("unexpected output {:?}", other),
    }
}

#[test]
fn test_overfill_converges_on_small_send_buffer() {
    let d = dispatcher();
    let (a, b) = socket_pair(&d);

    let set = call(
        &d,
        RpcCall::SetSockOpt {
            fd: a,
            level: libc::SOL_SOCKET,
            optname: libc::SO_SNDBUF,
            value: 64 * 1024,
        },
    );
    assert!(set.is_ok());
    match call(&d, RpcCall::GetSockOpt { fd: a, level: libc::SOL_SOCKET, optname: libc::SO_SNDBUF }).output {
        RpcOutput::Int(size) => assert!(size >= 64 * 1024, "send buffer {}", size),
        other => panic!("unexpected output {:?}", other),
    }

    let filled = call(
        &d,
        RpcCall::OverfillBuffers(OverfillParams {
            sock: a,
            is_nonblocking: false,
            iomux: Flavor::Poll,
        }),
    );
    assert!(filled.is_ok());
    match filled.output {
        RpcOutput::Count(bytes) => assert!((64 * 1024..=256 * 1024).contains(&bytes), "filled {} bytes", bytes),
        other => panic!("unexpected output {:?}", other),
    }

    let one = call(&d, RpcCall::Send { fd: a, buf: vec![0], len: 1, flags: libc::MSG_DONTWAIT });
    assert_eq!(one.header.errno, RpcErrno::WouldBlock);

    call(&d, RpcCall::Close { fd: a });
    call(&d, RpcCall::Close { fd: b });
}

#[test]
fn test_failed_sender_reply_carries_sent_count() {
    use std::io::Read;
    use std::os::fd::FromRawFd;
    use std::os::unix::net::UnixStream;

    let d = dispatcher();
    let (a, b) = socket_pair(&d);
    // SAFETY: b came from the agent and is owned by this reader from here on
    let mut peer = unsafe { UnixStream::from_raw_fd(b) };
    let reader = std::thread::spawn(move || {
        let mut got = vec![0u8; 8192];
        peer.read_exact(&mut got).map(|_| got.len())
    });

    let reply = call(
        &d,
        RpcCall::SimpleSender(SimpleSenderParams {
            sock: a,
            size_min: 1024,
            size_max: 1024,
            size_rnd_once: true,
            delay_min_us: 2000,
            delay_max_us: 2000,
            delay_rnd_once: true,
            time2run_s: 5,
            ignore_err: false,
        }),
    );
    assert_eq!(reader.join().unwrap().unwrap(), 8192);
    assert_eq!(reply.header.errno, RpcErrno::Pipe);
    match reply.output {
        RpcOutput::Count(sent) => assert!(sent >= 8192, "sent {}", sent),
        other => panic!("unexpected output {:?}", other),
    }

    call(&d, RpcCall::Close { fd: a });
}
