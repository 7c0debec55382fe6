/*!
 * Server Tests
 * Requests sent over the Unix socket of a running agent
 */

use pretty_assertions::assert_eq;
use rpc_agent::api::{read_message_blocking, write_message_blocking, AgentServer, HelperServers, ServerConfig, ServerLifecycle};
use rpc_agent::core::errors::RpcErrno;
use rpc_agent::core::serialization::bincode::FRAME_FORMAT_VERSION;
use rpc_agent::rpc::{default_registry, CallHeader, CallMode, Dispatcher, HelperLauncher, Reply, Request, RpcCall, RpcOutput};
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

struct Client(UnixStream);

impl Client {
    fn connect(path: &Path) -> Self {
        Self(UnixStream::connect(path).unwrap())
    }

    fn send(&mut self, request: Request) -> Reply {
        write_message_blocking(&mut self.0, &request).unwrap();
        read_message_blocking(&mut self.0).unwrap().unwrap()
    }

    fn call(&mut self, call: RpcCall) -> Reply {
        self.send(Request::sync(call))
    }
}

async fn start(dir: &Path) -> (Arc<AgentServer>, tokio::task::JoinHandle<()>, PathBuf) {
    let config = ServerConfig::new("agt").with_socket_dir(dir);
    let path = config.socket_path();
    let helpers = HelperServers::new(config.clone()) as Arc<dyn HelperLauncher>;
    let dispatcher = Arc::new(Dispatcher::new(default_registry(Some(helpers))));
    let server = Arc::new(AgentServer::new(config, dispatcher));

    let running = Arc::clone(&server);
    let task = tokio::spawn(async move {
        running.start().await.unwrap();
    });
    while !path.exists() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (server, task, path)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_calls_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let (server, task, path) = start(dir.path()).await;

    tokio::task::spawn_blocking(move || {
        let mut client = Client::connect(&path);

        let reply = client.call(RpcCall::GetSizeof { type_name: "long".into() });
        assert_eq!(reply.output, RpcOutput::Int(std::mem::size_of::<libc::c_long>() as i64));

        let closed = client.call(RpcCall::Close { fd: -1 });
        assert_eq!(closed.header.errno, RpcErrno::BadFd);
        assert!(closed.header.errno_changed);

        // A frame that does not decode gets an error reply; the stream stays usable
        client.0.write_all(&[FRAME_FORMAT_VERSION, 2, 0, 0, 0, 0xFF, 0xFF]).unwrap();
        let garbage: Reply = read_message_blocking(&mut client.0).unwrap().unwrap();
        assert_eq!(garbage.header.errno, RpcErrno::InvalidArg);

        let pid = client.call(RpcCall::GetPid);
        assert_eq!(pid.output, RpcOutput::Pid(std::process::id() as i32));
    })
    .await
    .unwrap();

    server.stop().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fire_and_forget_then_poll() {
    let dir = tempfile::tempdir().unwrap();
    let (server, task, path) = start(dir.path()).await;

    tokio::task::spawn_blocking(move || {
        let mut client = Client::connect(&path);

        let started = client.send(Request::new(
            CallHeader {
                mode: CallMode::FireAndForget,
                ..CallHeader::default()
            },
            RpcCall::GetSizeof { type_name: "int".into() },
        ));
        assert!(started.is_ok());
        let jobid = started.header.done;
        assert_ne!(jobid, 0);

        let collected = client.send(Request::new(
            CallHeader {
                mode: CallMode::Poll,
                done: jobid,
                ..CallHeader::default()
            },
            RpcCall::GetSizeof { type_name: "int".into() },
        ));
        assert_eq!(collected.output, RpcOutput::Int(4));
    })
    .await
    .unwrap();

    server.stop().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_thread_helper_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (server, task, path) = start(dir.path()).await;
    let helper_path = dir.path().join("worker.sock");

    tokio::task::spawn_blocking(move || {
        let mut client = Client::connect(&path);

        assert!(client.call(RpcCall::ThreadCreate { name: "worker".into() }).is_ok());
        let again = client.call(RpcCall::ThreadCreate { name: "worker".into() });
        assert_eq!(again.header.errno, RpcErrno::Exists);

        {
            let mut helper = Client::connect(&helper_path);
            let reply = helper.call(RpcCall::GetSizeof { type_name: "short".into() });
            assert_eq!(reply.output, RpcOutput::Int(2));
        }

        assert!(client.call(RpcCall::ThreadJoin { name: "worker".into() }).is_ok());
        let unknown = client.call(RpcCall::ThreadJoin { name: "worker".into() });
        assert_eq!(unknown.header.errno, RpcErrno::NoEntry);
    })
    .await
    .unwrap();

    server.stop().await.unwrap();
    task.await.unwrap();
}
