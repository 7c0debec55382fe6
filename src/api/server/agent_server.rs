/*!
 * Agent Server
 * Serves RPC frames on a Unix socket, one task per connection
 */

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::api::traits::ServerLifecycle;
use crate::api::transport::{read_message, write_message, TransportError, TransportResult};
use crate::api::types::ServerConfig;
use crate::core::errors::RpcErrno;
use crate::monitoring::generate_trace_id;
use crate::rpc::{Dispatcher, Reply, Request};

/// Remove a socket file left behind by an earlier instance
pub(crate) fn prepare_socket_path(path: &Path) -> TransportResult<()> {
    let bind_err = |reason: String| TransportError::Bind {
        path: path.display().to_string(),
        reason,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| bind_err(e.to_string()))?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "stale socket removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(bind_err(e.to_string())),
    }
    Ok(())
}

/// Main RPC server of an agent instance
pub struct AgentServer {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    running: AtomicBool,
    shutdown: Notify,
}

impl AgentServer {
    pub fn new(config: ServerConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    async fn serve(&self) -> TransportResult<()> {
        let path = self.config.socket_path();
        prepare_socket_path(&path)?;
        let listener = UnixListener::bind(&path).map_err(|e| TransportError::Bind {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let slots = Arc::new(Semaphore::new(self.config.max_connections));
        info!(
            name = %self.config.name,
            path = %path.display(),
            max_connections = self.config.max_connections,
            "RPC server listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    match Arc::clone(&slots).try_acquire_owned() {
                        Ok(permit) => {
                            tokio::spawn(handle_connection(stream, Arc::clone(&self.dispatcher), permit));
                        }
                        Err(_) => warn!(
                            max_connections = self.config.max_connections,
                            "connection limit reached, client dropped"
                        ),
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }

        if let Err(e) = std::fs::remove_file(&path) {
            debug!(error = %e, "socket already gone");
        }
        info!(name = %self.config.name, "RPC server stopped");
        Ok(())
    }
}

#[instrument(skip_all, fields(conn = %generate_trace_id()))]
async fn handle_connection(stream: UnixStream, dispatcher: Arc<Dispatcher>, _permit: OwnedSemaphorePermit) {
    let (mut reader, mut writer) = stream.into_split();
    debug!("client connected");

    loop {
        let reply = match read_message::<_, Request>(&mut reader).await {
            Ok(Some(request)) => {
                let dispatcher = Arc::clone(&dispatcher);
                let rpc = request.call.name();
                // Primitives may block for the whole run time of a composite
                match tokio::task::spawn_blocking(move || dispatcher.dispatch(request)).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!(rpc, error = %e, "call aborted");
                        Reply::error(RpcErrno::Unknown, format!("{} aborted: {}", rpc, e))
                    }
                }
            }
            Ok(None) => break,
            Err(e @ TransportError::Payload(_)) => {
                warn!(error = %e, "undecodable request");
                Reply::error(RpcErrno::InvalidArg, e.to_string())
            }
            Err(e) => {
                warn!(error = %e, "connection dropped");
                break;
            }
        };

        if let Err(e) = write_message(&mut writer, &reply).await {
            warn!(error = %e, "cannot send reply");
            break;
        }
    }
    debug!("client disconnected");
}

impl ServerLifecycle for AgentServer {
    fn start(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            if self.running.swap(true, Ordering::SeqCst) {
                return Err(TransportError::AlreadyRunning);
            }
            let result = self.serve().await;
            self.running.store(false, Ordering::SeqCst);
            result
        })
    }

    fn stop(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            info!(name = %self.config.name, "RPC server shutdown requested");
            self.shutdown.notify_one();
            Ok(())
        })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::{read_message_blocking, write_message_blocking};
    use crate::rpc::{default_registry, RpcCall, RpcOutput};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serve_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new("unit").with_socket_dir(dir.path());
        let path = config.socket_path();
        let server = Arc::new(AgentServer::new(
            config,
            Arc::new(Dispatcher::new(default_registry(None))),
        ));

        let running = Arc::clone(&server);
        let task = tokio::spawn(async move { running.start().await });
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.is_running());

        let reply = tokio::task::spawn_blocking(move || {
            let mut stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
            write_message_blocking(&mut stream, &Request::sync(RpcCall::GetSizeof { type_name: "int".into() }))
                .unwrap();
            read_message_blocking::<_, Reply>(&mut stream).unwrap().unwrap()
        })
        .await
        .unwrap();
        assert_eq!(reply.output, RpcOutput::Int(4));

        server.stop().await.unwrap();
        task.await.unwrap().unwrap();
        assert!(!server.is_running());
    }
}
