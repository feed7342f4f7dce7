//! Inbound side of the wire protocol.
//!
//! A listener accepts connections and hands each one to a handler task. A
//! semaphore bounds the number of handlers running at once, so one slow
//! request cannot starve the peer but a burst cannot overwhelm it either.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::error::Result;
use crate::rpc::Request;

/// Implemented by peers: decode a request, run the matching handler, return
/// the response body. Errors become `SUCCESS: false` envelopes.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handle one decoded request.
    async fn dispatch(&self, request: Request) -> Result<serde_json::Value>;
}

/// A running RPC listener bound to one peer.
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Bind `addr:port` and start accepting requests for `service`.
    pub async fn spawn(
        addr: &str,
        port: u16,
        workers: usize,
        service: Arc<dyn RpcService>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((addr, port)).await?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(Notify::new());
        let running = Arc::new(AtomicBool::new(true));
        let permits = Arc::new(Semaphore::new(workers));

        let task = {
            let shutdown = shutdown.clone();
            let running = running.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        accepted = listener.accept() => {
                            let (stream, _) = match accepted {
                                Ok(conn) => conn,
                                Err(e) => {
                                    tracing::warn!(error = %e, "failed to accept connection");
                                    continue;
                                }
                            };
                            let permit = match permits.clone().acquire_owned().await {
                                Ok(p) => p,
                                Err(_) => break,
                            };
                            let service = service.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                if let Err(e) = handle_session(stream, service).await {
                                    tracing::debug!(error = %e, "session ended with error");
                                }
                            });
                        }
                    }
                }
                running.store(false, Ordering::SeqCst);
                tracing::debug!(addr = %local_addr, "rpc listener stopped");
            })
        };

        tracing::debug!(addr = %local_addr, "rpc listener started");
        Ok(Self {
            local_addr,
            shutdown,
            running,
            accept_task: Mutex::new(Some(task)),
        })
    }

    /// The bound address of this listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Is the listener still accepting connections?
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting connections. In-flight handlers finish on their own.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        let task = {
            let mut guard = match self.accept_task.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            guard.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn handle_session(mut stream: TcpStream, service: Arc<dyn RpcService>) -> Result<()> {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;

    // A liveness probe connects and closes without sending anything.
    if raw.is_empty() {
        return Ok(());
    }

    let reply = match serde_json::from_slice::<Request>(&raw) {
        Ok(request) => {
            tracing::trace!(command = %request, "handling request");
            match service.dispatch(request).await {
                Ok(body) => envelope_ok(body),
                Err(e) => envelope_err(&e),
            }
        }
        Err(e) => envelope_err(&Error::Deserialize(e)),
    };

    let bytes = serde_json::to_vec(&reply).map_err(Error::Serialize)?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;
    Ok(())
}

fn envelope_ok(body: serde_json::Value) -> serde_json::Value {
    let mut envelope = match body {
        serde_json::Value::Object(map) => serde_json::Value::Object(map),
        other => serde_json::json!({ "BODY": other }),
    };
    envelope["SUCCESS"] = serde_json::Value::Bool(true);
    envelope
}

fn envelope_err(error: &Error) -> serde_json::Value {
    serde_json::json!({
        "SUCCESS": false,
        "ERRORS": error.to_string(),
    })
}
