//! The bridge server.
//!
//! A server binds a listening socket, exposes the control endpoints, and
//! registers shipped callables at runtime. It serves either on a dedicated
//! worker thread ([`BoundServer::spawn`]), leaving the host's main loop
//! untouched, or on the calling thread until `kill` is received
//! ([`BoundServer::serve_blocking`]).
//!
//! ```rust,ignore
//! let timers = Arc::new(ManualTimers::new());
//! let server = RpcServer::builder()
//!     .port(0)
//!     .host_adapter(Arc::new(BlenderAdapter::install(timers.as_ref())))
//!     .build()
//!     .bind()?;
//! println!("RPC_PORT={}", server.local_addr().port());
//! let handle = server.spawn()?;
//! ```

mod dispatch;
mod handler;
pub mod queue;

pub use dispatch::{DirectCall, Procedure, ServerState, ShippedCallable};
pub use handler::{handle_health, handle_rpc};

use crate::config::RpcSettings;
use crate::error::{Result, RpcError};
use crate::host::{Callable, HostAdapter};
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Lifecycle of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
}

/// Builder for [`RpcServer`].
pub struct RpcServerBuilder {
    host: String,
    port: u16,
    host_adapter: Option<Arc<dyn HostAdapter>>,
    timeout: Duration,
    traceback_file: Option<PathBuf>,
}

impl Default for RpcServerBuilder {
    fn default() -> Self {
        Self::from_settings(&RpcSettings::from_env())
    }
}

impl RpcServerBuilder {
    pub fn from_settings(settings: &RpcSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            host_adapter: None,
            timeout: settings.timeout,
            traceback_file: settings.traceback_file.clone(),
        }
    }

    /// Address to bind (default `RPC_HOST` or loopback).
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Port to bind; `0` picks a free one.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Guard every registered callable with this host's main-thread queue.
    pub fn host_adapter(mut self, adapter: Arc<dyn HostAdapter>) -> Self {
        self.host_adapter = Some(adapter);
        self
    }

    /// How long a guarded call waits for the host main thread.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn traceback_file(mut self, path: Option<PathBuf>) -> Self {
        self.traceback_file = path;
        self
    }

    pub fn build(self) -> RpcServer {
        RpcServer {
            host: self.host,
            port: self.port,
            state: Arc::new(ServerState::new(
                self.host_adapter,
                self.timeout,
                self.traceback_file,
            )),
        }
    }
}

/// A configured, not yet listening server.
pub struct RpcServer {
    host: String,
    port: u16,
    state: Arc<ServerState>,
}

impl RpcServer {
    pub fn builder() -> RpcServerBuilder {
        RpcServerBuilder::default()
    }

    pub fn status(&self) -> ServerStatus {
        self.state.status()
    }

    /// Register a native callable under `name`.
    pub async fn register_callable(&self, name: &str, callable: Arc<dyn Callable>) {
        self.state
            .register_callable(name, callable, format!("{}(...)", name))
            .await;
    }

    /// Bind the listening socket. Moves the server to `Starting`.
    pub fn bind(self) -> Result<BoundServer> {
        let address = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&address).map_err(|e| RpcError::Config {
            message: format!("could not bind {}: {}", address, e),
        })?;
        let local_addr = listener.local_addr()?;
        self.state.set_status(ServerStatus::Starting);
        info!("Server bound to {}", local_addr);
        Ok(BoundServer {
            listener,
            local_addr,
            state: self.state,
        })
    }
}

/// A server with a bound socket, ready to serve.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Serve on a dedicated worker thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let state = Arc::clone(&self.state);
        let local_addr = self.local_addr;
        let listener = self.listener;

        let thread = std::thread::Builder::new()
            .name("hostrpc-server".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to start server runtime: {}", e);
                        state.set_status(ServerStatus::Stopped);
                        return;
                    }
                };
                let stop = async move {
                    let _ = shutdown_rx.await;
                };
                if let Err(e) = runtime.block_on(serve(listener, Arc::clone(&state), stop)) {
                    error!("Server error: {}", e);
                }
            })?;

        Ok(ServerHandle {
            local_addr,
            state: self.state,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Serve on the calling thread until a `kill` request arrives.
    ///
    /// Must not be called from inside an async runtime.
    pub fn serve_blocking(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(serve(self.listener, self.state, std::future::pending()))
    }
}

async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    stop: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    let local_addr = listener.local_addr()?;
    let app = handler::router(Arc::clone(&state));
    let mut quit = state.subscribe_quit();

    state.set_status(ServerStatus::Running);
    info!("Server listening on {}", local_addr);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = stop => {}
                _ = quit.wait_for(|quit| *quit) => {}
            }
        })
        .await;

    state.set_status(ServerStatus::Stopped);
    info!("Server on {} stopped", local_addr);
    result.map_err(RpcError::from)
}

/// Owner of a server running on its worker thread.
///
/// Dropping the handle shuts the server down and joins the thread.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> ServerStatus {
        self.state.status()
    }

    /// Whether the worker has exited, e.g. after a `kill` request.
    pub fn is_stopped(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop serving and join the worker thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Server thread panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
