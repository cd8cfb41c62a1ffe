//! TCP server for finger connections.
//!
//! Binds the listener (falling back to an alternate port if the preferred
//! one is unavailable), accepts connections until shutdown is signalled, and
//! hands each connection to the dispatcher on its own task.

use crate::backend::Backend;
use crate::config::Config;
use crate::connection::{handle_connection, ConnectionContext};
use crate::stats::ServerStats;
use crate::timer::Scheduler;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 10000;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    context: Arc<ConnectionContext>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(
        config: Config,
        backend: Arc<dyn Backend>,
        scheduler: Arc<dyn Scheduler>,
        stats: Arc<ServerStats>,
    ) -> Self {
        let context = Arc::new(ConnectionContext {
            timeouts: config.timeouts,
            max_line_length: config.max_line_length,
            scheduler,
            backend,
            stats,
        });

        Server {
            config,
            context,
            connection_limit: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        }
    }

    /// Bind the preferred port, or the fallback port if that fails.
    pub fn bind(&self) -> io::Result<TcpListener> {
        let preferred = resolve(&self.config.host, self.config.port)?;
        match create_listener(preferred) {
            Ok(listener) => {
                info!(address = %preferred, "Server listening");
                Ok(listener)
            }
            Err(e) => {
                let Some(fallback_port) = self.config.fallback_port else {
                    return Err(e);
                };
                warn!(port = self.config.port, error = %e, "Could not bind preferred port");

                let fallback = resolve(&self.config.host, fallback_port)?;
                let listener = create_listener(fallback)?;
                info!(address = %fallback, "Server listening");
                Ok(listener)
            }
        }
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    ///
    /// Open connections are not drained; the listener is closed on return.
    /// An accept failure stops the loop and is returned.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> io::Result<()> {
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down cleanly");
                    return Ok(());
                }
                accepted = accept(&listener, &self.connection_limit) => accepted,
            };

            let (stream, addr, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection, shutting down");
                    return Err(e);
                }
            };

            debug!(peer = %addr, "New connection");
            let context = Arc::clone(&self.context);
            context.stats.connection_opened();

            tokio::spawn(async move {
                let stats = Arc::clone(&context.stats);
                if let Err(e) = handle_connection(stream, context).await {
                    debug!(peer = %addr, error = %e, "Connection error");
                }
                stats.connection_closed();
                drop(permit);
            });
        }
    }
}

/// Wait for a connection slot, then for a connection.
async fn accept(
    listener: &TcpListener,
    limit: &Arc<Semaphore>,
) -> io::Result<(TcpStream, SocketAddr, OwnedSemaphorePermit)> {
    let permit = Arc::clone(limit)
        .acquire_owned()
        .await
        .map_err(io::Error::other)?;
    let (stream, addr) = listener.accept().await?;
    Ok((stream, addr, permit))
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address for {host}:{port}"),
        )
    })
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
