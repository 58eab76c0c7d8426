//! Per-device HTTPS server
//!
//! Each device server owns a small multi-threaded runtime with a fixed number
//! of workers and a bounded blocking pool, so one busy instrument cannot grow
//! the thread count of the whole process.

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use labfleet_core::{Certificate, ServerIdentity};
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Cannot create runtime for {server}: {source}")]
    Runtime {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot bind {server} to {addr}: {source}")]
    Bind {
        server: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid TLS material for {server}: {source}")]
    Tls {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Server {server} did not stop within {grace:?}")]
    StopTimeout { server: String, grace: Duration },
}

/// A running device server
pub struct DeviceServer {
    name: String,
    addr: SocketAddr,
    handle: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
    runtime: Mutex<Option<Runtime>>,
}

impl DeviceServer {
    /// Bind `identity.host:identity.port` and serve `app` over TLS
    ///
    /// The port is bound before this returns, so an address already in use is
    /// reported here rather than from the serving task.
    pub async fn start(
        identity: &ServerIdentity,
        app: Router,
        certificate: &Certificate,
        workers: usize,
    ) -> Result<Self, ServerError> {
        let name = identity.name.clone();
        let addr = SocketAddr::new(identity.host, identity.port);

        let tls = RustlsConfig::from_pem(
            certificate.certificate_pem.clone().into_bytes(),
            certificate.private_key_pem.clone().into_bytes(),
        )
        .await
        .map_err(|source| ServerError::Tls {
            server: name.clone(),
            source,
        })?;

        let bind_error = |source| ServerError::Bind {
            server: name.clone(),
            addr,
            source,
        };
        let listener = TcpListener::bind(addr).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;

        let workers = workers.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .max_blocking_threads(workers * 2)
            .thread_name(format!("rpc-{}", identity.port))
            .enable_all()
            .build()
            .map_err(|source| ServerError::Runtime {
                server: name.clone(),
                source,
            })?;

        let handle = Handle::new();
        let server = axum_server::from_tcp_rustls(listener, tls).handle(handle.clone());
        let task_name = name.clone();
        let task = runtime.spawn(async move {
            if let Err(e) = server.serve(app.into_make_service()).await {
                error!(server = %task_name, error = %e, "Device server failed");
            }
        });

        info!(server = %name, address = %addr, protocol = "HTTPS", workers, "Device server listening");

        Ok(Self {
            name,
            addr,
            handle,
            task: Mutex::new(Some(task)),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, let in-flight requests finish, then drop the runtime
    ///
    /// Calling this again after the first call does nothing.
    pub async fn stop(&self) -> Result<(), ServerError> {
        self.handle.graceful_shutdown(Some(GRACE_PERIOD));

        let task = self.task.lock().take();
        let result = match task {
            Some(task) => {
                match tokio::time::timeout(GRACE_PERIOD + Duration::from_secs(1), task).await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(ServerError::StopTimeout {
                        server: self.name.clone(),
                        grace: GRACE_PERIOD,
                    }),
                }
            }
            None => Ok(()),
        };

        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            debug!(server = %self.name, "Device server stopped");
        }
        result
    }
}

impl Drop for DeviceServer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            self.handle.shutdown();
            runtime.shutdown_background();
        }
    }
}
