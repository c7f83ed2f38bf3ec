//! Network module with deferred startup lifecycle.
//!
//! `new()` assembles state, `start()` binds the listener and `serve()` accepts
//! connections until shutdown, then drains running operations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::{NetworkConfig, TlsConfig};
use super::handlers::{routes, AppState};
use super::middleware::with_http_layers;
use super::shutdown::ShutdownController;
use crate::service::Dispatcher;

/// Extra time given to cancelled workers to record their cancellation.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Owns the HTTP server lifecycle.
///
/// 1. `new()` -- builds the shared state around a dispatcher
/// 2. `start()` -- binds the TCP listener
/// 3. `serve()` -- serves until shutdown, then drains
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let shutdown = dispatcher.shutdown_controller();
        Self {
            config,
            listener: None,
            dispatcher,
            shutdown,
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Router with every route and the middleware stack.
    pub fn build_router(&self) -> Router {
        let state = AppState::new(Arc::clone(&self.dispatcher), self.config.clone());
        with_http_layers(routes(state), &self.config)
    }

    /// Binds the listener and returns the bound port, which differs from the
    /// configured one when that is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `signal` resolves or [`ShutdownController::trigger_shutdown`]
    /// is called.
    ///
    /// Afterwards the service moves to Draining, waits `drain_timeout` for
    /// running backups and restores, cancels the rest and waits briefly for
    /// them to record their cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error if the server hits a fatal I/O error or the TLS
    /// certificates cannot be loaded.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        self,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router();
        let listener = self
            .listener
            .expect("start() must be called before serve()");

        let mut triggered = self.shutdown.shutdown_receiver();
        let stop = async move {
            tokio::select! {
                () = signal => {}
                () = async {
                    let _ = triggered.wait_for(|stopping| *stopping).await;
                } => {}
            }
        };

        self.shutdown.set_ready();

        let served = match self.config.tls {
            Some(ref tls) => serve_tls(listener, router, tls, stop).await,
            None => serve_plain(listener, router, stop).await,
        };

        drain_operations(&self.dispatcher, &self.shutdown, self.config.drain_timeout).await;
        served
    }
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    stop: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("serving plain HTTP");
    axum::serve(listener, router)
        .with_graceful_shutdown(stop)
        .await?;
    Ok(())
}

/// Serves TLS with `axum-server` and rustls on the pre-bound listener.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    stop: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        stop.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!(%addr, "serving TLS");
    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

async fn drain_operations(
    dispatcher: &Dispatcher,
    shutdown: &ShutdownController,
    timeout: Duration,
) {
    shutdown.trigger_shutdown();

    let running = dispatcher.running();
    if running > 0 {
        info!(running, "waiting for running operations");
    }
    if dispatcher.drain(timeout, CANCEL_GRACE).await {
        info!("all operations drained");
    } else {
        warn!(
            remaining = shutdown.in_flight_count(),
            "drain timeout expired with operations still running"
        );
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::*;
    use crate::dataplane::SampleDataplane;
    use crate::network::HealthState;
    use crate::service::ServerConfig;
    use crate::storage::{PitStoreFactory, StorageBackend};

    fn module() -> NetworkModule {
        let stores = Arc::new(PitStoreFactory::new(StorageBackend::Memory).unwrap());
        let dispatcher = Arc::new(Dispatcher::new(
            ServerConfig::default(),
            stores,
            Arc::new(SampleDataplane::new()),
            Arc::new(ShutdownController::new()),
        ));
        let config = NetworkConfig {
            host: "127.0.0.1".to_string(),
            ..NetworkConfig::default()
        };
        NetworkModule::new(config, dispatcher)
    }

    #[test]
    fn new_does_not_bind() {
        let module = module();
        assert!(module.listener.is_none());
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.dispatcher.shutdown_controller()
        ));
    }

    #[tokio::test]
    async fn start_binds_os_assigned_port() {
        let mut module = module();
        let port = module.start().await.unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn serve_stops_on_trigger_and_drains() {
        let mut module = module();
        let port = module.start().await.unwrap();
        let shutdown = module.shutdown_controller();

        let server = tokio::spawn(module.serve(std::future::pending::<()>()));

        let mut ready = false;
        for _ in 0..100 {
            if shutdown.health_state() == HealthState::Ready {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(ready);

        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await;
        assert!(stream.is_ok());
        drop(stream);

        shutdown.trigger_shutdown();
        server.await.unwrap().unwrap();
        assert_eq!(shutdown.health_state(), HealthState::Stopped);
    }

    #[tokio::test]
    async fn router_serves_health() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let module = module();
        let response = module
            .build_router()
            .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    #[should_panic(expected = "start() must be called before serve()")]
    async fn serve_panics_without_start() {
        let _ = module().serve(std::future::pending::<()>()).await;
    }
}
