//! Wiring of the relay: accept loop, scheduler worker and shutdown.
//!
//! [`RelayService`] owns the scheduler handle and the worker task. Each
//! accepted connection runs [`handle_connection`] on its own task and is
//! counted while in flight so shutdown can wait for it.
//!
//! ## Shutdown phases
//!
//! 1. Stop accepting connections.
//! 2. Wait up to `shutdown_timeout` for in-flight sessions.
//! 3. Cancel the worker. It finishes the job in progress and fails every job
//!    still queued.
//! 4. Wait up to `shutdown_timeout` for the worker to exit.

use crate::server::{
    cache::ChunkCache,
    config::ServerConfig,
    gateway::OverpassGateway,
    notify::{LogNotifier, Notifier, WebhookNotifier},
    scheduler::{Scheduler, WorkerContext},
    session::{SessionConfig, handle_connection},
    storage::{FreeSpaceGuard, StorageGuard},
    telemetry::{decrement_sessions_inflight, increment_sessions},
};
use anyhow::Context;
use core::future::Future;
use core::time::Duration;
use futures::StreamExt;
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

pub struct RelayService {
    scheduler: Scheduler,
    session_config: SessionConfig,
    shutdown_timeout: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
    accept_token: CancellationToken,
    worker_token: CancellationToken,
    sessions_inflight: Arc<AtomicUsize>,
}

impl RelayService {
    /// Builds the production stack from `config`: the on-disk cache, the
    /// Overpass gateway, the configured notifier and the free-space guard.
    pub async fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let cache = ChunkCache::open(&config.cache_dir)
            .await
            .with_context(|| format!("opening cache directory {}", config.cache_dir.display()))?;

        let notifier: Arc<dyn Notifier> = match &config.alert_webhook {
            Some(url) => Arc::new(
                WebhookNotifier::new(url.clone()).context("building alert webhook client")?,
            ),
            None => Arc::new(LogNotifier),
        };

        let storage: Arc<dyn StorageGuard> = Arc::new(FreeSpaceGuard::new(
            config.cache_dir.clone(),
            config.min_free_bytes,
            notifier.clone(),
        ));
        storage.check_free_space().await;

        let gateway = OverpassGateway::new(
            &config.overpass_url,
            config.status_timeout,
            config.fetch_timeout,
        )
        .context("building Overpass HTTP client")?;

        let ctx = WorkerContext {
            gateway: Arc::new(gateway),
            cache,
            notifier,
            storage,
            max_wait: config.max_wait,
        };
        Ok(Self::with_components(config, ctx))
    }

    /// Starts the worker on an explicit set of components.
    pub fn with_components(config: &ServerConfig, ctx: WorkerContext) -> Self {
        let worker_token = CancellationToken::new();
        let (scheduler, worker) = Scheduler::spawn(ctx, worker_token.clone());
        Self {
            scheduler,
            session_config: SessionConfig {
                max_frame_bytes: config.max_frame_bytes,
                ack_timeout: config.ack_timeout,
            },
            shutdown_timeout: config.shutdown_timeout,
            worker: Mutex::new(Some(worker)),
            accept_token: CancellationToken::new(),
            worker_token,
            sessions_inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn sessions_inflight(&self) -> usize {
        self.sessions_inflight.load(Ordering::Relaxed)
    }

    /// Accepts connections until `signal` resolves or [`shutdown`] is called.
    ///
    /// [`shutdown`]: Self::shutdown
    pub async fn serve(
        &self,
        listener: TcpListener,
        signal: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let mut incoming = TcpListenerStream::new(listener);
        tokio::pin!(signal);

        loop {
            tokio::select! {
                biased;
                () = &mut signal => break,
                () = self.accept_token.cancelled() => break,
                next = incoming.next() => match next {
                    Some(Ok(stream)) => self.spawn_session(stream),
                    Some(Err(e)) => tracing::warn!(error = %e, "Failed to accept connection"),
                    None => break,
                },
            }
        }

        tracing::info!("Stopped accepting connections");
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream) {
        let client = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        let guard = InflightGuard::new(self.sessions_inflight.clone());
        let scheduler = self.scheduler.clone();
        let config = self.session_config;

        tokio::spawn(async move {
            handle_connection(stream, client, scheduler, config).await;
            drop(guard);
        });
    }

    pub async fn shutdown(&self) {
        // === Phase 0: Stop accepting new connections ===
        tracing::info!("Refusing new connections");
        self.accept_token.cancel();

        // === Phase 1: Wait for in-flight sessions to drain ===
        tracing::info!(
            "Draining in-flight sessions ({} active, {} queued)",
            self.sessions_inflight(),
            self.scheduler.queued()
        );
        let drained = timeout(self.shutdown_timeout, async {
            while self.sessions_inflight() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        match drained {
            Ok(()) => tracing::debug!("All in-flight sessions drained"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} sessions still active)",
                self.sessions_inflight()
            ),
        }

        // === Phase 2: Stop the worker after its current job ===
        tracing::debug!("Cancelling scheduler worker");
        self.worker_token.cancel();

        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        match timeout(self.shutdown_timeout, worker).await {
            Ok(Ok(())) => tracing::info!("Scheduler worker stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Scheduler worker failed"),
            Err(_) => tracing::warn!("Scheduler worker did not stop in time"),
        }
    }
}

/// Counts a session as in flight for as long as it is alive.
struct InflightGuard {
    counter: Arc<AtomicUsize>,
}

impl InflightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        increment_sessions();
        Self { counter }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
        decrement_sessions_inflight();
    }
}
