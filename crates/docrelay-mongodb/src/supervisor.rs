//! Connection supervisor
//!
//! Owns the connection lifecycle for the whole process:
//!
//! ```text
//! Disconnected --start/retry--> Connecting --handshake ok--> Ready
//!      ^                            |                          |
//!      +-------- attempt failed ----+                          |
//!      +-------- ping failed / reconnect requested ------------+
//! ```
//!
//! The loop never gives up: every failure is logged and retried after the
//! same fixed delay. Commands read the published [`StoreHandle`] through
//! [`Supervisor::handle`], which fails fast with `NotReady` while no
//! connection is live.

use docrelay_common::{DocRelayError, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::connection::{Connector, MongoConnector};
use crate::store::StoreHandle;

/// Delay between connection attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Interval between pings while connected
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle state of the supervised connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Ready,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SupervisorState::Disconnected => "disconnected",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Supervisor timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Fixed delay before every retry (default: 5s). Never grows.
    pub retry_delay: Duration,
    /// How often a live connection is pinged; `None` disables health checks
    /// (default: 30s)
    pub health_check_interval: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            health_check_interval: Some(DEFAULT_HEALTH_CHECK_INTERVAL),
        }
    }
}

/// Why the supervisor stopped watching a live connection
#[derive(Debug, PartialEq, Eq)]
enum MonitorExit {
    Shutdown,
    Lost,
    ReconnectRequested,
}

/// Establishes and maintains exactly one live store connection
pub struct Supervisor {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    settings: SupervisorConfig,
    handle: RwLock<Option<StoreHandle>>,
    state: watch::Sender<SupervisorState>,
    attempts: AtomicU64,
    reconnect: Notify,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("settings", &self.settings)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

impl Supervisor {
    /// Create a supervisor that connects through `connector`
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            config,
            connector,
            settings: SupervisorConfig::default(),
            handle: RwLock::new(None),
            state,
            attempts: AtomicU64::new(0),
            reconnect: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a supervisor for a real MongoDB deployment
    pub fn mongo(config: ConnectionConfig) -> Self {
        Self::new(config, Arc::new(MongoConnector))
    }

    pub fn with_settings(mut self, settings: SupervisorConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &SupervisorConfig {
        &self.settings
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Make one connection attempt.
    ///
    /// Does not retry and does not publish the handle; both are the loop's
    /// job. Safe to call again after a failure.
    ///
    /// # Errors
    /// Returns a Connection error for missing settings or any transport
    /// failure
    pub async fn initialize(&self) -> Result<StoreHandle> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.config.validate()?;
        self.connector
            .connect(&self.config)
            .await
            .map_err(|e| match e {
                DocRelayError::Connection(_) => e,
                other => DocRelayError::Connection(other.to_string()),
            })
    }

    /// Run the supervising loop until [`Supervisor::shutdown`] is called.
    ///
    /// Connection failures are logged and retried after the fixed delay;
    /// nothing escapes this function.
    pub async fn start(&self) {
        tracing::info!(
            uri = %self.config.redacted_uri(),
            retry_delay_secs = self.settings.retry_delay.as_secs(),
            "Starting Mongo connection supervisor"
        );

        while !self.shutdown.is_cancelled() {
            self.set_state(SupervisorState::Connecting);

            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                attempt = self.initialize() => attempt,
            };

            let exit = match attempt {
                Ok(handle) => {
                    if !self.publish(handle.clone()) {
                        break;
                    }
                    tracing::info!(
                        database = handle.database_name(),
                        attempt = self.attempts(),
                        "Mongo connection successful..."
                    );
                    self.monitor(&handle).await
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        attempt = self.attempts(),
                        "Mongo connection failed, retrying in {}s",
                        self.settings.retry_delay.as_secs()
                    );
                    MonitorExit::Lost
                }
            };

            self.unpublish();
            match exit {
                MonitorExit::Shutdown => break,
                MonitorExit::ReconnectRequested => continue,
                MonitorExit::Lost => {
                    if !self.pause(self.settings.retry_delay).await {
                        break;
                    }
                }
            }
        }

        self.unpublish();
        tracing::info!("Mongo connection supervisor stopped");
    }

    /// Run [`Supervisor::start`] as a background task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.start().await })
    }

    /// Whether a live handle is currently published
    pub fn is_ready(&self) -> bool {
        self.handle.read().is_some()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Number of connection attempts made so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Take a local copy of the published handle.
    ///
    /// # Errors
    /// Returns NotReady if no connection is live
    pub fn handle(&self) -> Result<StoreHandle> {
        self.handle.read().clone().ok_or_else(|| {
            DocRelayError::NotReady(format!(
                "Mongo connection is {}; no live handle to route the request through",
                self.state()
            ))
        })
    }

    /// Wait until a handle is published.
    ///
    /// # Errors
    /// Returns NotReady if the supervisor shuts down first
    pub async fn wait_ready(&self) -> Result<StoreHandle> {
        let mut states = self.state.subscribe();
        loop {
            if let Ok(handle) = self.handle() {
                return Ok(handle);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(DocRelayError::NotReady("Supervisor shut down".to_string()));
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        return Err(DocRelayError::NotReady("Supervisor dropped".to_string()));
                    }
                }
            }
        }
    }

    /// Drop the live handle and connect again straight away
    pub fn reconnect(&self) {
        if self.is_ready() {
            tracing::info!("Reconnect requested, dropping live Mongo handle");
            self.unpublish();
            self.reconnect.notify_one();
        }
    }

    /// Stop the loop and release the handle
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.unpublish();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Supervisor state changed");
        }
    }

    /// Handle first, then state, so anyone woken by Ready finds the handle.
    /// Refused once shutdown has begun; the check runs under the write lock
    /// that `shutdown` takes after cancelling.
    fn publish(&self, handle: StoreHandle) -> bool {
        {
            let mut slot = self.handle.write();
            if self.shutdown.is_cancelled() {
                return false;
            }
            *slot = Some(handle);
        }
        self.set_state(SupervisorState::Ready);
        true
    }

    fn is_published(&self, handle: &StoreHandle) -> bool {
        self.handle
            .read()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, handle))
    }

    fn unpublish(&self) {
        self.handle.write().take();
        self.set_state(SupervisorState::Disconnected);
    }

    /// Sleep unless shut down first. Returns false on shutdown.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Watch `handle` until shutdown, a reconnect request or a failed ping.
    /// A reconnect wakeup only counts while `handle` is no longer the
    /// published one; a request aimed at an earlier connection is ignored.
    async fn monitor(&self, handle: &StoreHandle) -> MonitorExit {
        loop {
            if !self.is_published(handle) {
                return MonitorExit::ReconnectRequested;
            }

            let check = async {
                match self.settings.health_check_interval {
                    Some(interval) => tokio::time::sleep(interval).await,
                    None => std::future::pending().await,
                }
                handle.ping().await
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => return MonitorExit::Shutdown,
                _ = self.reconnect.notified() => {
                    if !self.is_published(handle) {
                        return MonitorExit::ReconnectRequested;
                    }
                    tracing::debug!("Ignoring stale reconnect request");
                }
                result = check => match result {
                    Ok(()) => tracing::debug!("Mongo health check ok"),
                    Err(e) => {
                        tracing::warn!(error = %e, "Mongo health check failed, reconnecting");
                        return MonitorExit::Lost;
                    }
                },
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
