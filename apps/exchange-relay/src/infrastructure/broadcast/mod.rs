//! Broadcast Hub
//!
//! Per-connection fan-out of cache contents to WebSocket clients.
//!
//! # Architecture
//!
//! The `BroadcastHub` holds what every connection shares: the cache, the
//! subscription manager, push timing, and the open-connection count. Each
//! connection gets a `ConnectionSession` that:
//! - answers control messages (subscribe, unsubscribe, echo, errors)
//! - owns at most one push task, running while the subscription is non-empty
//! - writes every frame into a bounded outbound channel drained by the transport
//!
//! Push tasks read the cache on their own timer and never hold its lock
//! across an `.await`. Cancellation is checked before every send.

pub mod messages;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use messages::{ClientMessageError, ClientRequest, MessageKind, OutboundMessage};

use crate::application::services::MarketCache;
use crate::domain::instrument::InstrumentId;
use crate::domain::subscription::{
    ConnectionId, SubscriptionManager, SubscriptionMode, SubscriptionStats,
};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Push timing and buffering for connection sessions.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Tick in per-instrument mode.
    pub stock_interval: Duration,
    /// Tick in all-instruments mode.
    pub summary_interval: Duration,
    /// Wait before re-checking an empty cache.
    pub empty_cache_wait: Duration,
    /// Instruments per batch when building the summary.
    pub summary_batch_size: usize,
    /// Pause between summary batches.
    pub batch_pause: Duration,
    /// Capacity of each connection's outbound channel.
    pub outbound_capacity: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            stock_interval: Duration::from_secs(2),
            summary_interval: Duration::from_secs(5),
            empty_cache_wait: Duration::from_secs(5),
            summary_batch_size: 50,
            batch_pause: Duration::from_millis(10),
            outbound_capacity: 256,
        }
    }
}

// =============================================================================
// Errors and State
// =============================================================================

/// Error while producing or delivering a frame.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Message could not be encoded.
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Transport side of the outbound channel is gone.
    #[error("outbound channel closed")]
    ChannelClosed,
}

/// Lifecycle of a connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No subscriptions, push task not running.
    Idle,
    /// Push task running.
    Active,
    /// Disconnected; push task cancelled and awaited.
    Closed,
}

// =============================================================================
// Broadcast Hub
// =============================================================================

/// State shared by every connection session.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use exchange_relay::application::services::MarketCache;
/// use exchange_relay::infrastructure::broadcast::{BroadcastHub, PushConfig};
///
/// let hub = Arc::new(BroadcastHub::new(Arc::new(MarketCache::new()), PushConfig::default()));
/// let (tx, _rx) = tokio::sync::mpsc::channel(16);
///
/// let session = hub.connect(tx);
/// assert_eq!(hub.active_connections(), 1);
/// drop(session);
/// assert_eq!(hub.active_connections(), 0);
/// ```
#[derive(Debug)]
pub struct BroadcastHub {
    cache: Arc<MarketCache>,
    subscriptions: Arc<SubscriptionManager>,
    config: PushConfig,
    active: AtomicUsize,
}

/// Shared reference to the hub.
pub type SharedBroadcastHub = Arc<BroadcastHub>;

impl BroadcastHub {
    /// Create a hub over the given cache.
    #[must_use]
    pub fn new(cache: Arc<MarketCache>, config: PushConfig) -> Self {
        Self {
            cache,
            subscriptions: Arc::new(SubscriptionManager::new()),
            config,
            active: AtomicUsize::new(0),
        }
    }

    /// Open a session for a new connection.
    ///
    /// Frames for the client are written to `outbound`.
    #[must_use]
    pub fn connect(self: &Arc<Self>, outbound: mpsc::Sender<String>) -> ConnectionSession {
        let id = uuid::Uuid::new_v4().as_u64_pair().0;
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_connections(active);
        tracing::info!(connection_id = id, active, "Connection opened");

        ConnectionSession {
            id,
            hub: Arc::clone(self),
            outbound,
            push: None,
            closed: false,
        }
    }

    /// Number of open sessions.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Subscription totals across sessions.
    #[must_use]
    pub fn subscription_stats(&self) -> SubscriptionStats {
        self.subscriptions.stats()
    }

    /// Push configuration.
    #[must_use]
    pub const fn config(&self) -> &PushConfig {
        &self.config
    }
}

// =============================================================================
// Connection Session
// =============================================================================

struct PushTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One live WebSocket connection.
pub struct ConnectionSession {
    id: ConnectionId,
    hub: Arc<BroadcastHub>,
    outbound: mpsc::Sender<String>,
    push: Option<PushTask>,
    closed: bool,
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionSession {
    /// Connection identifier.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.push.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            SessionState::Active
        } else {
            SessionState::Idle
        }
    }

    /// Greet the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound channel is closed.
    pub async fn on_connect(&mut self) -> Result<(), SessionError> {
        self.send(&OutboundMessage::connected()).await
    }

    /// Handle one text frame from the client.
    ///
    /// Malformed input is answered in-band; only a closed outbound channel
    /// is reported as an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply cannot be delivered.
    pub async fn on_message(&mut self, raw: &str) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::ChannelClosed);
        }

        let request = match ClientRequest::parse(raw) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(connection_id = self.id, error = %e, "Rejected client message");
                metrics::record_client_error(e.reason());
                return self.send(&OutboundMessage::error(e.to_string())).await;
            }
        };

        let subscriptions = Arc::clone(&self.hub.subscriptions);
        match request {
            ClientRequest::Subscribe(target) => {
                let changes = subscriptions.add_subscriptions(self.id, &target);
                tracing::info!(
                    connection_id = self.id,
                    added = changes.subscribe.len(),
                    all_mode = ?changes.all_mode,
                    "Subscribed"
                );
            }
            ClientRequest::Unsubscribe(target) => {
                let changes = subscriptions.remove_subscriptions(self.id, &target);
                tracing::info!(
                    connection_id = self.id,
                    removed = changes.unsubscribe.len(),
                    all_mode = ?changes.all_mode,
                    "Unsubscribed"
                );
            }
            ClientRequest::Other(value) => {
                return self.send(&OutboundMessage::echo(value)).await;
            }
        }

        let mode = subscriptions.mode(self.id);
        if mode.is_idle() {
            self.stop_push().await;
        }
        self.send(&OutboundMessage::subscription_update(
            subscriptions.subscribed(self.id),
        ))
        .await?;
        if !mode.is_idle() {
            self.ensure_push();
        }

        Ok(())
    }

    /// Tear the session down: cancel and await the push task, drop subscriptions.
    pub async fn on_disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.stop_push().await;
        self.close();
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), SessionError> {
        let text = message.to_text()?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        metrics::record_update_sent(message.kind.as_str());
        Ok(())
    }

    fn ensure_push(&mut self) {
        if self.push.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let pusher = Pusher {
            id: self.id,
            hub: Arc::clone(&self.hub),
            outbound: self.outbound.clone(),
        };
        let handle = tokio::spawn(pusher.run(cancel.clone()));
        self.push = Some(PushTask { cancel, handle });
        tracing::debug!(connection_id = self.id, "Push loop started");
    }

    async fn stop_push(&mut self) {
        let Some(task) = self.push.take() else {
            return;
        };

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            tracing::warn!(connection_id = self.id, error = %e, "Push loop ended abnormally");
        }
        tracing::debug!(connection_id = self.id, "Push loop stopped");
    }

    fn close(&mut self) {
        self.closed = true;
        self.hub.subscriptions.connection_closed(self.id);
        let active = self
            .hub
            .active
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        metrics::set_active_connections(active);
        tracing::info!(connection_id = self.id, active, "Connection closed");
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Some(task) = &self.push {
            task.cancel.cancel();
        }
        if !self.closed {
            self.close();
        }
    }
}

// =============================================================================
// Push Loop
// =============================================================================

struct Pusher {
    id: ConnectionId,
    hub: Arc<BroadcastHub>,
    outbound: mpsc::Sender<String>,
}

impl Pusher {
    async fn run(self, cancel: CancellationToken) {
        let config = self.hub.config.clone();

        while !cancel.is_cancelled() {
            let mode = self.hub.subscriptions.mode(self.id);
            if mode.is_idle() {
                break;
            }

            if !self.hub.cache.has_samples() {
                if !pause(&cancel, config.empty_cache_wait).await {
                    break;
                }
                continue;
            }

            let (interval, result) = match &mode {
                SubscriptionMode::Idle => break,
                SubscriptionMode::Instruments(ids) => {
                    (config.stock_interval, self.push_stocks(&cancel, ids).await)
                }
                SubscriptionMode::All => (
                    config.summary_interval,
                    self.push_summary(&cancel, &config).await,
                ),
            };

            match result {
                Ok(()) => {}
                Err(SessionError::ChannelClosed) => {
                    tracing::debug!(connection_id = self.id, "Outbound channel closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(connection_id = self.id, error = %e, "Failed to build update");
                }
            }

            if !pause(&cancel, interval).await {
                break;
            }
        }
    }

    async fn push_stocks(
        &self,
        cancel: &CancellationToken,
        ids: &[InstrumentId],
    ) -> Result<(), SessionError> {
        let data = self.hub.cache.latest(ids);
        if data.is_empty() {
            return Ok(());
        }
        self.send(cancel, &OutboundMessage::stock_update(&data)?)
            .await
    }

    async fn push_summary(
        &self,
        cancel: &CancellationToken,
        config: &PushConfig,
    ) -> Result<(), SessionError> {
        let ids = self.hub.cache.instrument_ids();
        let mut data = BTreeMap::new();

        for (index, batch) in ids.chunks(config.summary_batch_size.max(1)).enumerate() {
            if index > 0 && !pause(cancel, config.batch_pause).await {
                return Ok(());
            }
            data.extend(self.hub.cache.summary_of(batch));
        }

        if data.is_empty() {
            return Ok(());
        }
        self.send(cancel, &OutboundMessage::all_stocks_update(&data)?)
            .await
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        message: &OutboundMessage,
    ) -> Result<(), SessionError> {
        let text = message.to_text()?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(()),
            sent = self.outbound.send(text) => {
                sent.map_err(|_| SessionError::ChannelClosed)?;
                metrics::record_update_sent(message.kind.as_str());
                Ok(())
            }
        }
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

// =============================================================================
// Tests
// =============================================================================
