//! Subscription Management Types
//!
//! Domain types for tracking which instruments each WebSocket connection
//! wants pushed to it.
//!
//! # Design
//!
//! The subscription manager tracks:
//! - Which instruments each connection is subscribed to
//! - Which connections are in all-instruments mode
//! - Reference counts per instrument, for diagnostics
//!
//! Each connection's set is independent; the manager only shares the
//! bookkeeping so the health endpoint can report totals.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;

use super::instrument::InstrumentId;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a WebSocket connection.
pub type ConnectionId = u64;

/// Token that selects every instrument.
pub const ALL_INSTRUMENTS: &str = "all";

/// What a subscribe/unsubscribe request refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTarget {
    /// Every instrument (all-instruments mode).
    All,
    /// The listed instruments.
    Instruments(Vec<InstrumentId>),
}

/// What a connection's push loop should currently send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Nothing subscribed; the push loop must not run.
    Idle,
    /// Updates for the listed instruments.
    Instruments(Vec<InstrumentId>),
    /// The summary of every instrument.
    All,
}

impl SubscriptionMode {
    /// True when nothing is subscribed.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes to one connection's subscription set.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionChanges {
    /// Instruments newly added.
    pub subscribe: HashSet<InstrumentId>,
    /// Instruments removed.
    pub unsubscribe: HashSet<InstrumentId>,
    /// All-instruments mode switched on (`Some(true)`) or off (`Some(false)`).
    pub all_mode: Option<bool>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty() && self.all_mode.is_none()
    }
}

// =============================================================================
// Subscription State
// =============================================================================

#[derive(Debug, Default)]
struct SubscriptionState {
    /// Map from connection ID to its subscribed instruments.
    connection_instruments: HashMap<ConnectionId, BTreeSet<InstrumentId>>,
    /// Map from instrument to the number of connections subscribed to it.
    instrument_refcount: HashMap<InstrumentId, usize>,
    /// Connections in all-instruments mode.
    all_mode: HashSet<ConnectionId>,
}

impl SubscriptionState {
    fn add(&mut self, connection: ConnectionId, instruments: &[InstrumentId]) -> Vec<InstrumentId> {
        let set = self.connection_instruments.entry(connection).or_default();
        let mut added = Vec::new();

        for id in instruments {
            if !set.insert(id.clone()) {
                continue;
            }
            *self.instrument_refcount.entry(id.clone()).or_insert(0) += 1;
            added.push(id.clone());
        }

        if set.is_empty() {
            self.connection_instruments.remove(&connection);
        }

        added
    }

    fn remove(
        &mut self,
        connection: ConnectionId,
        instruments: &[InstrumentId],
    ) -> Vec<InstrumentId> {
        let Some(set) = self.connection_instruments.get_mut(&connection) else {
            return vec![];
        };

        let mut removed = Vec::new();
        for id in instruments {
            if set.remove(id) {
                removed.push(id.clone());
            }
        }

        if set.is_empty() {
            self.connection_instruments.remove(&connection);
        }
        self.release(&removed);

        removed
    }

    fn remove_connection(&mut self, connection: ConnectionId) -> Vec<InstrumentId> {
        self.all_mode.remove(&connection);
        let removed: Vec<_> = self
            .connection_instruments
            .remove(&connection)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        self.release(&removed);

        removed
    }

    fn release(&mut self, instruments: &[InstrumentId]) {
        for id in instruments {
            if let Some(refcount) = self.instrument_refcount.get_mut(id) {
                *refcount = refcount.saturating_sub(1);
                if *refcount == 0 {
                    self.instrument_refcount.remove(id);
                }
            }
        }
    }

    fn instruments(&self, connection: ConnectionId) -> Vec<InstrumentId> {
        self.connection_instruments
            .get(&connection)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

// =============================================================================
// Subscription Manager
// =============================================================================

/// Tracks subscriptions across all live connections.
///
/// # Example
///
/// ```rust
/// use exchange_relay::domain::subscription::{
///     SubscriptionManager, SubscriptionMode, SubscriptionTarget,
/// };
///
/// let manager = SubscriptionManager::new();
/// let target = SubscriptionTarget::Instruments(vec!["A".into(), "B".into()]);
///
/// let changes = manager.add_subscriptions(1, &target);
/// assert_eq!(changes.subscribe.len(), 2);
///
/// manager.remove_subscriptions(1, &SubscriptionTarget::Instruments(vec!["A".into()]));
/// assert_eq!(manager.mode(1), SubscriptionMode::Instruments(vec!["B".into()]));
///
/// manager.add_subscriptions(1, &SubscriptionTarget::All);
/// assert_eq!(manager.mode(1), SubscriptionMode::All);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    state: RwLock<SubscriptionState>,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add subscriptions for a connection.
    pub fn add_subscriptions(
        &self,
        connection: ConnectionId,
        target: &SubscriptionTarget,
    ) -> SubscriptionChanges {
        let mut state = self.state.write();
        match target {
            SubscriptionTarget::All => SubscriptionChanges {
                all_mode: state.all_mode.insert(connection).then_some(true),
                ..Default::default()
            },
            SubscriptionTarget::Instruments(ids) => SubscriptionChanges {
                subscribe: state.add(connection, ids).into_iter().collect(),
                ..Default::default()
            },
        }
    }

    /// Remove subscriptions for a connection.
    ///
    /// Removing [`SubscriptionTarget::All`] clears the connection entirely:
    /// all-instruments mode and every individual instrument.
    pub fn remove_subscriptions(
        &self,
        connection: ConnectionId,
        target: &SubscriptionTarget,
    ) -> SubscriptionChanges {
        let mut state = self.state.write();
        match target {
            SubscriptionTarget::All => {
                let was_all = state.all_mode.contains(&connection);
                let removed = state.remove_connection(connection);
                SubscriptionChanges {
                    unsubscribe: removed.into_iter().collect(),
                    all_mode: was_all.then_some(false),
                    ..Default::default()
                }
            }
            SubscriptionTarget::Instruments(ids) => SubscriptionChanges {
                unsubscribe: state.remove(connection, ids).into_iter().collect(),
                ..Default::default()
            },
        }
    }

    /// Handle connection close: drop everything it was subscribed to.
    pub fn connection_closed(&self, connection: ConnectionId) -> SubscriptionChanges {
        self.remove_subscriptions(connection, &SubscriptionTarget::All)
    }

    /// What the connection's push loop should send right now.
    ///
    /// All-instruments mode takes precedence over individual instruments.
    #[must_use]
    pub fn mode(&self, connection: ConnectionId) -> SubscriptionMode {
        let state = self.state.read();
        if state.all_mode.contains(&connection) {
            return SubscriptionMode::All;
        }

        let instruments = state.instruments(connection);
        if instruments.is_empty() {
            SubscriptionMode::Idle
        } else {
            SubscriptionMode::Instruments(instruments)
        }
    }

    /// The connection's subscription as reported to the client.
    ///
    /// Sorted instrument IDs, prefixed by `"all"` in all-instruments mode.
    #[must_use]
    pub fn subscribed(&self, connection: ConnectionId) -> Vec<String> {
        let state = self.state.read();
        let mut subscribed = Vec::new();
        if state.all_mode.contains(&connection) {
            subscribed.push(ALL_INSTRUMENTS.to_string());
        }
        subscribed.extend(state.instruments(connection));
        subscribed
    }

    /// Get overall statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let state = self.state.read();
        let connections: HashSet<_> = state
            .connection_instruments
            .keys()
            .chain(state.all_mode.iter())
            .collect();

        SubscriptionStats {
            connection_count: connections.len(),
            instrument_count: state.instrument_refcount.len(),
            all_mode_count: state.all_mode.len(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription statistics across connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SubscriptionStats {
    /// Connections with at least one subscription.
    pub connection_count: usize,
    /// Distinct instruments subscribed individually.
    pub instrument_count: usize,
    /// Connections in all-instruments mode.
    pub all_mode_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
