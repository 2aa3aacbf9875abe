use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::auth::User;
use crate::error::ConflictSnafu;
use crate::pubsub::SubscriptionId;
use crate::Result;

/// Opaque unique identifier of a tracked connection.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConnectionId(String);

impl ConnectionId {
    fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live session tracked by the manager.
///
/// The socket itself is owned by the session task; the manager only holds the
/// outbound sender and the cancellation token, so writes and closes never
/// block on a peer.
pub struct Connection {
    /// The connection id.
    pub id: ConnectionId,
    /// Peer address.
    pub remote_addr: SocketAddr,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
    /// Last inbound activity, used for stale eviction.
    pub last_activity: Instant,
    /// Authenticated identity, unset until authentication.
    pub user_id: Option<String>,
    /// Authenticated user record, set together with `user_id`.
    pub user: Option<User>,
    /// topic → broker subscription held by this connection.
    pub subscriptions: HashMap<String, SubscriptionId>,
    /// Free-form metadata.
    pub metadata: HashMap<String, String>,
    sender: tokio::sync::mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

impl Connection {
    /// Whether the connection has completed authentication.
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Counter snapshot reported by [`ConnectionManager::stats`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionStats {
    /// Currently tracked connections.
    pub active_connections: usize,
    /// Tracked connections that have authenticated.
    pub authenticated_connections: usize,
    /// Connections accepted over the manager's lifetime.
    pub total_accepted: u64,
    /// Per-IP active connection counts.
    pub connections_per_ip: HashMap<IpAddr, usize>,
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<ConnectionId, Connection>,
    by_ip: HashMap<IpAddr, HashSet<ConnectionId>>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
    by_topic: HashMap<String, HashSet<ConnectionId>>,
}

/// Tracks active sessions across four mutually consistent indexes.
///
/// All mutation paths (accept, handler, disconnect, stale sweep) serialise on
/// one mutex; sends read a consistent snapshot of the relevant index and then
/// write into per-connection channels outside the lock.
///
/// Both the TCP listener and the WebSocket front-end own an instance each;
/// the behaviour is transport-agnostic, outbound payloads are opaque bytes.
pub struct ConnectionManager {
    max_connections: usize,
    max_connections_per_ip: usize,
    registry: Mutex<Registry>,
    total_accepted: AtomicU64,
}

impl ConnectionManager {
    /// Creates a manager enforcing the given caps.
    pub fn new(max_connections: usize, max_connections_per_ip: usize) -> Self {
        Self {
            max_connections,
            max_connections_per_ip,
            registry: Mutex::new(Registry::default()),
            total_accepted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a newly accepted session.
    ///
    /// Enforces the per-IP cap before the global cap — the two failures are
    /// reported distinctly — and fails before any index insertion.
    pub fn add_connection(
        &self,
        remote_addr: SocketAddr,
        sender: tokio::sync::mpsc::UnboundedSender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<ConnectionId> {
        let ip = remote_addr.ip();
        let mut registry = self.lock();

        let per_ip = registry.by_ip.get(&ip).map_or(0, HashSet::len);
        if per_ip >= self.max_connections_per_ip {
            return ConflictSnafu {
                message: "Connection limit reached",
            }
            .fail();
        }
        if registry.by_id.len() >= self.max_connections {
            return ConflictSnafu {
                message: "Server connection limit reached",
            }
            .fail();
        }

        let id = ConnectionId::generate();
        let connection = Connection {
            id: id.clone(),
            remote_addr,
            connected_at: Utc::now(),
            last_activity: Instant::now(),
            user_id: None,
            user: None,
            subscriptions: HashMap::new(),
            metadata: HashMap::new(),
            sender,
            cancel,
        };
        registry.by_ip.entry(ip).or_default().insert(id.clone());
        registry.by_id.insert(id.clone(), connection);
        self.total_accepted.fetch_add(1, Ordering::Relaxed);

        debug!(connection_id = %id, peer = %remote_addr, "Connection registered.");
        Ok(id)
    }

    /// Removes a connection from every index. Idempotent.
    ///
    /// Broker subscriptions are not touched here; the session handler
    /// unsubscribes before calling this.
    pub fn remove_connection(&self, id: &ConnectionId) {
        let mut registry = self.lock();
        let Some(connection) = registry.by_id.remove(id) else {
            return;
        };

        let ip = connection.remote_addr.ip();
        if let Some(set) = registry.by_ip.get_mut(&ip) {
            set.remove(id);
            if set.is_empty() {
                registry.by_ip.remove(&ip);
            }
        }
        if let Some(user_id) = &connection.user_id {
            if let Some(set) = registry.by_user.get_mut(user_id) {
                set.remove(id);
                if set.is_empty() {
                    registry.by_user.remove(user_id);
                }
            }
        }
        for topic in connection.subscriptions.keys() {
            if let Some(set) = registry.by_topic.get_mut(topic) {
                set.remove(id);
                if set.is_empty() {
                    registry.by_topic.remove(topic);
                }
            }
        }
        debug!(connection_id = %id, "Connection removed.");
    }

    /// Binds an authenticated identity to a connection. No-op if the
    /// connection is gone; the transition is one-way per connection.
    pub fn authenticate_connection(&self, id: &ConnectionId, user_id: &str, user: User) {
        let mut registry = self.lock();
        let Some(connection) = registry.by_id.get_mut(id) else {
            return;
        };
        connection.user_id = Some(user_id.to_owned());
        connection.user = Some(user);
        registry
            .by_user
            .entry(user_id.to_owned())
            .or_default()
            .insert(id.clone());
        trace!(connection_id = %id, user_id, "Connection authenticated.");
    }

    /// Whether the connection exists and has authenticated.
    pub fn is_authenticated(&self, id: &ConnectionId) -> bool {
        self.lock()
            .by_id
            .get(id)
            .is_some_and(Connection::is_authenticated)
    }

    /// The authenticated identity of a connection, if any.
    pub fn user_id_of(&self, id: &ConnectionId) -> Option<String> {
        self.lock().by_id.get(id).and_then(|c| c.user_id.clone())
    }

    /// Whether the connection already holds a subscription for `topic`.
    pub fn has_subscription(&self, id: &ConnectionId, topic: &str) -> bool {
        self.lock()
            .by_id
            .get(id)
            .is_some_and(|c| c.subscriptions.contains_key(topic))
    }

    /// Records a broker subscription on a connection, keeping the topic index
    /// in step. Returns `false` when the connection is gone, in which case
    /// the caller owns the orphaned broker subscription.
    pub fn add_subscription(
        &self,
        id: &ConnectionId,
        topic: &str,
        subscription_id: SubscriptionId,
    ) -> bool {
        let mut registry = self.lock();
        let Some(connection) = registry.by_id.get_mut(id) else {
            return false;
        };
        connection
            .subscriptions
            .insert(topic.to_owned(), subscription_id);
        registry
            .by_topic
            .entry(topic.to_owned())
            .or_default()
            .insert(id.clone());
        true
    }

    /// Drops a connection's subscription for `topic`, returning the broker
    /// subscription id that was held, if any.
    pub fn remove_subscription(&self, id: &ConnectionId, topic: &str) -> Option<SubscriptionId> {
        let mut registry = self.lock();
        let connection = registry.by_id.get_mut(id)?;
        let subscription_id = connection.subscriptions.remove(topic)?;
        if let Some(set) = registry.by_topic.get_mut(topic) {
            set.remove(id);
            if set.is_empty() {
                registry.by_topic.remove(topic);
            }
        }
        Some(subscription_id)
    }

    /// All `(topic, subscription)` pairs a connection currently holds.
    pub fn subscriptions_of(&self, id: &ConnectionId) -> Vec<(String, SubscriptionId)> {
        self.lock().by_id.get(id).map_or_else(Vec::new, |c| {
            c.subscriptions
                .iter()
                .map(|(topic, sub)| (topic.clone(), sub.clone()))
                .collect()
        })
    }

    /// Bumps a connection's activity clock. No-op if gone.
    pub fn update_activity(&self, id: &ConnectionId) {
        if let Some(connection) = self.lock().by_id.get_mut(id) {
            connection.last_activity = Instant::now();
        }
    }

    /// Queues bytes for delivery on one connection.
    ///
    /// Returns `false` when the connection is missing or its session task has
    /// stopped draining the channel.
    pub fn send_to_connection(&self, id: &ConnectionId, bytes: Bytes) -> bool {
        let sender = match self.lock().by_id.get(id) {
            Some(connection) => connection.sender.clone(),
            None => return false,
        };
        sender.send(bytes).is_ok()
    }

    /// Queues bytes on every authenticated connection, returning the number
    /// of sessions reached.
    pub fn broadcast(&self, bytes: Bytes) -> usize {
        let senders: Vec<_> = {
            let registry = self.lock();
            registry
                .by_id
                .values()
                .filter(|c| c.is_authenticated())
                .map(|c| c.sender.clone())
                .collect()
        };
        senders
            .into_iter()
            .filter(|sender| sender.send(bytes.clone()).is_ok())
            .count()
    }

    /// Queues bytes on every connection subscribed to `topic`.
    pub fn broadcast_to_topic(&self, topic: &str, bytes: Bytes) -> usize {
        let senders: Vec<_> = {
            let registry = self.lock();
            let Some(ids) = registry.by_topic.get(topic) else {
                return 0;
            };
            ids.iter()
                .filter_map(|id| registry.by_id.get(id))
                .map(|c| c.sender.clone())
                .collect()
        };
        senders
            .into_iter()
            .filter(|sender| sender.send(bytes.clone()).is_ok())
            .count()
    }

    /// Requests eviction of every connection idle for longer than `max_idle`.
    ///
    /// Eviction is cooperative: the session task is cancelled, closes its
    /// socket, runs its disconnect cleanup (broker unsubscribes) and then
    /// removes the connection. Returns the number of evictions requested.
    pub fn remove_stale_connections(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<(ConnectionId, CancellationToken)> = {
            let registry = self.lock();
            registry
                .by_id
                .values()
                .filter(|c| now.duration_since(c.last_activity) > max_idle)
                .map(|c| (c.id.clone(), c.cancel.clone()))
                .collect()
        };

        for (id, cancel) in &stale {
            debug!(connection_id = %id, "Evicting stale connection.");
            cancel.cancel();
        }
        stale.len()
    }

    /// Gracefully drains every session: requests close, waits up to
    /// `timeout` for the registry to empty, then forcibly clears what is
    /// left. Returns the number of connections that had to be cleared
    /// forcibly.
    pub async fn close_all(&self, timeout: Duration) -> usize {
        let tokens: Vec<CancellationToken> = {
            let registry = self.lock();
            registry.by_id.values().map(|c| c.cancel.clone()).collect()
        };
        for token in tokens {
            token.cancel();
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.lock().by_id.is_empty() {
                return 0;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut registry = self.lock();
        let remaining = registry.by_id.len();
        if remaining > 0 {
            debug!(remaining, "Drain timed out; clearing remaining connections.");
            *registry = Registry::default();
        }
        remaining
    }

    /// Currently tracked connections.
    pub fn active_count(&self) -> usize {
        self.lock().by_id.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ConnectionStats {
        let registry = self.lock();
        ConnectionStats {
            active_connections: registry.by_id.len(),
            authenticated_connections: registry
                .by_id
                .values()
                .filter(|c| c.is_authenticated())
                .count(),
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            connections_per_ip: registry
                .by_ip
                .iter()
                .map(|(ip, set)| (*ip, set.len()))
                .collect(),
        }
    }

    /// Verifies the cross-index invariants. Test support.
    #[cfg(test)]
    pub(crate) fn assert_indexes_consistent(&self) {
        let registry = self.lock();
        for (id, connection) in &registry.by_id {
            assert!(registry.by_ip[&connection.remote_addr.ip()].contains(id));
            if let Some(user_id) = &connection.user_id {
                assert!(registry.by_user[user_id].contains(id));
            }
            for topic in connection.subscriptions.keys() {
                assert!(registry.by_topic[topic].contains(id));
            }
        }
        for (topic, ids) in &registry.by_topic {
            for id in ids {
                assert!(registry.by_id[id].subscriptions.contains_key(topic));
            }
        }
        for ids in registry.by_ip.values() {
            assert!(!ids.is_empty());
            for id in ids {
                assert!(registry.by_id.contains_key(id));
            }
        }
    }
}
