//! Session Registry (C1): `uuid -> (endpoint, last_keepalive)`, with expiry.
//!
//! Replaces the teacher's per-entry `DashMap<SocketAddr, ClientInfo>`
//! (`server.rs::ServerState::clients`) with one `HashMap` behind a single
//! `tokio::sync::RwLock`, matching spec §4.1's "guarded by a reader-writer
//! lock" wording literally: there is exactly one lock, not one per shard.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::wire::SESSION_TIMEOUT;

/// Opaque session identifier, minted by the server on `Connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone)]
struct SessionEntry {
    endpoint: SocketAddr,
    last_keepalive: Instant,
}

/// Outcome of [`SessionRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Replaced,
    RejectedDuplicateEndpoint,
}

/// Outcome of [`SessionRegistry::touch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    Ok,
    Expired,
    Unknown,
}

/// The process-wide table of live sessions.
///
/// Owned by the server and passed by reference to the RPC handler and the
/// fan-out sender — not a singleton (REDESIGN FLAGS: "Singleton session
/// registry").
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `uuid` at `endpoint`.
    ///
    /// A live session already bound to `endpoint` blocks the add *unless*
    /// that session is the one being replaced (same uuid, same endpoint) —
    /// duplicate-endpoint rejection otherwise takes precedence over the
    /// UUID-replace path.
    pub async fn add(&self, uuid: SessionId, endpoint: SocketAddr) -> AddOutcome {
        let now = Instant::now();
        let mut map = self.inner.write().await;

        let dup = map.iter().find(|(id, e)| {
            e.endpoint == endpoint && !is_expired(e, now) && **id != uuid
        });
        if dup.is_some() {
            return AddOutcome::RejectedDuplicateEndpoint;
        }

        let outcome = if map.contains_key(&uuid) {
            AddOutcome::Replaced
        } else {
            AddOutcome::Added
        };
        map.insert(uuid, SessionEntry { endpoint, last_keepalive: now });
        outcome
    }

    /// Removes `uuid` if present. Idempotent.
    pub async fn remove(&self, uuid: SessionId) -> bool {
        self.inner.write().await.remove(&uuid).is_some()
    }

    /// Refreshes `uuid`'s keepalive timestamp if it is present and not yet
    /// stale. A stale entry is reported `Expired` but is *not* removed here
    /// — only the sweeper removes entries, per spec §4.1.
    pub async fn touch(&self, uuid: SessionId) -> TouchOutcome {
        let now = Instant::now();
        let mut map = self.inner.write().await;
        match map.get_mut(&uuid) {
            Some(entry) if !is_expired(entry, now) => {
                entry.last_keepalive = now;
                TouchOutcome::Ok
            }
            Some(_) => TouchOutcome::Expired,
            None => TouchOutcome::Unknown,
        }
    }

    /// Snapshot of endpoints for all sessions that have not timed out.
    pub async fn live_endpoints(&self) -> Vec<SocketAddr> {
        let now = Instant::now();
        self.inner
            .read()
            .await
            .values()
            .filter(|e| !is_expired(e, now))
            .map(|e| e.endpoint)
            .collect()
    }

    /// Number of entries currently tracked, live or stale (test/diagnostic helper).
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Removes every entry whose keepalive has timed out. Intended to run on
    /// a 1-second interval for the lifetime of the server.
    pub async fn sweep(&self) {
        let now = Instant::now();
        self.inner.write().await.retain(|_, e| !is_expired(e, now));
    }

    /// Runs [`sweep`](Self::sweep) forever on a 1s tick. Exits when `running`
    /// flips to `false`.
    pub async fn run_sweeper(&self, running: Arc<std::sync::atomic::AtomicBool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        while running.load(std::sync::atomic::Ordering::Relaxed) {
            interval.tick().await;
            self.sweep().await;
        }
    }
}

fn is_expired(entry: &SessionEntry, now: Instant) -> bool {
    now.duration_since(entry.last_keepalive) >= SESSION_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn add_rejects_duplicate_endpoint() {
        let reg = SessionRegistry::new();
        let a = SessionId::new();
        let b = SessionId::new();
        assert_eq!(reg.add(a, addr(1)).await, AddOutcome::Added);
        assert_eq!(reg.add(b, addr(1)).await, AddOutcome::RejectedDuplicateEndpoint);
    }

    #[tokio::test]
    async fn add_with_same_uuid_and_endpoint_replaces() {
        let reg = SessionRegistry::new();
        let a = SessionId::new();
        assert_eq!(reg.add(a, addr(1)).await, AddOutcome::Added);
        assert_eq!(reg.add(a, addr(1)).await, AddOutcome::Replaced);
    }

    #[tokio::test]
    async fn add_with_existing_uuid_new_endpoint_replaces() {
        let reg = SessionRegistry::new();
        let a = SessionId::new();
        assert_eq!(reg.add(a, addr(1)).await, AddOutcome::Added);
        assert_eq!(reg.add(a, addr(2)).await, AddOutcome::Replaced);
        let eps = reg.live_endpoints().await;
        assert_eq!(eps, vec![addr(2)]);
    }

    #[tokio::test]
    async fn touch_unknown_session_reports_unknown() {
        let reg = SessionRegistry::new();
        assert_eq!(reg.touch(SessionId::new()).await, TouchOutcome::Unknown);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let reg = SessionRegistry::new();
        let a = SessionId::new();
        reg.add(a, addr(1)).await;
        assert!(reg.remove(a).await);
        assert!(!reg.remove(a).await);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_sweep_then_unknown_then_reconnect_succeeds() {
        let reg = SessionRegistry::new();
        let a = SessionId::new();
        reg.add(a, addr(7)).await;

        tokio::time::advance(SESSION_TIMEOUT + std::time::Duration::from_millis(100)).await;
        reg.sweep().await;

        assert_eq!(reg.touch(a).await, TouchOutcome::Unknown);
        assert!(reg.is_empty().await);

        let b = SessionId::new();
        assert_eq!(reg.add(b, addr(7)).await, AddOutcome::Added);
    }

    #[tokio::test(start_paused = true)]
    async fn live_endpoints_excludes_stale_without_removing() {
        let reg = SessionRegistry::new();
        let a = SessionId::new();
        reg.add(a, addr(3)).await;
        tokio::time::advance(SESSION_TIMEOUT + std::time::Duration::from_millis(10)).await;
        assert!(reg.live_endpoints().await.is_empty());
        assert_eq!(reg.len().await, 1);
    }
}
