//! Shared session store client (spec.md §4.7, §6): a thin wrapper over a
//! Redis-compatible key-value store.
//!
//! Grounded on the `redis` + `deadpool-redis` precedent in
//! `examples/other_examples/manifests/instrumentisto-medea/Cargo.toml` —
//! the only ecosystem example of a shared KV-store client in the
//! reference corpus. Uses the plain `redis` crate's async
//! `ConnectionManager` rather than a separate pooling crate, since a
//! single multiplexed connection already satisfies the concurrency
//! contract in spec.md §5 ("the session store connection pool" is one
//! shared, cheaply-cloned handle here).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

const NAMESPACE: &str = "voice-ferry-c4";

pub const SESSION_TTL: Duration = Duration::from_secs(4 * 3600);
pub const CACHE_TTL: Duration = Duration::from_secs(30 * 60);
pub const CALL_STATE_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub username: String,
    pub created_at: i64,
    pub payload: HashMap<String, String>,
}

fn session_key(session_id: &str) -> String {
    format!("{NAMESPACE}:session:{session_id}")
}

fn user_sessions_key(username: &str) -> String {
    format!("{NAMESPACE}:user-sessions:{username}")
}

fn user_limit_key(username: &str) -> String {
    format!("{NAMESPACE}:user-limit:{username}")
}

fn metric_key(name: &str) -> String {
    format!("{NAMESPACE}:metrics:{name}")
}

pub fn call_state_key(call_id: &str) -> String {
    format!("{NAMESPACE}:call:{call_id}")
}

pub fn cache_key(key: &str) -> String {
    format!("{NAMESPACE}:cache:{key}")
}

/// Degrades session-limit enforcement when the store is unreachable
/// (spec.md §6 "Exit/fatal conditions"). Default is fail-open: a store
/// outage must not stop calls from completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFailurePolicy {
    FailOpen,
    FailClosed,
}

/// Abstracted so integration tests can substitute an in-memory store
/// implementing the same contract (spec.md §11.5 test tooling).
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn put_session(&self, record: &SessionRecord, ttl: Duration) -> Result<()>;
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;
    async fn delete_session(&self, session_id: &str) -> Result<()>;
    async fn count_user_sessions(&self, username: &str) -> Result<u64>;
    async fn list_user_sessions(&self, username: &str) -> Result<Vec<String>>;
    async fn oldest_user_session(&self, username: &str) -> Result<Option<SessionRecord>>;
    async fn get_user_limit(&self, username: &str) -> Result<Option<u64>>;
    async fn set_user_limit(&self, username: &str, limit: u64) -> Result<()>;
    async fn delete_user_limit(&self, username: &str) -> Result<()>;
    async fn increment_metric(&self, name: &str) -> Result<i64>;
    async fn get_metric(&self, name: &str) -> Result<i64>;
}

/// Redis-backed implementation with an in-memory write-through cache for
/// per-user limits (spec.md §4.7: "Cached per-user limits are invalidated
/// on write; a miss falls back to the store").
pub struct RedisSessionStore {
    conn: ConnectionManager,
    limit_cache: DashMap<String, u64>,
    failure_policy: StoreFailurePolicy,
}

impl RedisSessionStore {
    pub async fn connect(url: &str, failure_policy: StoreFailurePolicy) -> Result<Arc<Self>> {
        let client = redis::Client::open(url).map_err(|e| Error::store(e.to_string()))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| Error::store(e.to_string()))?;
        Ok(Arc::new(Self { conn, limit_cache: DashMap::new(), failure_policy }))
    }

    pub fn failure_policy(&self) -> StoreFailurePolicy {
        self.failure_policy
    }
}

#[async_trait::async_trait]
impl SessionStore for RedisSessionStore {
    async fn put_session(&self, record: &SessionRecord, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(record)?;
        let key = session_key(&record.session_id);
        let ttl_secs = ttl.as_secs().max(1);

        let _: () = conn.set_ex(&key, payload, ttl_secs).await.map_err(|e| Error::store(e.to_string()))?;

        let set_key = user_sessions_key(&record.username);
        let _: () = conn.sadd(&set_key, &record.session_id).await.map_err(|e| Error::store(e.to_string()))?;
        let _: () = conn.expire(&set_key, ttl_secs as i64).await.map_err(|e| Error::store(e.to_string()))?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> =
            conn.get(session_key(session_id)).await.map_err(|e| Error::store(e.to_string()))?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let record = self.get_session(session_id).await?;
        let mut conn = self.conn.clone();
        let _: () = conn.del(session_key(session_id)).await.map_err(|e| Error::store(e.to_string()))?;
        if let Some(record) = record {
            let _: () = conn
                .srem(user_sessions_key(&record.username), session_id)
                .await
                .map_err(|e| Error::store(e.to_string()))?;
        }
        Ok(())
    }

    async fn count_user_sessions(&self, username: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        conn.scard(user_sessions_key(username)).await.map_err(|e| Error::store(e.to_string()))
    }

    async fn list_user_sessions(&self, username: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(user_sessions_key(username)).await.map_err(|e| Error::store(e.to_string()))
    }

    /// Consults the set members, fetches each session's creation time, and
    /// picks the earliest (spec.md §4.7). A discrepancy between set size
    /// and fetchable records (expiry skew) is treated as eventual: missing
    /// members are simply skipped rather than treated as an error.
    async fn oldest_user_session(&self, username: &str) -> Result<Option<SessionRecord>> {
        let ids = self.list_user_sessions(username).await?;
        let mut oldest: Option<SessionRecord> = None;
        for id in ids {
            if let Some(record) = self.get_session(&id).await? {
                if oldest.as_ref().map(|o| record.created_at < o.created_at).unwrap_or(true) {
                    oldest = Some(record);
                }
            }
        }
        Ok(oldest)
    }

    async fn get_user_limit(&self, username: &str) -> Result<Option<u64>> {
        if let Some(cached) = self.limit_cache.get(username) {
            return Ok(Some(*cached));
        }
        let mut conn = self.conn.clone();
        let raw: Option<u64> =
            conn.get(user_limit_key(username)).await.map_err(|e| Error::store(e.to_string()))?;
        if let Some(limit) = raw {
            self.limit_cache.insert(username.to_string(), limit);
        }
        Ok(raw)
    }

    async fn set_user_limit(&self, username: &str, limit: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () =
            conn.set(user_limit_key(username), limit).await.map_err(|e| Error::store(e.to_string()))?;
        self.limit_cache.insert(username.to_string(), limit);
        Ok(())
    }

    async fn delete_user_limit(&self, username: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(user_limit_key(username)).await.map_err(|e| Error::store(e.to_string()))?;
        self.limit_cache.remove(username);
        Ok(())
    }

    async fn increment_metric(&self, name: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.incr(metric_key(name), 1).await.map_err(|e| Error::store(e.to_string()))
    }

    async fn get_metric(&self, name: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> =
            conn.get(metric_key(name)).await.map_err(|e| Error::store(e.to_string()))?;
        Ok(value.unwrap_or(0))
    }
}

/// Consults `policy` to decide whether a store failure should be
/// propagated (fail-closed) or swallowed as "proceed without limiting"
/// (fail-open). Logged either way.
pub fn handle_store_failure(policy: StoreFailurePolicy, err: Error) -> Result<()> {
    match policy {
        StoreFailurePolicy::FailOpen => {
            warn!("session store unavailable, failing open: {err}");
            Ok(())
        }
        StoreFailurePolicy::FailClosed => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_use_expected_namespace() {
        assert_eq!(session_key("abc"), "voice-ferry-c4:session:abc");
        assert_eq!(user_sessions_key("bob"), "voice-ferry-c4:user-sessions:bob");
        assert_eq!(user_limit_key("bob"), "voice-ferry-c4:user-limit:bob");
        assert_eq!(metric_key("calls_total"), "voice-ferry-c4:metrics:calls_total");
        assert_eq!(call_state_key("call-1"), "voice-ferry-c4:call:call-1");
        assert_eq!(cache_key("x"), "voice-ferry-c4:cache:x");
    }

    #[test]
    fn fail_open_swallows_error() {
        let err = Error::store("unreachable");
        assert!(handle_store_failure(StoreFailurePolicy::FailOpen, err).is_ok());
    }

    #[test]
    fn fail_closed_propagates_error() {
        let err = Error::store("unreachable");
        assert!(handle_store_failure(StoreFailurePolicy::FailClosed, err).is_err());
    }
}
