//! Session-limit admission policy (spec.md §4.8): reject-new or
//! evict-oldest on over-limit, with a reservation-entry pattern so
//! in-flight admissions are reflected in the count before the permanent
//! session record exists (spec.md §4.8, §9, §8 P3/P7).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use super::session_store::{handle_store_failure, SessionRecord, SessionStore, StoreFailurePolicy};
use crate::{Error, Result};

/// Short-TTL reservation window: long enough to cover routing + the
/// outbound INVITE + RTPEngine `offer`, short enough that a crashed call
/// self-heals quickly (spec.md §4.8's reservation pattern).
const RESERVATION_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverLimitAction {
    Reject,
    TerminateOldest,
}

#[derive(Debug, Clone)]
pub struct SessionLimitConfig {
    pub enabled: bool,
    pub global_default: u64,
    pub action: OverLimitAction,
}

impl Default for SessionLimitConfig {
    fn default() -> Self {
        Self { enabled: true, global_default: 0, action: OverLimitAction::Reject }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit { reservation_id: String },
    /// `evicted` names the session the caller must now tear down (BYE +
    /// RTPEngine `delete`) before the new call proceeds.
    AdmitAfterEviction { reservation_id: String, evicted_session_id: String },
    Reject,
}

pub struct SessionLimitPolicy {
    config: SessionLimitConfig,
    store: Arc<dyn SessionStore>,
    failure_policy: StoreFailurePolicy,
}

impl SessionLimitPolicy {
    pub fn new(config: SessionLimitConfig, store: Arc<dyn SessionStore>, failure_policy: StoreFailurePolicy) -> Self {
        Self { config, store, failure_policy }
    }

    /// Runs admission for `username`, reserving a slot on success (spec.md
    /// §4.8 steps 1–4). The caller is responsible for replacing the
    /// reservation with a permanent [`SessionRecord`] on 2xx, or calling
    /// [`Self::release_reservation`] on failure.
    ///
    /// A store error during any step is routed through `failure_policy`
    /// (spec.md §6): fail-open admits unconditionally without a backing
    /// reservation record, fail-closed propagates `Error::Store` so the
    /// caller can reject the A-leg with 503.
    pub async fn admit(&self, username: &str) -> Result<AdmissionDecision> {
        if !self.config.enabled {
            return Ok(AdmissionDecision::Admit { reservation_id: reservation_id() });
        }

        let limit = match self.store.get_user_limit(username).await {
            Ok(limit) => limit.unwrap_or(self.config.global_default),
            Err(e) => return self.admit_on_store_failure(e),
        };
        if limit == 0 {
            return Ok(AdmissionDecision::Admit { reservation_id: reservation_id() });
        }

        let count = match self.store.count_user_sessions(username).await {
            Ok(count) => count,
            Err(e) => return self.admit_on_store_failure(e),
        };
        if count < limit {
            let reservation_id = reservation_id();
            if let Err(e) = self.reserve(username, &reservation_id).await {
                return self.admit_on_store_failure(e);
            }
            return Ok(AdmissionDecision::Admit { reservation_id });
        }

        match self.config.action {
            OverLimitAction::Reject => Ok(AdmissionDecision::Reject),
            OverLimitAction::TerminateOldest => {
                let oldest = match self.store.oldest_user_session(username).await {
                    Ok(oldest) => oldest,
                    Err(e) => return self.admit_on_store_failure(e),
                };
                match oldest {
                    Some(record) => {
                        if let Err(e) = self.store.delete_session(&record.session_id).await {
                            return self.admit_on_store_failure(e);
                        }
                        let reservation_id = reservation_id();
                        if let Err(e) = self.reserve(username, &reservation_id).await {
                            return self.admit_on_store_failure(e);
                        }
                        Ok(AdmissionDecision::AdmitAfterEviction {
                            reservation_id,
                            evicted_session_id: record.session_id,
                        })
                    }
                    // No session found to evict despite count >= limit
                    // (expiry skew, spec.md §4.7): proceed as a plain admit.
                    None => {
                        let reservation_id = reservation_id();
                        if let Err(e) = self.reserve(username, &reservation_id).await {
                            return self.admit_on_store_failure(e);
                        }
                        Ok(AdmissionDecision::Admit { reservation_id })
                    }
                }
            }
        }
    }

    /// Fail-open: admit without a reservation record, since the store that
    /// would hold it is the thing that just failed. Fail-closed: propagate
    /// so the caller can map it to a 503.
    fn admit_on_store_failure(&self, err: Error) -> Result<AdmissionDecision> {
        handle_store_failure(self.failure_policy, err)?;
        Ok(AdmissionDecision::Admit { reservation_id: reservation_id() })
    }

    async fn reserve(&self, username: &str, reservation_id: &str) -> Result<()> {
        let record = SessionRecord {
            session_id: reservation_id.to_string(),
            username: username.to_string(),
            created_at: now_epoch(),
            payload: Default::default(),
        };
        self.store.put_session(&record, RESERVATION_TTL).await
    }

    /// Replaces a reservation with the permanent session record on 2xx
    /// (spec.md §4.8).
    pub async fn confirm(&self, username: &str, reservation_id: &str, permanent_session_id: &str) -> Result<()> {
        self.store.delete_session(reservation_id).await?;
        let record = SessionRecord {
            session_id: permanent_session_id.to_string(),
            username: username.to_string(),
            created_at: now_epoch(),
            payload: Default::default(),
        };
        self.store.put_session(&record, super::session_store::SESSION_TTL).await
    }

    /// Removes the reservation on failure, restoring pre-admission state
    /// (spec.md §8 P3).
    pub async fn release_reservation(&self, reservation_id: &str) -> Result<()> {
        self.store.delete_session(reservation_id).await
    }
}

fn reservation_id() -> String {
    format!("resv-{}", Uuid::new_v4())
}

fn now_epoch() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
