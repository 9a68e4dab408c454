//! In-memory lease manager

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

use fleetflow_core::{EngineError, Lease, LeaseManager, SessionId};

/// Per-session leases in a concurrent map
///
/// All checks and writes for a subject happen under its map shard lock,
/// so two concurrent `try_acquire` calls for the same session can never
/// both succeed. An expired lease is reclaimed in place by the next
/// acquirer.
#[derive(Default)]
pub struct InMemoryLeaseManager {
    leases: DashMap<SessionId, Lease>,
}

impl InMemoryLeaseManager {
    /// Create an empty lease manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a subject is currently leased and unexpired (test
    /// observability)
    pub fn is_held(&self, subject: &SessionId) -> bool {
        self.leases
            .get(subject)
            .map(|l| !l.is_expired(Utc::now()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl LeaseManager for InMemoryLeaseManager {
    async fn try_acquire(
        &self,
        subject: &SessionId,
        lease_time: Duration,
    ) -> Result<Lease, EngineError> {
        let now = Utc::now();
        match self.leases.entry(subject.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if !slot.get().is_expired(now) {
                    return Err(EngineError::LockBusy(subject.to_string()));
                }
                debug!(subject = %subject, "reclaiming expired lease");
                let lease = Lease::new(subject.clone(), lease_time);
                slot.insert(lease.clone());
                Ok(lease)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let lease = Lease::new(subject.clone(), lease_time);
                slot.insert(lease.clone());
                Ok(lease)
            }
        }
    }

    async fn renew(&self, lease: &Lease, extra: Duration) -> Result<Lease, EngineError> {
        let now = Utc::now();
        match self.leases.get_mut(&lease.subject) {
            Some(mut held) if held.token == lease.token && !held.is_expired(now) => {
                // A fresh window from now; repeated renews do not stack.
                held.expires_at = now + extra;
                Ok(held.clone())
            }
            _ => Err(EngineError::LockExpired(lease.subject.to_string())),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), EngineError> {
        // Only the token holder may release; a reclaimed lease belongs
        // to someone else now.
        let removed = self
            .leases
            .remove_if(&lease.subject, |_, held| held.token == lease.token);
        match removed {
            Some(_) => Ok(()),
            None => Err(EngineError::LockExpired(lease.subject.to_string())),
        }
    }
}
