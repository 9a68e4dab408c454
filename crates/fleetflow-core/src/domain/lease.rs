//! Time-bounded exclusive ownership of a flow
//!
//! At most one valid (non-expired) lease exists per subject at any time;
//! an expired lease may be silently reclaimed by any worker. Acquisition
//! is `Result`-typed and non-blocking; a blocking helper retries with
//! sleep and exponential backoff. The scoped guard releases on every
//! exit path.

use crate::{domain::flow::SessionId, EngineError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Exclusive, time-bounded ownership of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// The owned session
    pub subject: SessionId,

    /// Owner token; only the holder of this token may renew or release
    pub token: Uuid,

    /// When the ownership lapses
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Build a fresh lease valid for `lease_time` from now
    pub fn new(subject: SessionId, lease_time: ChronoDuration) -> Self {
        Self {
            subject,
            token: Uuid::new_v4(),
            expires_at: Utc::now() + lease_time,
        }
    }

    /// Whether the lease has lapsed at `now`
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Grants exclusive, time-bounded ownership of sessions
///
/// Implementations must make the existence check and the lease write
/// atomic with respect to other acquirers: two concurrent acquisitions
/// on the same subject must not both succeed.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Acquire a lease, failing immediately with `LockBusy` if a
    /// non-expired lease already exists for the subject
    async fn try_acquire(
        &self,
        subject: &SessionId,
        lease_time: ChronoDuration,
    ) -> Result<Lease, EngineError>;

    /// Grant a held lease a fresh window of `extra` from now; fails with
    /// `LockExpired` if it already lapsed (another owner may have taken
    /// over)
    async fn renew(&self, lease: &Lease, extra: ChronoDuration) -> Result<Lease, EngineError>;

    /// Delete the lease record; fails with `LockExpired` if it already
    /// lapsed or is no longer held by this token
    async fn release(&self, lease: &Lease) -> Result<(), EngineError>;
}

/// Acquire a lease, retrying with sleep and exponential backoff until
/// `timeout` elapses
///
/// Returns `LockBusy` if the subject stayed owned for the whole window.
pub async fn acquire_blocking(
    manager: &dyn LeaseManager,
    subject: &SessionId,
    lease_time: ChronoDuration,
    timeout: Duration,
    retry_initial: Duration,
    retry_max: Duration,
) -> Result<Lease, EngineError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut backoff = retry_initial;
    loop {
        match manager.try_acquire(subject, lease_time).await {
            Ok(lease) => return Ok(lease),
            Err(EngineError::LockBusy(_)) if tokio::time::Instant::now() < deadline => {
                tracing::trace!(subject = %subject, "lease busy, retrying in {:?}", backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(retry_max);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Scoped lease holder that releases on every exit path
///
/// Prefer the explicit async [`LeaseGuard::release`]; dropping the guard
/// without releasing spawns a best-effort release task and logs.
pub struct LeaseGuard {
    lease: Option<Lease>,
    manager: Arc<dyn LeaseManager>,
}

impl LeaseGuard {
    /// Wrap an acquired lease
    pub fn new(lease: Lease, manager: Arc<dyn LeaseManager>) -> Self {
        Self {
            lease: Some(lease),
            manager,
        }
    }

    /// The held lease; `None` once a failed renew invalidated it
    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Extend the held lease
    pub async fn renew(&mut self, extra: ChronoDuration) -> Result<(), EngineError> {
        let current = self.lease.take().ok_or_else(|| {
            EngineError::LockExpired("lease guard already released".to_string())
        })?;
        match self.manager.renew(&current, extra).await {
            Ok(renewed) => {
                self.lease = Some(renewed);
                Ok(())
            }
            Err(err) => {
                // The lease lapsed; nothing left to release on drop.
                Err(err)
            }
        }
    }

    /// Release the lease explicitly
    pub async fn release(mut self) -> Result<(), EngineError> {
        match self.lease.take() {
            Some(lease) => self.manager.release(&lease).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            tracing::warn!(subject = %lease.subject, "lease guard dropped without explicit release");
            let manager = Arc::clone(&self.manager);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(err) = manager.release(&lease).await {
                        tracing::debug!(subject = %lease.subject, "drop-time lease release failed: {err}");
                    }
                });
            }
        }
    }
}
