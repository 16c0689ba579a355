//! In-process request tracker backed by a concurrent hash map.

use async_trait::async_trait;
use dashmap::DashMap;
use time::{Duration, OffsetDateTime};

use super::requests::{PendingRequest, RequestTracker};
use crate::{AuthError, AuthResult};

#[derive(Debug, Clone)]
enum TrackedRequest {
    Pending(PendingRequest),
    Consumed { retain_until: OffsetDateTime },
}

impl TrackedRequest {
    fn retain_until(&self, retention: Duration) -> OffsetDateTime {
        match self {
            Self::Pending(p) => p.expires_at.saturating_add(retention),
            Self::Consumed { retain_until } => *retain_until,
        }
    }
}

/// [`RequestTracker`] that keeps entries in memory.
///
/// Consumption takes the shard write lock for the ID, so check-and-mark is
/// atomic with respect to concurrent responses.
#[derive(Debug)]
pub struct InMemoryRequestTracker {
    entries: DashMap<String, TrackedRequest>,
    retention: Duration,
}

impl InMemoryRequestTracker {
    /// Creates a tracker that remembers expired and consumed IDs for
    /// `retention`.
    #[must_use]
    pub fn new(retention: std::time::Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention: crate::clock::to_duration(retention),
        }
    }

    /// Total number of tracked entries, including tombstones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tombstone(&self, now: OffsetDateTime, expires_at: OffsetDateTime) -> TrackedRequest {
        TrackedRequest::Consumed {
            retain_until: now.max(expires_at).saturating_add(self.retention),
        }
    }
}

#[async_trait]
impl RequestTracker for InMemoryRequestTracker {
    async fn register(&self, request: PendingRequest) -> AuthResult<()> {
        match self.entries.entry(request.request_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AuthError::internal(format!(
                "request id {} already registered",
                request.request_id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(TrackedRequest::Pending(request));
                Ok(())
            }
        }
    }

    async fn consume(
        &self,
        request_id: &str,
        relay_state: Option<&str>,
        now: OffsetDateTime,
    ) -> AuthResult<PendingRequest> {
        let Some(mut entry) = self.entries.get_mut(request_id) else {
            return Err(AuthError::unknown_request(request_id));
        };
        let pending = match &*entry {
            TrackedRequest::Consumed { .. } => {
                return Err(AuthError::unknown_request(request_id));
            }
            TrackedRequest::Pending(pending) => pending.clone(),
        };
        *entry = self.tombstone(now, pending.expires_at);
        drop(entry);

        if pending.is_expired(now) {
            return Err(AuthError::request_expired(request_id));
        }
        if relay_state.unwrap_or_default() != pending.relay_state {
            return Err(AuthError::unknown_request(request_id));
        }
        Ok(pending)
    }

    async fn invalidate(&self, request_id: &str, now: OffsetDateTime) -> AuthResult<()> {
        let Some(mut entry) = self.entries.get_mut(request_id) else {
            return Ok(());
        };
        if let TrackedRequest::Pending(pending) = &*entry {
            let expires_at = pending.expires_at;
            *entry = self.tombstone(now, expires_at);
        }
        Ok(())
    }

    async fn cleanup_expired(&self, now: OffsetDateTime) -> AuthResult<u64> {
        let before = self.entries.len();
        self.entries
            .retain(|_, tracked| now < tracked.retain_until(self.retention));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn pending_count(&self, now: OffsetDateTime) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.value(), TrackedRequest::Pending(p) if !p.is_expired(now)))
            .count()
    }
}
