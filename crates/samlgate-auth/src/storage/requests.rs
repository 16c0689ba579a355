//! Pending authentication request tracking for replay prevention.
//!
//! Every AuthnRequest the service provider sends is registered here and must
//! be consumed by exactly one response before it expires.
//!
//! # Security Considerations
//!
//! - `consume` must check and mark atomically so that two concurrent
//!   responses for the same request cannot both succeed
//! - Consumed and expired IDs are remembered for a retention window so that
//!   replays and late responses are reported as such
//! - Expired entries should be cleaned up periodically

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;

/// An authentication request awaiting its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// The AuthnRequest `ID`, echoed back as `InResponseTo`.
    pub request_id: String,
    /// Opaque relay state sent alongside the request.
    pub relay_state: String,
    /// Local path the user asked for before being sent to log in.
    pub return_path: String,
    /// When the request was issued.
    pub issued_at: OffsetDateTime,
    /// After this instant the request can no longer be consumed.
    pub expires_at: OffsetDateTime,
}

impl PendingRequest {
    /// Returns `true` if the request can no longer be consumed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

/// Storage trait for outstanding authentication requests.
#[async_trait]
pub trait RequestTracker: Send + Sync {
    /// Registers a newly issued request.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails or the ID is already
    /// known.
    async fn register(&self, request: PendingRequest) -> AuthResult<()>;

    /// Atomically consumes a pending request.
    ///
    /// On success the entry is turned into a tombstone; every later call for
    /// the same ID fails.
    ///
    /// # Errors
    ///
    /// - [`AuthError::UnknownOrReplayedRequest`](crate::AuthError::UnknownOrReplayedRequest)
    ///   if the ID was never issued, was already consumed, or `relay_state`
    ///   does not match the registered value
    /// - [`AuthError::RequestExpired`](crate::AuthError::RequestExpired) if
    ///   the request was issued but has expired
    async fn consume(
        &self,
        request_id: &str,
        relay_state: Option<&str>,
        now: OffsetDateTime,
    ) -> AuthResult<PendingRequest>;

    /// Invalidates a pending request without consuming it successfully.
    ///
    /// Unknown IDs are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn invalidate(&self, request_id: &str, now: OffsetDateTime) -> AuthResult<()>;

    /// Deletes entries whose retention window has passed.
    ///
    /// # Returns
    ///
    /// Returns the number of entries deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the cleanup operation fails.
    async fn cleanup_expired(&self, now: OffsetDateTime) -> AuthResult<u64>;

    /// Number of requests that can still be consumed.
    async fn pending_count(&self, now: OffsetDateTime) -> usize;
}
