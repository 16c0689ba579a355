//! Storage for service provider protocol state.
//!
//! The only state the protocol engine keeps is the set of outstanding
//! authentication requests. Sessions are stateless signed tokens.

pub mod memory;
pub mod requests;

pub use memory::InMemoryRequestTracker;
pub use requests::{PendingRequest, RequestTracker};
