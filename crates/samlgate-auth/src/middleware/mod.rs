//! HTTP middleware for the authenticating gateway.
//!
//! - [`gate`] admits requests carrying a valid session and sends everyone
//!   else into the SAML login flow
//! - [`error`] maps protocol errors onto HTTP responses
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, middleware};
//! use samlgate_auth::middleware::{RequestGate, require_session};
//!
//! let app = Router::new()
//!     .fallback(proxy_handler)
//!     .layer(middleware::from_fn_with_state(gate, require_session));
//! ```

pub mod error;
pub mod gate;

pub use gate::{Admission, AuthenticatedSubject, RequestGate, require_session};
