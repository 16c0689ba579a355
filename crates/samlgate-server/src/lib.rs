//! # samlgate-server
//!
//! Authenticating reverse proxy: browsers log in through a SAML identity
//! provider and admitted requests are forwarded to a pool of backends with
//! round-robin balancing and retries on network failure.

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod gateway;
pub mod observability;
pub mod server;

pub use bootstrap::{AppState, StartupError, build_state};
pub use config::{AppConfig, ConfigError, LogFormat, Overrides};
pub use observability::init_tracing;
pub use server::{GatewayServer, build_router};
