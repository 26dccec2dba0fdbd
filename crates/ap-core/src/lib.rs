//! Core plumbing for the AP chat client.
//!
//! Owns everything below the chat state machine: configuration, logging,
//! the auth session coordinator, the SSE stream transport, the backend
//! endpoint client and the local chat cache contract.

pub mod auth;
pub mod backend;
pub mod cache;
pub mod config;
pub mod http;
pub mod logging;
pub mod sse;
pub mod time;

pub use auth::{AuthCoordinator, AuthSessionEvent, FailureMode, FreshTokenOptions, Session};
pub use backend::ApClient;
pub use http::{ApiError, ApiErrorKind, ApiResult};
