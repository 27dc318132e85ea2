//! HTTP service implementation and backend wiring.
//!
//! ## Structure
//!
//! - [`handler`] - the service state and the per-request flow (`PsgService`).
//! - [`routes`] - the axum router.
//! - [`params`] - query string decoding into requests.
//! - [`backends`] - processor registration over the in-memory backends.

pub mod backends;
pub mod handler;
pub mod params;
pub mod routes;
