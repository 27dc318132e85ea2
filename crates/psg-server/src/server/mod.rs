//! Server-side components of the gateway.
//!
//! ## Submodules
//!
//! - [`config`] - command line and environment configuration.
//! - [`service`] - HTTP routes, request decoding and processor registration.
//! - [`pool`] - worker tasks that start processors.
//! - [`streaming`] - reply transport and response body.
//! - [`telemetry`] - logging, tracing and metrics initialization.

pub mod config;
pub mod pool;
pub mod service;
pub mod streaming;
pub mod telemetry;
