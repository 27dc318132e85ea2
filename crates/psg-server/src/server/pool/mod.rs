//! Worker tasks that run processors off the request path.
//!
//! - [`manager`] - the round-robin [`manager::WorkerPool`] and its phased
//!   shutdown.
//! - [`worker`] - the loop each worker task runs.

pub mod manager;
pub mod worker;
