//! From a decoded request to a streaming HTTP body.
//!
//! - [`coordinator`] dispatches the request and hands its processors to the
//!   worker pool.
//! - [`transport`] carries reply chunks from processors to the body.
//! - [`stream`] is the body itself; dropping it before the reply completes
//!   cancels the request.
//! - [`request`] is the message type of the worker queues.

pub mod coordinator;
pub mod request;
pub mod stream;
pub mod transport;
