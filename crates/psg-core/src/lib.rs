//! Request dispatch and reply streaming for the PubSeq Gateway.
//!
//! A [`dispatcher::Dispatcher`] holds the registered backend processors in
//! priority order. For every request it creates the processors that accept
//! it, grants the first one to start the right to send, and completes the
//! [`reply::Reply`] once every processor reached a terminal status.
//!
//! Backends live under [`processors`]; the storage and remote clients they
//! consume are the traits in [`backend`].

mod common;
pub use common::*;

pub mod backend;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod loop_binder;
pub mod processor;
pub mod processor_ref;
pub mod processors;
pub mod protocol;
pub mod reply;
pub mod request;
