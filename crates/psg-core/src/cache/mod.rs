//! Process-wide caches shared across requests.
//!
//! - [`ExcludeBlobCache`] remembers which blobs each client already received
//!   so concurrent or repeated requests can skip them.
//! - [`SplitInfoCache`] keeps assembled id2 split-info blobs.

mod exclude;
mod split_info;

pub use exclude::*;
pub use split_info::*;
