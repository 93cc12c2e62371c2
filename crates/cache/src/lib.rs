//! Cache data plane for forgecache
//!
//! Translates `(instance, digest)` tuples into object names, exposes
//! streaming read/write with digest enforcement, answers existence
//! probes, and records last-accessed times as a side effect of reads.

mod keys;
mod service;
mod touch;

pub use keys::{action_result_name, object_name, sanitize_instance};
pub use service::{CacheEntry, CacheService};
pub use touch::TouchPool;
