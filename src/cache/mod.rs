//! Named cache buckets mapping request identity to stored responses.
//!
//! This module provides the storage side of the offline agent:
//! - Buckets are created on open and listed in creation order
//! - Lookups match on method + URL, either in one bucket or across all of them
//! - Batch writes are all-or-nothing
//! - Deleting a bucket drops every entry it holds

mod storage;

pub use storage::{CacheStorage, EntrySummary, NoopStorage, SqliteStorage};
