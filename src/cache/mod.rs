//! Durable response store.
//!
//! This module provides the persistence side of the interception layer:
//! - Named stores, one per generation, mapping a request identity to a response
//! - Atomic bulk seeding for install
//! - Enumeration and deletion of whole stores for activation
//! - A small metadata table for lifecycle bookkeeping

mod layer;
mod storage;
mod traits;

pub use layer::{StoreHandle, StoreNames};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CachedResponse, RequestIdentity};
