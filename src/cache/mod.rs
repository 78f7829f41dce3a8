//! Generic in-memory query cache.
//!
//! This module is resource-agnostic:
//! - Query keys identify parameterized views (collection, page, detail, filtered)
//! - Entries carry data plus fetch/status metadata and a last-updated time
//! - Subscribers are notified on every change to their key
//! - Unsubscribed entries are garbage-collected after a retention window

mod data;
mod key;
mod state;
mod storage;
mod traits;

pub use data::{CacheData, Page, Pagination};
pub use key::{KeyShape, ParamValue, QueryKey};
pub use state::{ErrorInfo, FetchStatus, QueryState, QueryStatus};
pub use storage::{CacheStore, Listener, Subscription};
pub use traits::{apply_patch, record_id, Entity, EntityRef, Record};
