//! # clinic-sync
//!
//! Polling cache synchronization for a clinic dashboard.
//!
//! - [`cache`]: resource-agnostic query cache with subscriptions
//! - [`sync`]: per-key polling, the shared rate-limit guard and write fan-out
//! - [`clinic`]: clinic resources, domain types and the REST transport
//!
//! The `clinic-sync` binary is a small terminal front end over [`sync::SyncEngine`].

pub mod cache;
pub mod clinic;
pub mod config;
pub mod error;
pub mod logging;
pub mod sync;
