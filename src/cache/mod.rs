//! Cache generation management.
//!
//! A generation is the set of captured responses belonging to one deployed
//! version tag. Exactly one generation is current; the rest are stale and
//! removed on activation.

mod manager;

pub use manager::CacheManager;
