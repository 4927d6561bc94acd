//! Interfaces and helpers for key/value cache management.
//!
//! Cache buffers are owned by the caller for the whole generation; the types
//! here are cheap handles that validate them and write into them in place.

pub mod api;
pub mod layout;
pub mod memory;
pub mod self_cache;

pub use api::KeyValueCache;
pub use layout::CacheLayout;
pub use memory::MemoryKvCache;
pub use self_cache::SelfKvCache;
