//! Directory metadata caching layer
//!
//! Keeps the listings fetched from a provider for a short staleness window so
//! repeated browsing does not go back to the network.

pub mod metadata;
pub mod path;

pub use metadata::{CacheEntry, DirRef, DirectoryCache, FileMeta, ROOT_ID};
