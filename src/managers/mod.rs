//! Storage back-ends implementing [`CacheManager`](crate::CacheManager).

#[cfg(feature = "manager-moka")]
pub mod moka;
