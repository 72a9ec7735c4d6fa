//! qrcache: a shard query result cache with background invalidation.

pub mod cache;
pub mod config;
pub mod infra;
pub mod util;
