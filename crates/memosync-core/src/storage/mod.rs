//! Storage abstractions for resource blobs.

mod files;

pub use files::{FsResourceStore, ResourceFileStore};
