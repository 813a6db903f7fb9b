mod blob;
mod cache;

pub use blob::{BlobError, BlobStat, BlobStore, BlobWriter, DeletePolicy, Finalized};
pub use cache::{CacheError, CacheStats, ResultCache};
