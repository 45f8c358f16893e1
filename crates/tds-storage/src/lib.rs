//! tds-storage: deduplicating container storage with append-only recipes
//!
//! - `index`: the key-value Index Store contract and its JSON / RocksDB backends
//! - `cache`: small LRU of closed container bodies used on restore
//! - `container`: fixed-capacity container packing, rotation, and checkpointing
//! - `recipe`: fixed-width recipe record codec and recipe file naming
//! - `store`: `StorageCore`, composing the above into chunk/recipe store and restore
//! - `sender`: the pipeline stage that feeds encrypted chunks and recipes into a `StorageCore`

pub mod cache;
pub mod container;
pub mod index;
pub mod recipe;
pub mod sender;
pub mod store;

pub use cache::ReadCache;
pub use container::ContainerManager;
pub use index::{IndexBackend, IndexStore, JsonIndex};
pub use sender::{FileSink, Sender, SenderReport, UploadedFile};
pub use store::{RestoreStats, StorageCore, StoreStats};
