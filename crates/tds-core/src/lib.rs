pub mod config;
pub mod error;
pub mod types;

pub use error::{TdsError, TdsResult};
pub use types::{
    Chunk, ChunkKey, ContainerLocation, FileNameHash, Fingerprint, MaskedHash, PipelineItem,
    RecipeEntry,
};
