//! Chunked memory files: fixed-size chunking, recipes, sealing, and the
//! content-addressed chunk store.

pub mod chunker;
pub mod cipher;
pub mod recipe;
pub mod store;

pub use chunker::{ChunkSpan, Chunker};
pub use cipher::ChunkCipher;
pub use recipe::Recipe;
pub use store::ChunkStore;
