//! Platform abstraction traits for the credential tree storage.
//!
//! The leaf store and the software backend never touch the filesystem
//! directly. Everything goes through two traits:
//!
//! - [`LeafFileStore`]: random-access file holding the leaf container
//! - [`AtomicBlobStore`]: small files replaced atomically (hash cache,
//!   software backend state)
//!
//! [`fs`] provides the file-backed implementations used by the CLI and
//! [`memory`] the in-memory ones used by tests and embedders that persist
//! elsewhere.

mod blob_store;
pub mod fs;
mod leaf_file_store;
pub mod memory;

pub use blob_store::AtomicBlobStore;
pub use fs::{FsBlobStore, FsLeafFileStore};
pub use leaf_file_store::LeafFileStore;
pub use memory::{MemoryBlobStore, MemoryLeafFileStore};
