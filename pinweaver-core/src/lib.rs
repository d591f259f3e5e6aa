//! PinWeaver: low-entropy credentials (PINs, biometric rate limiters)
//! guarded by a secure element that only holds the root of a hash tree.
//!
//! The host keeps the tree in [`HashTree`] (leaves persisted by the
//! crash-safe [`leaf_store`]); the secure element is any
//! [`PinWeaverBackend`]. [`PinWeaverManager`] runs every operation against
//! both and replays the backend log when they drift apart.

pub mod backend;
pub use backend::{PinWeaverBackend, SoftwareBackend};

mod config;
pub use config::{ConfigError, PinWeaverConfig};

mod error;
pub use error::{PinWeaverError, PinWeaverResult};

pub mod hash_tree;
pub use hash_tree::{HashTree, Label, TreeGeometry};

pub mod leaf_store;

pub mod logger;

mod manager;
pub use manager::{ManagerState, PinWeaverManager, SharedPinWeaverManager, UpdateType};

pub mod storage;
pub use storage::{StoragePaths, TreeStorage};

mod types;
pub use types::*;
