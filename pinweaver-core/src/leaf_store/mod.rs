//! Crash-safe container for leaf metadata and MACs.
//!
//! Leaves live in a single append-only file. Mutations are grouped into
//! transactions which become visible atomically when a superblock pointing
//! at them is written.
//!
//! # File Structure
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              FileHeader (20 bytes)       │  offset 0
//! ├──────────────────────────────────────────┤
//! │           SuperblockA (56 bytes)         │  offset 20
//! ├──────────────────────────────────────────┤
//! │           SuperblockB (56 bytes)         │  offset 76
//! ├──────────────────────────────────────────┤
//! │         Data Region (append-only)        │  offset 132+
//! │                                          │
//! │   - TxnBegin records                     │
//! │   - Leaf records                         │
//! │   - IndexSnapshot records                │
//! │   - TxnCommit records                    │
//! └──────────────────────────────────────────┘
//! ```
//!
//! # Transaction Semantics
//!
//! 1. Append `TxnBegin`
//! 2. Append zero or more leaf records
//! 3. Append one `IndexSnapshot` (CBOR label index)
//! 4. Append `TxnCommit` referencing the index
//! 5. Sync, write the next superblock (A or B), sync
//!
//! A crash before step 5 completes leaves the previous transaction active.
//!
//! # Compaction
//!
//! When dead records outweigh live ones, the live leaves are committed again
//! as one transaction past the end of the file, then once more at the start
//! of the data region, and the file is truncated after that copy.
//!
//! # Rollback Detection
//!
//! The index records the version and MAC of every leaf record it points at.
//! A record that does not match its pointer is rejected on read.

mod compaction;
mod file;
mod format;
mod header;
mod index;
mod records;
mod transaction;

pub use compaction::{should_compact, COMPACTION_DEAD_RATIO, COMPACTION_MIN_DEAD_BYTES};
pub use file::LeafFile;
pub use format::*;
pub use header::{select_active_superblock, FileHeader, Superblock, SuperblockSlot};
pub use index::{LeafIndex, LeafPointer, LEAF_INDEX_VERSION};
pub use records::{LeafRecord, RecordEnvelope, TxnBegin, TxnCommit};
pub use transaction::LeafTxn;
