//! Credential tree storage.
//!
//! A fixed-height tree with fan-out `2^bits_per_level`. Leaf node values are
//! the leaf MACs (all zeroes for an empty slot); every inner node is the
//! SHA-256 of its children concatenated left to right.
//!
//! Leaves are persisted in the [`LeafFile`]. Inner nodes of non-empty
//! subtrees are memoized in memory and in `hash_cache.cbor`; empty subtrees
//! resolve to precomputed per-level default hashes.

mod cache;
mod label;

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::leaf_store::LeafFile;
use crate::storage::{AtomicBlobStore, LeafFileStore, StorageError, HASH_CACHE_BLOB};
use crate::types::{Hash, EMPTY_HASH};

use cache::HashCache;
pub use label::{Label, TreeGeometry};

/// Errors raised by the credential tree.
#[derive(Debug, Error)]
pub enum TreeError {
    /// No leaf is stored under the label.
    #[error("no leaf stored for label {label}")]
    NotFound {
        /// The requested label.
        label: Label,
    },

    /// The label does not address a slot in this tree.
    #[error("label {label} is outside the tree")]
    InvalidLabel {
        /// The requested label.
        label: Label,
    },

    /// The configured geometry is not supported.
    #[error("invalid tree geometry: {reason}")]
    InvalidGeometry {
        /// The violated bound.
        reason: String,
    },

    /// Cached nodes disagree with the leaves beneath them.
    #[error("hash tree corrupted: {reason}")]
    Corruption {
        /// What failed to check out.
        reason: String,
    },

    /// The leaf file failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for tree operations.
pub type TreeResult<T> = Result<T, TreeError>;

/// One stored leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    /// Opaque backend metadata.
    pub metadata: Vec<u8>,
    /// Leaf MAC (the leaf's node value).
    pub mac: Hash,
    /// The backend never confirmed `metadata`; the leaf cannot be used for
    /// authentication.
    pub metadata_lost: bool,
}

/// The credential tree.
pub struct HashTree {
    geometry: TreeGeometry,
    leaves: LeafFile<dyn LeafFileStore>,
    cache_store: Arc<dyn AtomicBlobStore>,
    nodes: HashMap<(u8, u64), Hash>,
    defaults: Vec<Hash>,
}

impl HashTree {
    /// Opens (or creates) the tree stored in `leaf_store`.
    ///
    /// The inner-node cache is reused if it was written for the current
    /// leaf-file generation, otherwise the tree is rebuilt from its leaves.
    ///
    /// # Errors
    ///
    /// Returns an error for an unsupported geometry, a leaf file created for
    /// another geometry, or a damaged leaf file.
    pub fn open(
        leaf_store: Arc<dyn LeafFileStore>,
        cache_store: Arc<dyn AtomicBlobStore>,
        geometry: TreeGeometry,
    ) -> TreeResult<Self> {
        geometry
            .validate()
            .map_err(|reason| TreeError::InvalidGeometry { reason })?;
        let leaves = LeafFile::open_or_create(leaf_store, geometry)?;

        let mut tree = Self {
            geometry,
            leaves,
            cache_store,
            nodes: HashMap::new(),
            defaults: default_hashes(geometry),
        };

        if let Some(nodes) = tree.load_cache() {
            debug!(nodes = nodes.len(), "hash cache accepted");
            tree.nodes = nodes;
        } else {
            tree.nodes = tree.rebuild_nodes();
            debug!(
                leaves = tree.leaves.index().len(),
                "hash tree rebuilt from leaves"
            );
            tree.persist_cache();
        }
        Ok(tree)
    }

    /// Tree shape.
    #[must_use]
    pub const fn geometry(&self) -> TreeGeometry {
        self.geometry
    }

    /// Current root hash.
    #[must_use]
    pub fn root_hash(&self) -> Hash {
        self.node(self.geometry.height, 0)
    }

    /// Number of stored leaves, including tentative ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.leaves.index().len()
    }

    /// Returns `true` if no leaf is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaves.index().is_empty()
    }

    /// Returns `true` if a leaf is stored under `label`.
    #[must_use]
    pub fn contains(&self, label: Label) -> bool {
        self.leaves.index().get(label.0).is_some()
    }

    /// All stored labels in ascending order.
    #[must_use]
    pub fn labels(&self) -> Vec<Label> {
        self.leaves.index().entries.keys().copied().map(Label).collect()
    }

    /// Placeholders written before a backend round trip that never finished:
    /// `metadata_lost` leaves whose MAC is still all zeroes.
    #[must_use]
    pub fn tentative_labels(&self) -> Vec<Label> {
        self.leaves
            .index()
            .entries
            .iter()
            .filter(|(_, pointer)| pointer.metadata_lost && pointer.mac == EMPTY_HASH)
            .map(|(label, _)| Label(*label))
            .collect()
    }

    /// Lowest unused label, or `None` if every slot is taken.
    #[must_use]
    pub fn first_free_label(&self) -> Option<Label> {
        let mut candidate = 0u64;
        for &used in self.leaves.index().entries.keys() {
            if used != candidate {
                break;
            }
            candidate += 1;
        }
        (candidate < self.geometry.leaf_count()).then_some(Label(candidate))
    }

    /// Reads the leaf stored under `label`.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::NotFound`] for an empty slot, or a storage error
    /// if the record fails its rollback checks.
    pub fn get_leaf(&self, label: Label) -> TreeResult<Leaf> {
        self.check_label(label)?;
        let record = self
            .leaves
            .read_leaf(label.0)?
            .ok_or(TreeError::NotFound { label })?;
        Ok(Leaf {
            metadata_lost: record.metadata_lost(),
            metadata: record.metadata,
            mac: record.mac,
        })
    }

    /// Sibling hashes along the path of `label`, leaf level first; within a
    /// level, left to right with the path node itself skipped.
    ///
    /// Each ancestor on the path is recomputed from its children and
    /// compared with the cached value.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidLabel`] for a label outside the tree or
    /// [`TreeError::Corruption`] if the path is inconsistent.
    pub fn get_aux_hashes(&self, label: Label) -> TreeResult<Vec<Hash>> {
        self.check_label(label)?;

        let fan_out = self.geometry.fan_out();
        let mut aux = Vec::with_capacity(self.geometry.aux_len());
        for level in 0..self.geometry.height {
            let own = self.geometry.node_index(label, level);
            let first = own & !(fan_out - 1);
            aux.extend(
                (first..first + fan_out)
                    .filter(|&index| index != own)
                    .map(|index| self.node(level, index)),
            );

            let parent = self.geometry.node_index(label, level + 1);
            if self.hash_children(level + 1, parent) != self.node(level + 1, parent) {
                return Err(TreeError::Corruption {
                    reason: format!("node ({}, {parent}) does not match its children", level + 1),
                });
            }
        }
        Ok(aux)
    }

    /// Writes `label` and updates its ancestors.
    ///
    /// A tentative leaf is recorded with `metadata_lost = true`.
    ///
    /// # Errors
    ///
    /// Returns an error if the label is outside the tree or the leaf file
    /// commit fails; the tree is unchanged in that case.
    pub fn store_leaf(
        &mut self,
        label: Label,
        metadata: &[u8],
        mac: Hash,
        is_tentative: bool,
    ) -> TreeResult<()> {
        self.check_label(label)?;
        self.leaves
            .with_txn(|txn| txn.put_leaf(label.0, mac, metadata, is_tentative))?;
        self.update_path(label);
        self.persist_cache();
        Ok(())
    }

    /// Removes `label`. Removing an empty slot is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the label is outside the tree or the commit fails.
    pub fn remove_leaf(&mut self, label: Label) -> TreeResult<()> {
        self.check_label(label)?;
        if !self.contains(label) {
            return Ok(());
        }
        self.leaves.with_txn(|txn| {
            txn.remove_leaf(label.0);
            Ok(())
        })?;
        self.update_path(label);
        self.persist_cache();
        Ok(())
    }

    /// Removes every leaf.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub fn clear(&mut self) -> TreeResult<()> {
        self.leaves.with_txn(|txn| {
            txn.clear();
            Ok(())
        })?;
        self.nodes.clear();
        self.persist_cache();
        Ok(())
    }

    /// Recomputes every inner node from the leaves and compares with the
    /// memoized ones.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::Corruption`] on any difference.
    pub fn verify(&self) -> TreeResult<()> {
        let rebuilt = self.rebuild_nodes();
        if rebuilt == self.nodes {
            Ok(())
        } else {
            Err(TreeError::Corruption {
                reason: "memoized nodes differ from a rebuild".to_string(),
            })
        }
    }

    const fn check_label(&self, label: Label) -> TreeResult<()> {
        if self.geometry.contains(label) {
            Ok(())
        } else {
            Err(TreeError::InvalidLabel { label })
        }
    }

    fn node(&self, level: u8, index: u64) -> Hash {
        self.node_in(&self.nodes, level, index)
    }

    fn node_in(&self, nodes: &HashMap<(u8, u64), Hash>, level: u8, index: u64) -> Hash {
        if level == 0 {
            return self
                .leaves
                .index()
                .get(index)
                .map_or(EMPTY_HASH, |pointer| pointer.mac);
        }
        nodes
            .get(&(level, index))
            .copied()
            .unwrap_or(self.defaults[usize::from(level)])
    }

    fn hash_children(&self, level: u8, index: u64) -> Hash {
        self.hash_children_in(&self.nodes, level, index)
    }

    fn hash_children_in(&self, nodes: &HashMap<(u8, u64), Hash>, level: u8, index: u64) -> Hash {
        let first = index << self.geometry.bits_per_level;
        let mut hasher = Sha256::new();
        for child in first..first + self.geometry.fan_out() {
            hasher.update(self.node_in(nodes, level - 1, child));
        }
        hasher.finalize().into()
    }

    fn update_path(&mut self, label: Label) {
        let mut nodes = std::mem::take(&mut self.nodes);
        self.update_path_in(&mut nodes, label);
        self.nodes = nodes;
    }

    fn update_path_in(&self, nodes: &mut HashMap<(u8, u64), Hash>, label: Label) {
        for level in 1..=self.geometry.height {
            let index = self.geometry.node_index(label, level);
            let hash = self.hash_children_in(nodes, level, index);
            if hash == self.defaults[usize::from(level)] {
                nodes.remove(&(level, index));
            } else {
                nodes.insert((level, index), hash);
            }
        }
    }

    fn rebuild_nodes(&self) -> HashMap<(u8, u64), Hash> {
        let mut nodes = HashMap::new();
        for label in self.labels() {
            self.update_path_in(&mut nodes, label);
        }
        nodes
    }

    fn load_cache(&self) -> Option<HashMap<(u8, u64), Hash>> {
        let bytes = match self.cache_store.read(HASH_CACHE_BLOB) {
            Ok(bytes) => bytes?,
            Err(err) => {
                warn!(error = %err, "hash cache unreadable, rebuilding");
                return None;
            }
        };
        match HashCache::from_cbor(&bytes) {
            Ok(cache) => cache.into_nodes(self.leaves.generation(), self.geometry),
            Err(err) => {
                warn!(error = %err, "hash cache undecodable, rebuilding");
                None
            }
        }
    }

    fn persist_cache(&self) {
        let cache = HashCache::new(self.leaves.generation(), self.geometry, &self.nodes);
        let result = cache
            .to_cbor()
            .and_then(|bytes| self.cache_store.write_atomic(HASH_CACHE_BLOB, &bytes));
        if let Err(err) = result {
            warn!(error = %err, "failed to persist hash cache");
        }
    }
}

impl std::fmt::Debug for HashTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTree")
            .field("geometry", &self.geometry)
            .field("leaves", &self.len())
            .field("root", &hex::encode(self.root_hash()))
            .finish_non_exhaustive()
    }
}

/// Recomputes the root from a leaf hash and its aux hashes.
///
/// Returns `None` if `label` is outside the tree or `aux` has the wrong
/// length.
#[must_use]
pub fn root_from_aux(
    geometry: TreeGeometry,
    label: Label,
    leaf_hash: &Hash,
    aux: &[Hash],
) -> Option<Hash> {
    if !geometry.contains(label) || aux.len() != geometry.aux_len() {
        return None;
    }

    let siblings_per_level = usize::try_from(geometry.fan_out() - 1).ok()?;
    let mut current = *leaf_hash;
    for (level, siblings) in aux.chunks(siblings_per_level).enumerate() {
        let level = u8::try_from(level).ok()?;
        let position = usize::try_from(
            geometry.child_position(geometry.node_index(label, level)),
        )
        .ok()?;

        let mut hasher = Sha256::new();
        let (left, right) = siblings.split_at(position);
        for sibling in left {
            hasher.update(sibling);
        }
        hasher.update(current);
        for sibling in right {
            hasher.update(sibling);
        }
        current = hasher.finalize().into();
    }
    Some(current)
}

/// Root hash of a tree with every slot empty.
#[must_use]
pub fn empty_root(geometry: TreeGeometry) -> Hash {
    default_hashes(geometry)
        .last()
        .copied()
        .unwrap_or(EMPTY_HASH)
}

fn default_hashes(geometry: TreeGeometry) -> Vec<Hash> {
    let mut defaults = Vec::with_capacity(usize::from(geometry.height) + 1);
    defaults.push(EMPTY_HASH);
    for level in 1..=usize::from(geometry.height) {
        let mut hasher = Sha256::new();
        for _ in 0..geometry.fan_out() {
            hasher.update(defaults[level - 1]);
        }
        defaults.push(hasher.finalize().into());
    }
    defaults
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::storage::{MemoryBlobStore, MemoryLeafFileStore};

    struct Fixture {
        leaf_store: Arc<MemoryLeafFileStore>,
        cache_store: Arc<MemoryBlobStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                leaf_store: Arc::new(MemoryLeafFileStore::new()),
                cache_store: Arc::new(MemoryBlobStore::new()),
            }
        }

        fn open(&self, geometry: TreeGeometry) -> HashTree {
            HashTree::open(
                self.leaf_store.clone(),
                self.cache_store.clone(),
                geometry,
            )
            .unwrap()
        }
    }

    fn mac(byte: u8) -> Hash {
        [byte; 32]
    }

    #[test]
    fn test_empty_tree_root_is_default() {
        let fixture = Fixture::new();
        let tree = fixture.open(TreeGeometry::default());
        assert_eq!(tree.root_hash(), empty_root(TreeGeometry::default()));
        assert_ne!(tree.root_hash(), EMPTY_HASH);
        assert_eq!(tree.first_free_label(), Some(Label(0)));
        assert!(tree.is_empty());
    }

    #[test_case(1, 4 ; "binary")]
    #[test_case(2, 7 ; "default")]
    #[test_case(4, 3 ; "wide")]
    fn test_aux_hashes_reproduce_root(bits: u8, height: u8) {
        let geometry = TreeGeometry::new(bits, height).unwrap();
        let fixture = Fixture::new();
        let mut tree = fixture.open(geometry);

        let labels = [Label(0), Label(1), Label(geometry.leaf_count() - 1), Label(5)];
        for (i, label) in labels.iter().enumerate() {
            tree.store_leaf(*label, b"meta", mac(i as u8 + 1), false)
                .unwrap();
        }

        for (i, label) in labels.iter().enumerate() {
            let aux = tree.get_aux_hashes(*label).unwrap();
            assert_eq!(aux.len(), geometry.aux_len());
            assert_eq!(
                root_from_aux(geometry, *label, &mac(i as u8 + 1), &aux),
                Some(tree.root_hash())
            );
        }
        tree.verify().unwrap();
    }

    #[test]
    fn test_remove_restores_previous_root() {
        let fixture = Fixture::new();
        let mut tree = fixture.open(TreeGeometry::default());
        tree.store_leaf(Label(3), b"a", mac(1), false).unwrap();
        let root_one = tree.root_hash();

        tree.store_leaf(Label(40), b"b", mac(2), false).unwrap();
        assert_ne!(tree.root_hash(), root_one);

        tree.remove_leaf(Label(40)).unwrap();
        assert_eq!(tree.root_hash(), root_one);
        assert!(matches!(
            tree.get_leaf(Label(40)),
            Err(TreeError::NotFound { .. })
        ));
        tree.remove_leaf(Label(40)).unwrap();
    }

    #[test]
    fn test_tentative_leaf_keeps_root() {
        let fixture = Fixture::new();
        let mut tree = fixture.open(TreeGeometry::default());
        let empty_root = tree.root_hash();

        tree.store_leaf(Label(0), b"", EMPTY_HASH, true).unwrap();
        assert_eq!(tree.root_hash(), empty_root);
        assert_eq!(tree.tentative_labels(), vec![Label(0)]);
        assert_eq!(tree.first_free_label(), Some(Label(1)));
        assert!(tree.get_leaf(Label(0)).unwrap().metadata_lost);
    }

    #[test]
    fn test_first_free_label_fills_gaps() {
        let fixture = Fixture::new();
        let mut tree = fixture.open(TreeGeometry::new(1, 2).unwrap());
        for label in 0..4 {
            tree.store_leaf(Label(label), b"x", mac(9), false).unwrap();
        }
        assert_eq!(tree.first_free_label(), None);

        tree.remove_leaf(Label(1)).unwrap();
        assert_eq!(tree.first_free_label(), Some(Label(1)));
    }

    #[test]
    fn test_reopen_uses_cache_and_matches_rebuild() {
        let fixture = Fixture::new();
        let root = {
            let mut tree = fixture.open(TreeGeometry::default());
            tree.store_leaf(Label(7), b"seven", mac(7), false).unwrap();
            tree.store_leaf(Label(900), b"nine hundred", mac(9), false)
                .unwrap();
            tree.root_hash()
        };
        assert!(fixture.cache_store.exists(HASH_CACHE_BLOB).unwrap());

        let tree = fixture.open(TreeGeometry::default());
        assert_eq!(tree.root_hash(), root);

        fixture.cache_store.delete(HASH_CACHE_BLOB).unwrap();
        let tree = fixture.open(TreeGeometry::default());
        assert_eq!(tree.root_hash(), root);
        assert_eq!(tree.get_leaf(Label(900)).unwrap().metadata, b"nine hundred");
    }

    #[test]
    fn test_stale_cache_is_ignored() {
        let fixture = Fixture::new();
        let mut tree = fixture.open(TreeGeometry::default());
        tree.store_leaf(Label(1), b"one", mac(1), false).unwrap();
        let stale = fixture.cache_store.read(HASH_CACHE_BLOB).unwrap().unwrap();

        tree.store_leaf(Label(2), b"two", mac(2), false).unwrap();
        let root = tree.root_hash();
        drop(tree);

        fixture
            .cache_store
            .write_atomic(HASH_CACHE_BLOB, &stale)
            .unwrap();
        let tree = fixture.open(TreeGeometry::default());
        assert_eq!(tree.root_hash(), root);
    }

    #[test]
    fn test_inconsistent_path_is_corruption() {
        let fixture = Fixture::new();
        let mut tree = fixture.open(TreeGeometry::default());
        tree.store_leaf(Label(5), b"five", mac(5), false).unwrap();

        tree.nodes.insert((1, 1), mac(0xEE));
        assert!(matches!(
            tree.get_aux_hashes(Label(5)),
            Err(TreeError::Corruption { .. })
        ));
        assert!(tree.verify().is_err());
    }

    #[test]
    fn test_label_outside_tree() {
        let fixture = Fixture::new();
        let mut tree = fixture.open(TreeGeometry::new(1, 3).unwrap());
        assert!(matches!(
            tree.store_leaf(Label(8), b"", mac(1), false),
            Err(TreeError::InvalidLabel { .. })
        ));
        assert!(root_from_aux(tree.geometry(), Label(8), &mac(1), &[]).is_none());
    }

    #[test]
    fn test_clear_resets_root() {
        let fixture = Fixture::new();
        let mut tree = fixture.open(TreeGeometry::default());
        let empty_root = tree.root_hash();
        tree.store_leaf(Label(12), b"x", mac(3), false).unwrap();
        tree.clear().unwrap();
        assert_eq!(tree.root_hash(), empty_root);
        assert!(tree.labels().is_empty());
    }
}
