//! Bringing the local tree back in line with the backend.
//!
//! The backend keeps a short log of its latest operations, each tagged with
//! the root it produced. Replay starts after the newest entry whose root is
//! the local root (or at the oldest entry when the local root is not logged)
//! and re-applies every later entry locally, checking the root after each
//! one.
//!
//! Inserts cannot be replayed faithfully: the log carries the new MAC but
//! not the metadata. Such leaves are stored `metadata_lost` so the root
//! matches, then removed through the backend once agreement is reached. The
//! caller has to insert those credentials again. Later auth and reset
//! entries on a lost leaf advance it by their logged MAC alone.

use rand::RngCore;
use tracing::{debug, info, warn};

use super::{PinWeaverManager, UpdateType};
use crate::backend::PinWeaverBackend;
use crate::error::{PinWeaverError, PinWeaverResult};
use crate::hash_tree::{Label, TreeError};
use crate::types::{LogEntry, LogEntryKind, EMPTY_HASH};

/// Size of the random metadata stored for a replayed insert.
const PLACEHOLDER_METADATA_LEN: usize = 32;

impl<B: PinWeaverBackend> PinWeaverManager<B> {
    /// Replays the backend log until both roots agree.
    ///
    /// Never locks the manager: a write that fails during replay leaves the
    /// tree out of sync and the next operation tries again.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::FailedPrecondition`] if the roots still
    /// differ once the log is exhausted, or the backend's error if it cannot
    /// be queried.
    pub(super) fn replay_log(&mut self) -> PinWeaverResult<()> {
        let local_root = self.tree()?.root_hash();
        let backend_root = self.backend.get_root_hash()?;
        if local_root == backend_root {
            debug!("hash tree in sync");
            return Ok(());
        }

        let log = self.backend.get_log(&local_root)?;
        warn!(
            local_root = %hex::encode(local_root),
            backend_root = %hex::encode(backend_root),
            entries = log.len(),
            "hash tree out of sync, replaying backend log"
        );

        let mut replayed_inserts: Vec<Label> = Vec::new();
        for entry in &log {
            if let Err(err) = self.replay_entry(entry, &mut replayed_inserts) {
                warn!(label = %entry.label, error = %err, "log entry could not be replayed");
                break;
            }
            if self.tree()?.root_hash() != entry.root {
                warn!(label = %entry.label, "root after replayed entry differs from the logged one");
                break;
            }
        }

        if self.tree()?.root_hash() != backend_root {
            return Err(PinWeaverError::failed_precondition(
                "backend log does not lead from the local root to the backend root",
            ));
        }

        for label in replayed_inserts {
            self.discard_replayed_insert(label)?;
        }
        info!("hash tree restored from backend log");
        Ok(())
    }

    fn replay_entry(
        &mut self,
        entry: &LogEntry,
        replayed_inserts: &mut Vec<Label>,
    ) -> PinWeaverResult<()> {
        let label = entry.label;
        match &entry.kind {
            LogEntryKind::Insert { mac } => {
                self.tree_mut()?
                    .store_leaf(label, &placeholder_metadata(), *mac, true)?;
                remember(replayed_inserts, label);
                debug!(%label, "replayed insert, metadata lost");
            }
            LogEntryKind::Remove => {
                self.tree_mut()?.remove_leaf(label)?;
                replayed_inserts.retain(|replayed| *replayed != label);
                debug!(%label, "replayed remove");
            }
            LogEntryKind::Auth { mac, .. } | LogEntryKind::Reset { mac, .. } => {
                let tree = self.tree()?;
                let leaf = match tree.get_leaf(label) {
                    Ok(leaf) if !leaf.metadata_lost => leaf,
                    Ok(lost) => {
                        self.tree_mut()?.store_leaf(label, &lost.metadata, *mac, true)?;
                        remember(replayed_inserts, label);
                        debug!(%label, "advanced leaf with lost metadata");
                        return Ok(());
                    }
                    Err(TreeError::NotFound { .. }) => {
                        self.tree_mut()?
                            .store_leaf(label, &placeholder_metadata(), *mac, true)?;
                        remember(replayed_inserts, label);
                        debug!(%label, "leaf missing locally, stored with metadata lost");
                        return Ok(());
                    }
                    Err(err) => return Err(err.into()),
                };
                let aux = tree.get_aux_hashes(label)?;
                let replayed =
                    self.backend
                        .replay_log_operation(label, &entry.root, &aux, &leaf.metadata)?;
                self.update_hash_tree(
                    label,
                    &replayed.metadata,
                    replayed.mac,
                    UpdateType::ReplayInsertLeaf,
                )?;
                debug!(%label, "replayed leaf update");
            }
            LogEntryKind::ResetTree => {
                self.tree_mut()?.clear()?;
                replayed_inserts.clear();
                debug!("replayed tree reset");
            }
        }
        Ok(())
    }

    /// Removes a leaf recreated from an insert entry. A local write failure
    /// is left for the next replay, which finds the backend's remove entry.
    fn discard_replayed_insert(&mut self, label: Label) -> PinWeaverResult<()> {
        let tree = self.tree()?;
        let leaf = tree.get_leaf(label)?;
        let aux = tree.get_aux_hashes(label)?;
        self.backend.remove_leaf(label, &aux, &leaf.mac)?;
        if let Err(err) = self.persist(label, &[], EMPTY_HASH, UpdateType::RemoveLeaf) {
            warn!(%label, error = %err, "replayed insert removed from the backend only");
        } else {
            info!(%label, "replayed insert discarded, credential must be inserted again");
        }
        Ok(())
    }
}

fn placeholder_metadata() -> Vec<u8> {
    let mut placeholder = vec![0u8; PLACEHOLDER_METADATA_LEN];
    rand::thread_rng().fill_bytes(&mut placeholder);
    placeholder
}

fn remember(replayed_inserts: &mut Vec<Label>, label: Label) {
    if !replayed_inserts.contains(&label) {
        replayed_inserts.push(label);
    }
}
