//! Thread-safe handle around a manager.

use std::sync::{Mutex, MutexGuard};

use tracing::error;

use super::{ManagerState, PinWeaverManager};
use crate::backend::PinWeaverBackend;
use crate::error::{PinWeaverError, PinWeaverResult};
use crate::hash_tree::Label;
use crate::types::{
    AuthChannel, CheckCredentialReply, DelaySchedule, Hash, ResetType, StartBiometricsAuthReply,
    ValidPcrValue,
};

/// A [`PinWeaverManager`] behind a mutex, for hosts that call it from more
/// than one thread. Operations are serialized; each one holds the lock for
/// its full backend round trip.
///
/// A panic while the lock is held leaves the tree in an unknown state, so a
/// poisoned mutex is reported as [`PinWeaverError::Locked`].
pub struct SharedPinWeaverManager<B: PinWeaverBackend> {
    inner: Mutex<PinWeaverManager<B>>,
}

impl<B: PinWeaverBackend> std::fmt::Debug for SharedPinWeaverManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPinWeaverManager").finish_non_exhaustive()
    }
}

impl<B: PinWeaverBackend> From<PinWeaverManager<B>> for SharedPinWeaverManager<B> {
    fn from(manager: PinWeaverManager<B>) -> Self {
        Self::new(manager)
    }
}

impl<B: PinWeaverBackend> SharedPinWeaverManager<B> {
    /// Wraps `manager`.
    #[must_use]
    pub const fn new(manager: PinWeaverManager<B>) -> Self {
        Self {
            inner: Mutex::new(manager),
        }
    }

    /// Unwraps the manager.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::Locked`] if the mutex is poisoned.
    pub fn into_inner(self) -> PinWeaverResult<PinWeaverManager<B>> {
        self.inner.into_inner().map_err(|_| poisoned())
    }

    /// Runs `f` with exclusive access to the manager.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::Locked`] if the mutex is poisoned, otherwise
    /// whatever `f` returns.
    pub fn with<T>(
        &self,
        f: impl FnOnce(&mut PinWeaverManager<B>) -> PinWeaverResult<T>,
    ) -> PinWeaverResult<T> {
        f(&mut *self.lock_inner()?)
    }

    /// See [`PinWeaverManager::state`]. A poisoned handle reports `Locked`.
    #[must_use]
    pub fn state(&self) -> ManagerState {
        self.lock_inner()
            .map_or(ManagerState::Locked, |manager| manager.state())
    }

    /// See [`PinWeaverManager::init`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::init`].
    pub fn init(&self) -> PinWeaverResult<()> {
        self.lock_inner()?.init()
    }

    /// See [`PinWeaverManager::reset_tree`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::reset_tree`].
    pub fn reset_tree(&self) -> PinWeaverResult<()> {
        self.lock_inner()?.reset_tree()
    }

    /// See [`PinWeaverManager::sync_hash_tree`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::sync_hash_tree`].
    pub fn sync_hash_tree(&self) -> PinWeaverResult<()> {
        self.lock_inner()?.sync_hash_tree()
    }

    /// See [`PinWeaverManager::insert_credential`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::insert_credential`].
    pub fn insert_credential(
        &self,
        policies: &[ValidPcrValue],
        le_secret: &[u8],
        he_secret: &[u8],
        reset_secret: &[u8],
        delay_schedule: &DelaySchedule,
        expiration_delay: Option<u32>,
    ) -> PinWeaverResult<Label> {
        self.lock_inner()?.insert_credential(
            policies,
            le_secret,
            he_secret,
            reset_secret,
            delay_schedule,
            expiration_delay,
        )
    }

    /// See [`PinWeaverManager::check_credential`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::check_credential`].
    pub fn check_credential(
        &self,
        label: Label,
        le_secret: &[u8],
    ) -> PinWeaverResult<CheckCredentialReply> {
        self.lock_inner()?.check_credential(label, le_secret)
    }

    /// See [`PinWeaverManager::reset_credential`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::reset_credential`].
    pub fn reset_credential(
        &self,
        label: Label,
        reset_secret: &[u8],
        reset_type: ResetType,
    ) -> PinWeaverResult<()> {
        self.lock_inner()?
            .reset_credential(label, reset_secret, reset_type)
    }

    /// See [`PinWeaverManager::remove_credential`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::remove_credential`].
    pub fn remove_credential(&self, label: Label) -> PinWeaverResult<()> {
        self.lock_inner()?.remove_credential(label)
    }

    /// See [`PinWeaverManager::get_wrong_auth_attempts`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::get_wrong_auth_attempts`].
    pub fn get_wrong_auth_attempts(&self, label: Label) -> PinWeaverResult<u32> {
        self.lock_inner()?.get_wrong_auth_attempts(label)
    }

    /// See [`PinWeaverManager::get_delay_schedule`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::get_delay_schedule`].
    pub fn get_delay_schedule(&self, label: Label) -> PinWeaverResult<DelaySchedule> {
        self.lock_inner()?.get_delay_schedule(label)
    }

    /// See [`PinWeaverManager::get_delay_in_seconds`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::get_delay_in_seconds`].
    pub fn get_delay_in_seconds(&self, label: Label) -> PinWeaverResult<u32> {
        self.lock_inner()?.get_delay_in_seconds(label)
    }

    /// See [`PinWeaverManager::get_expiration_in_seconds`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::get_expiration_in_seconds`].
    pub fn get_expiration_in_seconds(&self, label: Label) -> PinWeaverResult<Option<u32>> {
        self.lock_inner()?.get_expiration_in_seconds(label)
    }

    /// See [`PinWeaverManager::list_labels`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::list_labels`].
    pub fn list_labels(&self) -> PinWeaverResult<Vec<Label>> {
        self.lock_inner()?.list_labels()
    }

    /// See [`PinWeaverManager::root_hash`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::root_hash`].
    pub fn root_hash(&self) -> PinWeaverResult<Hash> {
        self.lock_inner()?.root_hash()
    }

    /// See [`PinWeaverManager::generate_pk`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::generate_pk`].
    pub fn generate_pk(
        &self,
        auth_channel: AuthChannel,
        client_public_key: &[u8; 32],
    ) -> PinWeaverResult<[u8; 32]> {
        self.lock_inner()?
            .generate_pk(auth_channel, client_public_key)
    }

    /// See [`PinWeaverManager::insert_rate_limiter`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::insert_rate_limiter`].
    pub fn insert_rate_limiter(
        &self,
        auth_channel: AuthChannel,
        policies: &[ValidPcrValue],
        reset_secret: &[u8],
        delay_schedule: &DelaySchedule,
        expiration_delay: Option<u32>,
    ) -> PinWeaverResult<Label> {
        self.lock_inner()?.insert_rate_limiter(
            auth_channel,
            policies,
            reset_secret,
            delay_schedule,
            expiration_delay,
        )
    }

    /// See [`PinWeaverManager::start_biometrics_auth`].
    ///
    /// # Errors
    ///
    /// As for [`PinWeaverManager::start_biometrics_auth`].
    pub fn start_biometrics_auth(
        &self,
        auth_channel: AuthChannel,
        label: Label,
        client_nonce: &[u8; 32],
    ) -> PinWeaverResult<StartBiometricsAuthReply> {
        self.lock_inner()?
            .start_biometrics_auth(auth_channel, label, client_nonce)
    }

    fn lock_inner(&self) -> PinWeaverResult<MutexGuard<'_, PinWeaverManager<B>>> {
        self.inner.lock().map_err(|_| poisoned())
    }
}

fn poisoned() -> PinWeaverError {
    error!("manager mutex poisoned");
    PinWeaverError::Locked
}
