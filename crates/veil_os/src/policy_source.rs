#![forbid(unsafe_code)]

use veil_engines::policy_vault::{PolicyVault, PolicyVaultError};
use veil_kernel_contracts::policy::{PolicyRecord, PrincipalId};
use veil_storage::repo::PolicyRepo;
use veil_storage::settings_store::StorageError;

const VAULT_TABLE: &str = "policy_vault";

/// `PolicyRepo` over the file-backed vault. The filter wiring stays
/// storage agnostic; a deployment that wants durable policy hands it one
/// of these instead of the in-memory store.
#[derive(Debug, Clone)]
pub struct VaultPolicySource {
    vault: PolicyVault,
}

impl VaultPolicySource {
    pub fn new(vault: PolicyVault) -> Self {
        Self { vault }
    }

    pub fn vault(&self) -> &PolicyVault {
        &self.vault
    }
}

fn backend_error(err: PolicyVaultError) -> StorageError {
    StorageError::BackendUnavailable {
        table: VAULT_TABLE,
        detail: err.to_string(),
    }
}

impl PolicyRepo for VaultPolicySource {
    fn policy_or_default(&self, principal: PrincipalId) -> Result<PolicyRecord, StorageError> {
        match self.vault.load_record(principal) {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Ok(PolicyRecord::default_deny(principal)),
            Err(err) => Err(backend_error(err)),
        }
    }

    fn policy_strict(
        &self,
        principal: PrincipalId,
    ) -> Result<Option<PolicyRecord>, StorageError> {
        self.vault.load_record(principal).map_err(backend_error)
    }

    fn save_policy(&mut self, record: PolicyRecord) -> Result<(), StorageError> {
        self.vault.store_record(&record).map_err(backend_error)
    }

    fn mark_boot_completed(&mut self) -> Result<(), StorageError> {
        self.vault.store_boot_completed().map_err(backend_error)
    }

    fn boot_completed(&self) -> Result<bool, StorageError> {
        self.vault.load_boot_completed().map_err(backend_error)
    }
}
