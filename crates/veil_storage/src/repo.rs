#![forbid(unsafe_code)]

use veil_kernel_contracts::notice::{DecisionNoticeId, DecisionNoticeInput};
use veil_kernel_contracts::policy::{PolicyRecord, PrincipalId};

use crate::decision_log::DecisionLog;
use crate::settings_store::{SettingsStore, StorageError};

/// Typed repository interface for per-principal policy records and the
/// boot-completed latch. Wirings depend on this trait, not on a concrete
/// store, so a file-backed source can stand in for the in-memory one.
pub trait PolicyRepo {
    /// Total fetch. An absent principal resolves to the default-deny record.
    fn policy_or_default(&self, principal: PrincipalId) -> Result<PolicyRecord, StorageError>;

    /// Strict fetch. Absent principals stay absent; callers that must not
    /// invent records use this form.
    fn policy_strict(&self, principal: PrincipalId)
        -> Result<Option<PolicyRecord>, StorageError>;

    fn save_policy(&mut self, record: PolicyRecord) -> Result<(), StorageError>;

    fn mark_boot_completed(&mut self) -> Result<(), StorageError>;

    fn boot_completed(&self) -> Result<bool, StorageError>;
}

/// Typed repository interface for the append-only decision log.
pub trait DecisionRepo {
    fn record_decision(
        &mut self,
        input: DecisionNoticeInput,
    ) -> Result<DecisionNoticeId, StorageError>;
}

impl PolicyRepo for SettingsStore {
    fn policy_or_default(&self, principal: PrincipalId) -> Result<PolicyRecord, StorageError> {
        Ok(self.policy_record_or_default(principal))
    }

    fn policy_strict(
        &self,
        principal: PrincipalId,
    ) -> Result<Option<PolicyRecord>, StorageError> {
        Ok(self.policy_record_strict(principal))
    }

    fn save_policy(&mut self, record: PolicyRecord) -> Result<(), StorageError> {
        self.upsert_policy_record(record)
    }

    fn mark_boot_completed(&mut self) -> Result<(), StorageError> {
        self.set_boot_completed();
        Ok(())
    }

    fn boot_completed(&self) -> Result<bool, StorageError> {
        Ok(self.boot_completed_flag())
    }
}

impl DecisionRepo for DecisionLog {
    fn record_decision(
        &mut self,
        input: DecisionNoticeInput,
    ) -> Result<DecisionNoticeId, StorageError> {
        self.append_notice(input)
    }
}
