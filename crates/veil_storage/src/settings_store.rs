#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use veil_kernel_contracts::policy::{PolicyRecord, PrincipalId};
use veil_kernel_contracts::{ContractViolation, Validate};

#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    MissingRecord { table: &'static str, key: String },
    BackendUnavailable { table: &'static str, detail: String },
    ChainBroken { table: &'static str, at: u64 },
    ContractViolation(ContractViolation),
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

/// In-memory `policy_records` table plus the device-level boot flag.
/// Records are validated on the way in, so a fetch never has to re-check.
#[derive(Debug, Clone, Default)]
pub struct SettingsStore {
    records: BTreeMap<PrincipalId, PolicyRecord>,
    boot_completed: bool,
}

impl SettingsStore {
    pub fn new_in_memory() -> Self {
        Self {
            records: BTreeMap::new(),
            boot_completed: false,
        }
    }

    /// Total fetch: an absent principal resolves to the default-deny record
    /// instead of an error, so a brand-new principal is denied everything
    /// until someone writes a policy for it.
    pub fn policy_record_or_default(&self, principal: PrincipalId) -> PolicyRecord {
        match self.records.get(&principal) {
            Some(record) => record.clone(),
            None => PolicyRecord::default_deny(principal),
        }
    }

    /// Strict fetch for reconciliation flows that must distinguish "no
    /// record" from "denied".
    pub fn policy_record_strict(&self, principal: PrincipalId) -> Option<PolicyRecord> {
        self.records.get(&principal).cloned()
    }

    pub fn upsert_policy_record(&mut self, record: PolicyRecord) -> Result<(), StorageError> {
        record.validate()?;
        self.records.insert(record.principal, record);
        Ok(())
    }

    pub fn remove_policy_record(&mut self, principal: PrincipalId) -> bool {
        self.records.remove(&principal).is_some()
    }

    pub fn set_boot_completed(&mut self) {
        self.boot_completed = true;
    }

    pub fn boot_completed_flag(&self) -> bool {
        self.boot_completed
    }

    pub fn principals(&self) -> Vec<PrincipalId> {
        self.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_kernel_contracts::policy::{PolicyOutcome, PrivacyCategory};

    fn record(principal: u32, outcome: PolicyOutcome) -> PolicyRecord {
        let outcomes: BTreeMap<_, _> = PrivacyCategory::ALL
            .iter()
            .map(|category| (*category, outcome))
            .collect();
        PolicyRecord::v1(PrincipalId(principal), outcomes).unwrap()
    }

    #[test]
    fn at_settings_01_absent_principal_resolves_to_default_deny() {
        let store = SettingsStore::new_in_memory();
        let fetched = store.policy_record_or_default(PrincipalId(4242));
        assert_eq!(fetched.principal, PrincipalId(4242));
        for category in PrivacyCategory::ALL {
            assert_eq!(fetched.outcome_for(category), PolicyOutcome::Empty);
        }
        assert!(store.policy_record_strict(PrincipalId(4242)).is_none());
    }

    #[test]
    fn at_settings_02_upsert_replaces_and_keeps_iteration_sorted() {
        let mut store = SettingsStore::new_in_memory();
        store.upsert_policy_record(record(2000, PolicyOutcome::Empty)).unwrap();
        store.upsert_policy_record(record(1000, PolicyOutcome::Real)).unwrap();
        store.upsert_policy_record(record(2000, PolicyOutcome::Real)).unwrap();

        assert_eq!(store.principals(), vec![PrincipalId(1000), PrincipalId(2000)]);
        assert_eq!(
            store
                .policy_record_or_default(PrincipalId(2000))
                .outcome_for(PrivacyCategory::Sms),
            PolicyOutcome::Real
        );
    }

    #[test]
    fn at_settings_03_boot_flag_starts_clear_and_latches() {
        let mut store = SettingsStore::new_in_memory();
        assert!(!store.boot_completed_flag());
        store.set_boot_completed();
        assert!(store.boot_completed_flag());
        store.set_boot_completed();
        assert!(store.boot_completed_flag());
    }

    #[test]
    fn at_settings_04_invalid_record_is_rejected_before_insert() {
        let mut store = SettingsStore::new_in_memory();
        let mut bad = record(1000, PolicyOutcome::Real);
        bad.outcomes.remove(&PrivacyCategory::Mms);
        assert!(matches!(
            store.upsert_policy_record(bad),
            Err(StorageError::ContractViolation(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn at_settings_05_remove_is_deterministic() {
        let mut store = SettingsStore::new_in_memory();
        assert!(!store.remove_policy_record(PrincipalId(1000)));

        store.upsert_policy_record(record(1000, PolicyOutcome::Real)).unwrap();
        store.upsert_policy_record(record(2000, PolicyOutcome::Empty)).unwrap();
        assert!(store.remove_policy_record(PrincipalId(1000)));
        assert!(!store.remove_policy_record(PrincipalId(1000)));

        assert_eq!(store.principals(), vec![PrincipalId(2000)]);
        assert!(store.policy_record_strict(PrincipalId(1000)).is_none());
    }
}
