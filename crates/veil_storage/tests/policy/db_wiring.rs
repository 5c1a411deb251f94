#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use veil_kernel_contracts::notice::{
    CorrelationId, DecisionNoticeInput, NoticePayload, NoticeSeverity, PayloadKey, PayloadValue,
};
use veil_kernel_contracts::policy::{PolicyOutcome, PolicyRecord, PrincipalId, PrivacyCategory};
use veil_kernel_contracts::MonotonicTimeNs;
use veil_storage::decision_log::DecisionLog;
use veil_storage::repo::{DecisionRepo, PolicyRepo};
use veil_storage::settings_store::{SettingsStore, StorageError};

fn record_all(principal: u32, outcome: PolicyOutcome) -> PolicyRecord {
    let outcomes = PrivacyCategory::ALL
        .iter()
        .map(|category| (*category, outcome))
        .collect();
    PolicyRecord::v1(PrincipalId(principal), outcomes).unwrap()
}

fn notice_input(principal: u32, correlation: u128) -> DecisionNoticeInput {
    let payload = NoticePayload::v1(BTreeMap::from([(
        PayloadKey::new("sighting").unwrap(),
        PayloadValue::new("new").unwrap(),
    )]))
    .unwrap();
    DecisionNoticeInput::v1(
        CorrelationId(correlation),
        PrincipalId(principal),
        PrivacyCategory::Sms,
        PolicyOutcome::Empty,
        NoticeSeverity::Info,
        MonotonicTimeNs(50),
        None,
        payload,
    )
    .unwrap()
}

#[test]
fn at_policy_db_01_absent_principal_is_default_deny_through_the_trait() {
    let mut s = SettingsStore::new_in_memory();
    s.upsert_policy_record(record_all(1000, PolicyOutcome::Real))
        .unwrap();

    let seeded = s.policy_or_default(PrincipalId(1000)).unwrap();
    assert_eq!(seeded.outcome_for(PrivacyCategory::Sms), PolicyOutcome::Real);

    let absent = s.policy_or_default(PrincipalId(2000)).unwrap();
    assert_eq!(absent.principal, PrincipalId(2000));
    for category in PrivacyCategory::ALL {
        assert_eq!(absent.outcome_for(category), PolicyOutcome::Empty);
    }
    assert!(s.policy_strict(PrincipalId(2000)).unwrap().is_none());
}

#[test]
fn at_policy_db_02_identity_correction_round_trips() {
    let mut s = SettingsStore::new_in_memory();
    s.save_policy(record_all(1000, PolicyOutcome::Custom)).unwrap();

    let stored = s
        .policy_strict(PrincipalId(1000))
        .unwrap()
        .expect("seeded record should be present");
    let corrected = stored.with_principal(PrincipalId(1007)).unwrap();
    s.save_policy(corrected).unwrap();

    let refetched = s
        .policy_strict(PrincipalId(1007))
        .unwrap()
        .expect("corrected record should be present under the new id");
    assert_eq!(refetched.principal, PrincipalId(1007));
    assert_eq!(
        refetched.outcome_for(PrivacyCategory::Mms),
        PolicyOutcome::Custom
    );
    // The stale row stays behind; correction writes under the new key only.
    assert!(s.policy_strict(PrincipalId(1000)).unwrap().is_some());
}

#[test]
fn at_policy_db_03_boot_flag_latches_through_the_trait() {
    let mut s = SettingsStore::new_in_memory();
    assert!(!s.boot_completed().unwrap());
    s.mark_boot_completed().unwrap();
    assert!(s.boot_completed().unwrap());
    s.mark_boot_completed().unwrap();
    assert!(s.boot_completed().unwrap());
}

#[test]
fn at_policy_db_04_invalid_record_is_refused_by_save() {
    let mut s = SettingsStore::new_in_memory();
    let mut record = record_all(1000, PolicyOutcome::Real);
    record.outcomes.remove(&PrivacyCategory::BootCompleted);
    assert!(matches!(
        s.save_policy(record),
        Err(StorageError::ContractViolation(_))
    ));
    assert!(s.is_empty());
}

#[test]
fn at_policy_db_05_decision_log_appends_and_chain_verifies() {
    let mut log = DecisionLog::new_in_memory();
    let first = log.record_decision(notice_input(1000, 1)).unwrap();
    let second = log.record_decision(notice_input(2000, 2)).unwrap();
    assert_ne!(first, second);
    assert_eq!(log.len(), 2);
    assert!(log.verify_chain().is_ok());

    let for_first = log.notices_for_principal(PrincipalId(1000));
    assert_eq!(for_first.len(), 1);
    assert_eq!(for_first[0].correlation_id, CorrelationId(1));
}

#[test]
fn at_policy_db_06_digest_head_is_reproducible_for_identical_histories() {
    let mut a = DecisionLog::new_in_memory();
    let mut b = DecisionLog::new_in_memory();
    assert_eq!(a.digest_head(), b.digest_head());

    a.record_decision(notice_input(1000, 7)).unwrap();
    b.record_decision(notice_input(1000, 7)).unwrap();
    assert_eq!(a.digest_head(), b.digest_head());

    a.record_decision(notice_input(1000, 8)).unwrap();
    assert_ne!(a.digest_head(), b.digest_head());
}
