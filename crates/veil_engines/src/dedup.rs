#![forbid(unsafe_code)]

use std::cmp::min;
use std::collections::BTreeMap;

use veil_kernel_contracts::broadcast::{BroadcastInstance, EventFingerprint, ExpectedReceivers};
use veil_kernel_contracts::policy::PrivacyCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupConfig {
    pub max_expected_receivers: u32,
}

impl DedupConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_expected_receivers: 256,
        }
    }
}

#[derive(Debug, Clone)]
struct DedupEntry {
    fingerprint: EventFingerprint,
    original: BroadcastInstance,
    remaining: u32,
}

/// Whether a delivery is the first sighting of its event or a repeat. A
/// repeat carries a clone of the instance as it looked on first sighting,
/// taken before any mutation happened.
#[derive(Debug, Clone)]
pub enum Sighting {
    New,
    Seen { original: BroadcastInstance },
}

impl Sighting {
    pub fn is_new(&self) -> bool {
        matches!(self, Sighting::New)
    }
}

/// Per-category dedup cache. One live entry per category: a colliding new
/// fingerprint displaces whatever was armed, so an abandoned fan-out can
/// never wedge its category.
#[derive(Debug, Clone)]
pub struct DedupRuntime {
    config: DedupConfig,
    slots: BTreeMap<PrivacyCategory, DedupEntry>,
    package_added_seen: Option<EventFingerprint>,
}

impl DedupRuntime {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            slots: BTreeMap::new(),
            package_added_seen: None,
        }
    }

    /// `expected` arms the counter only when this call creates the entry; on
    /// a fingerprint match it is ignored and the armed counter stands.
    pub fn lookup_or_create(
        &mut self,
        category: PrivacyCategory,
        fingerprint: EventFingerprint,
        instance: &BroadcastInstance,
        expected: ExpectedReceivers,
    ) -> Sighting {
        if let Some(entry) = self.slots.get(&category) {
            if entry.fingerprint == fingerprint {
                return Sighting::Seen {
                    original: entry.original.clone(),
                };
            }
        }
        self.slots.insert(
            category,
            DedupEntry {
                fingerprint,
                original: instance.clone(),
                remaining: min(expected.get(), self.config.max_expected_receivers),
            },
        );
        Sighting::New
    }

    /// One release per delivery attempt, new or repeat. The last release
    /// evicts the entry. Releasing an empty slot is a no-op.
    pub fn release(&mut self, category: PrivacyCategory) {
        match self.slots.get_mut(&category) {
            Some(entry) if entry.remaining > 1 => {
                entry.remaining -= 1;
            }
            Some(_) => {
                self.slots.remove(&category);
            }
            None => {}
        }
    }

    pub fn remaining(&self, category: PrivacyCategory) -> Option<u32> {
        self.slots.get(&category).map(|entry| entry.remaining)
    }

    pub fn live_fingerprint(&self, category: PrivacyCategory) -> Option<EventFingerprint> {
        self.slots.get(&category).map(|entry| entry.fingerprint)
    }

    /// True exactly once per package-added fingerprint. The guard is
    /// recorded before reporting true, so a caller whose follow-up work
    /// fails does not get a second attempt for the same instance.
    pub fn package_event_is_new(&mut self, fingerprint: EventFingerprint) -> bool {
        if self.package_added_seen == Some(fingerprint) {
            return false;
        }
        self.package_added_seen = Some(fingerprint);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use veil_kernel_contracts::broadcast::{
        ActionTag, FieldKey, FieldValue, ACTION_OUTGOING_CALL, ACTION_SMS_RECEIVED,
    };
    use veil_kernel_contracts::MonotonicTimeNs;

    fn sms_instance(now: u64) -> (BroadcastInstance, EventFingerprint) {
        let mut fields = BTreeMap::new();
        fields.insert(
            FieldKey::pdus(),
            FieldValue::PduList(vec![vec![0x01, 0x02, 0x03]]),
        );
        let mut instance =
            BroadcastInstance::v1(ActionTag::new(ACTION_SMS_RECEIVED).unwrap(), fields).unwrap();
        let fingerprint = instance.fingerprint_or_stash(MonotonicTimeNs(now));
        (instance, fingerprint)
    }

    fn outgoing_call_instance(number: &str, now: u64) -> (BroadcastInstance, EventFingerprint) {
        let mut fields = BTreeMap::new();
        fields.insert(
            FieldKey::phone_number(),
            FieldValue::Text(number.to_string()),
        );
        let mut instance =
            BroadcastInstance::v1(ActionTag::new(ACTION_OUTGOING_CALL).unwrap(), fields).unwrap();
        let fingerprint = instance.fingerprint_or_stash(MonotonicTimeNs(now));
        (instance, fingerprint)
    }

    fn receivers(n: u32) -> ExpectedReceivers {
        ExpectedReceivers::new(n).unwrap()
    }

    #[test]
    fn at_dedup_01_counter_arms_on_first_sighting_and_drains_to_eviction() {
        let mut rt = DedupRuntime::new(DedupConfig::mvp_v1());
        let (instance, fp) = sms_instance(10);

        let first = rt.lookup_or_create(PrivacyCategory::Sms, fp, &instance, receivers(3));
        assert!(first.is_new());
        assert_eq!(rt.remaining(PrivacyCategory::Sms), Some(3));

        rt.release(PrivacyCategory::Sms);
        assert_eq!(rt.remaining(PrivacyCategory::Sms), Some(2));
        rt.release(PrivacyCategory::Sms);
        assert_eq!(rt.remaining(PrivacyCategory::Sms), Some(1));
        rt.release(PrivacyCategory::Sms);
        assert_eq!(rt.remaining(PrivacyCategory::Sms), None);
        assert_eq!(rt.live_fingerprint(PrivacyCategory::Sms), None);
    }

    #[test]
    fn at_dedup_02_expected_is_ignored_on_repeat_sighting() {
        let mut rt = DedupRuntime::new(DedupConfig::mvp_v1());
        let (instance, fp) = sms_instance(11);

        let _ = rt.lookup_or_create(PrivacyCategory::Sms, fp, &instance, receivers(3));
        let repeat = rt.lookup_or_create(PrivacyCategory::Sms, fp, &instance, receivers(100));
        assert!(!repeat.is_new());
        assert_eq!(rt.remaining(PrivacyCategory::Sms), Some(3));
    }

    #[test]
    fn at_dedup_03_new_fingerprint_displaces_the_live_entry() {
        let mut rt = DedupRuntime::new(DedupConfig::mvp_v1());
        let (instance_a, fp_a) = sms_instance(12);
        let (instance_b, fp_b) = sms_instance(13);
        assert_ne!(fp_a, fp_b);

        let _ = rt.lookup_or_create(PrivacyCategory::Sms, fp_a, &instance_a, receivers(5));
        rt.release(PrivacyCategory::Sms);
        assert_eq!(rt.remaining(PrivacyCategory::Sms), Some(4));

        let displaced = rt.lookup_or_create(PrivacyCategory::Sms, fp_b, &instance_b, receivers(2));
        assert!(displaced.is_new());
        assert_eq!(rt.live_fingerprint(PrivacyCategory::Sms), Some(fp_b));
        assert_eq!(rt.remaining(PrivacyCategory::Sms), Some(2));

        // The displaced event is gone; seeing it again counts as new.
        let back = rt.lookup_or_create(PrivacyCategory::Sms, fp_a, &instance_a, receivers(5));
        assert!(back.is_new());
    }

    #[test]
    fn at_dedup_04_release_of_an_empty_slot_is_a_no_op() {
        let mut rt = DedupRuntime::new(DedupConfig::mvp_v1());
        rt.release(PrivacyCategory::Mms);
        assert_eq!(rt.remaining(PrivacyCategory::Mms), None);
    }

    #[test]
    fn at_dedup_05_fanout_is_clamped_to_the_configured_bound() {
        let mut rt = DedupRuntime::new(DedupConfig::mvp_v1());
        let (instance, fp) = sms_instance(14);

        let _ = rt.lookup_or_create(PrivacyCategory::Sms, fp, &instance, receivers(4096));
        assert_eq!(rt.remaining(PrivacyCategory::Sms), Some(256));
    }

    #[test]
    fn at_dedup_06_package_guard_reports_true_exactly_once_per_fingerprint() {
        let mut rt = DedupRuntime::new(DedupConfig::mvp_v1());
        let fp_a = EventFingerprint(71);
        let fp_b = EventFingerprint(72);

        assert!(rt.package_event_is_new(fp_a));
        assert!(!rt.package_event_is_new(fp_a));
        assert!(rt.package_event_is_new(fp_b));
        assert!(!rt.package_event_is_new(fp_b));
        // The slot holds the latest fingerprint only.
        assert!(rt.package_event_is_new(fp_a));
    }

    #[test]
    fn at_dedup_07_categories_hold_independent_slots() {
        let mut rt = DedupRuntime::new(DedupConfig::mvp_v1());
        let (sms, fp_sms) = sms_instance(15);
        let (call, fp_call) = outgoing_call_instance("+15551234", 16);

        let _ = rt.lookup_or_create(PrivacyCategory::Sms, fp_sms, &sms, receivers(2));
        let _ = rt.lookup_or_create(PrivacyCategory::OutgoingCall, fp_call, &call, receivers(4));

        assert_eq!(rt.remaining(PrivacyCategory::Sms), Some(2));
        assert_eq!(rt.remaining(PrivacyCategory::OutgoingCall), Some(4));

        rt.release(PrivacyCategory::Sms);
        assert_eq!(rt.remaining(PrivacyCategory::Sms), Some(1));
        assert_eq!(rt.remaining(PrivacyCategory::OutgoingCall), Some(4));
    }

    #[test]
    fn at_dedup_08_repeat_sighting_returns_the_saved_clone_not_the_current_instance() {
        let mut rt = DedupRuntime::new(DedupConfig::mvp_v1());
        let (call, fp) = outgoing_call_instance("+15551234", 17);

        let _ = rt.lookup_or_create(PrivacyCategory::OutgoingCall, fp, &call, receivers(3));

        // A later delivery arrives already scrubbed by someone upstream.
        let mut scrubbed = call.clone();
        scrubbed.set_field(FieldKey::phone_number(), FieldValue::Text(String::new()));

        match rt.lookup_or_create(PrivacyCategory::OutgoingCall, fp, &scrubbed, receivers(3)) {
            Sighting::Seen { original } => {
                match original.field(&FieldKey::phone_number()) {
                    Some(FieldValue::Text(number)) => assert_eq!(number, "+15551234"),
                    other => panic!("expected saved phone_number text, got {other:?}"),
                }
            }
            Sighting::New => panic!("expected repeat sighting for matching fingerprint"),
        }
    }
}
