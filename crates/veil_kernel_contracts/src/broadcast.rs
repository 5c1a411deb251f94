#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::policy::{PrincipalId, PrivacyCategory};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const BROADCAST_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const ACTION_OUTGOING_CALL: &str = "veil.call.outgoing";
pub const ACTION_INCOMING_CALL: &str = "veil.call.incoming";
pub const ACTION_SMS_RECEIVED: &str = "veil.sms.received";
pub const ACTION_MMS_RECEIVED: &str = "veil.mms.received";
pub const ACTION_BOOT_COMPLETED: &str = "veil.boot.completed";
/// Marker a non-Real boot broadcast is rewritten to. Receivers subscribed
/// to `ACTION_BOOT_COMPLETED` never match it, which is the whole point.
pub const ACTION_BOOT_COMPLETED_INERT: &str = "veil.boot.completed.inert";
pub const ACTION_PACKAGE_ADDED: &str = "veil.package.added";

/// Placeholder a redacted number field is set to.
pub const EMPTY_NUMBER: &str = "";

/// One canonical well-formed-but-empty PDU segment. Redaction replaces the
/// whole PDU list with a single segment holding exactly these bytes.
pub const EMPTY_PDU: [u8; 16] = [
    0x00, 0x20, 0x01, 0x81, 0xF0, 0x00, 0x00, 0x11, 0x90, 0x01, 0x30, 0x22, 0x22, 0x80, 0x01,
    0x20,
];

pub fn empty_pdu_list() -> Vec<Vec<u8>> {
    vec![EMPTY_PDU.to_vec()]
}

const MAX_FIELDS: usize = 16;
const MAX_TEXT_FIELD_BYTES: usize = 256;
const MAX_PDU_SEGMENTS: usize = 16;
const MAX_PDU_SEGMENT_BYTES: usize = 512;
const MAX_EXPECTED_RECEIVERS: u32 = 4096;

fn validate_token(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    if !value.is_ascii() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be ASCII",
        });
    }
    Ok(())
}

/// What kind of handling an action tag selects. Replaces the original's
/// string-comparison chain with a closed classification; anything the
/// filter does not govern is `Unmatched` and passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastClass {
    Policy(PrivacyCategory),
    PackageAdded,
    Unmatched,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionTag(String);

impl ActionTag {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(v.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn known(raw: &'static str) -> Self {
        Self(raw.to_string())
    }

    pub fn boot_completed() -> Self {
        Self::known(ACTION_BOOT_COMPLETED)
    }

    pub fn boot_completed_inert() -> Self {
        Self::known(ACTION_BOOT_COMPLETED_INERT)
    }

    /// The inert marker classifies as BootCompleted so repeat deliveries of
    /// an already-rewritten boot instance stay in the boot flow (a later
    /// Real decision can rearm the tag).
    pub fn classify(&self) -> BroadcastClass {
        match self.0.as_str() {
            ACTION_OUTGOING_CALL => BroadcastClass::Policy(PrivacyCategory::OutgoingCall),
            ACTION_INCOMING_CALL => BroadcastClass::Policy(PrivacyCategory::IncomingCall),
            ACTION_SMS_RECEIVED => BroadcastClass::Policy(PrivacyCategory::Sms),
            ACTION_MMS_RECEIVED => BroadcastClass::Policy(PrivacyCategory::Mms),
            ACTION_BOOT_COMPLETED | ACTION_BOOT_COMPLETED_INERT => {
                BroadcastClass::Policy(PrivacyCategory::BootCompleted)
            }
            ACTION_PACKAGE_ADDED => BroadcastClass::PackageAdded,
            _ => BroadcastClass::Unmatched,
        }
    }
}

impl Validate for ActionTag {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("action_tag", &self.0, 128)?;
        if self.0.contains(char::is_whitespace) {
            return Err(ContractViolation::InvalidValue {
                field: "action_tag",
                reason: "must not contain whitespace",
            });
        }
        Ok(())
    }
}

fn is_ascii_lower_snake_key(s: &str) -> bool {
    let b = s.as_bytes();
    if b.is_empty() {
        return false;
    }
    if !b[0].is_ascii_lowercase() {
        return false;
    }
    for &c in b.iter().skip(1) {
        if !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'_') {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldKey(String);

impl FieldKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ContractViolation> {
        let key = Self(key.into());
        key.validate()?;
        Ok(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn known(raw: &'static str) -> Self {
        Self(raw.to_string())
    }

    pub fn phone_number() -> Self {
        Self::known("phone_number")
    }

    pub fn incoming_number() -> Self {
        Self::known("incoming_number")
    }

    pub fn pdus() -> Self {
        Self::known("pdus")
    }

    pub fn principal_id() -> Self {
        Self::known("principal_id")
    }

    pub fn for_category(category: PrivacyCategory) -> Option<Self> {
        category.sensitive_field_name().map(Self::known)
    }
}

impl Validate for FieldKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "field_key",
                reason: "must be <= 64 chars",
            });
        }
        if !is_ascii_lower_snake_key(&self.0) {
            return Err(ContractViolation::InvalidValue {
                field: "field_key",
                reason: "must be lower_snake_case (a-z0-9_)",
            });
        }
        Ok(())
    }
}

/// Values a broadcast field can carry. Text may be empty: the redaction
/// placeholder for number fields is the empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    PduList(Vec<Vec<u8>>),
    Principal(PrincipalId),
}

impl Validate for FieldValue {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            FieldValue::Text(v) => {
                if v.len() > MAX_TEXT_FIELD_BYTES {
                    return Err(ContractViolation::InvalidValue {
                        field: "field_value.text",
                        reason: "must be <= 256 bytes",
                    });
                }
                Ok(())
            }
            FieldValue::PduList(segments) => {
                if segments.is_empty() {
                    return Err(ContractViolation::InvalidValue {
                        field: "field_value.pdu_list",
                        reason: "must hold at least one segment",
                    });
                }
                if segments.len() > MAX_PDU_SEGMENTS {
                    return Err(ContractViolation::InvalidValue {
                        field: "field_value.pdu_list",
                        reason: "must be <= 16 segments",
                    });
                }
                for segment in segments {
                    if segment.is_empty() {
                        return Err(ContractViolation::InvalidValue {
                            field: "field_value.pdu_list",
                            reason: "segments must not be empty",
                        });
                    }
                    if segment.len() > MAX_PDU_SEGMENT_BYTES {
                        return Err(ContractViolation::InvalidValue {
                            field: "field_value.pdu_list",
                            reason: "segments must be <= 512 bytes",
                        });
                    }
                }
                Ok(())
            }
            FieldValue::Principal(_) => Ok(()),
        }
    }
}

/// Identifies one logical broadcast event across its deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventFingerprint(pub u64);

/// Fan-out count for one logical event, supplied by the dispatcher up
/// front. The dedup counter starts from it on first sighting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpectedReceivers(u32);

impl ExpectedReceivers {
    pub fn new(v: u32) -> Result<Self, ContractViolation> {
        if v == 0 || v > MAX_EXPECTED_RECEIVERS {
            return Err(ContractViolation::InvalidRange {
                field: "expected_receivers",
                min: 1.0,
                max: MAX_EXPECTED_RECEIVERS as f64,
                got: v as f64,
            });
        }
        Ok(Self(v))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

/// The mutable unit being filtered. Exclusively owned by the dispatcher
/// for the duration of one delivery attempt; the filter mutates it in
/// place. The fingerprint slot starts empty and is stashed on first
/// derivation so clones handed to later receivers carry the same identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastInstance {
    pub schema_version: SchemaVersion,
    pub action: ActionTag,
    pub fields: BTreeMap<FieldKey, FieldValue>,
    pub fingerprint: Option<EventFingerprint>,
}

impl BroadcastInstance {
    pub fn v1(
        action: ActionTag,
        fields: BTreeMap<FieldKey, FieldValue>,
    ) -> Result<Self, ContractViolation> {
        let instance = Self {
            schema_version: BROADCAST_CONTRACT_VERSION,
            action,
            fields,
            fingerprint: None,
        };
        instance.validate()?;
        Ok(instance)
    }

    pub fn field(&self, key: &FieldKey) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn set_field(&mut self, key: FieldKey, value: FieldValue) {
        self.fields.insert(key, value);
    }

    pub fn set_action(&mut self, action: ActionTag) {
        self.action = action;
    }

    pub fn text_field(&self, key: &FieldKey) -> Option<&str> {
        match self.fields.get(key) {
            Some(FieldValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn pdu_field(&self) -> Option<&[Vec<u8>]> {
        match self.fields.get(&FieldKey::pdus()) {
            Some(FieldValue::PduList(segments)) => Some(segments.as_slice()),
            _ => None,
        }
    }

    pub fn principal_field(&self) -> Option<PrincipalId> {
        match self.fields.get(&FieldKey::principal_id()) {
            Some(FieldValue::Principal(principal)) => Some(*principal),
            _ => None,
        }
    }

    /// Returns the stashed fingerprint, deriving and stashing it first if
    /// absent: FNV-1a 64 over the action tag and every field, plus the
    /// dispatcher's monotonic reading. Content alone is not enough; two
    /// distinct logical events may carry identical content.
    pub fn fingerprint_or_stash(&mut self, now: MonotonicTimeNs) -> EventFingerprint {
        if let Some(fingerprint) = self.fingerprint {
            return fingerprint;
        }
        let fingerprint = EventFingerprint(self.content_hash().wrapping_add(now.0));
        self.fingerprint = Some(fingerprint);
        fingerprint
    }

    fn content_hash(&self) -> u64 {
        let mut hash = fnv1a64_init();
        hash = fnv1a64_update(hash, self.action.as_str().as_bytes());
        for (key, value) in &self.fields {
            hash = fnv1a64_update(hash, key.as_str().as_bytes());
            match value {
                FieldValue::Text(v) => {
                    hash = fnv1a64_update(hash, &[0x01]);
                    hash = fnv1a64_update(hash, v.as_bytes());
                }
                FieldValue::PduList(segments) => {
                    hash = fnv1a64_update(hash, &[0x02]);
                    for segment in segments {
                        hash = fnv1a64_update(hash, &(segment.len() as u32).to_le_bytes());
                        hash = fnv1a64_update(hash, segment);
                    }
                }
                FieldValue::Principal(principal) => {
                    hash = fnv1a64_update(hash, &[0x03]);
                    hash = fnv1a64_update(hash, &principal.0.to_le_bytes());
                }
            }
        }
        hash
    }
}

impl Validate for BroadcastInstance {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != BROADCAST_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "broadcast_instance.schema_version",
                reason: "must match BROADCAST_CONTRACT_VERSION",
            });
        }
        self.action.validate()?;
        if self.fields.len() > MAX_FIELDS {
            return Err(ContractViolation::InvalidValue {
                field: "broadcast_instance.fields",
                reason: "must be <= 16 fields",
            });
        }
        for (key, value) in &self.fields {
            key.validate()?;
            value.validate()?;
        }
        Ok(())
    }
}

const FNV1A64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV1A64_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a64_init() -> u64 {
    FNV1A64_OFFSET
}

fn fnv1a64_update(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV1A64_PRIME);
    }
    hash
}
