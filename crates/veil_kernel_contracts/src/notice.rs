#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::policy::{PolicyOutcome, PrincipalId, PrivacyCategory};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const NOTICE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Ties every notice from one logical broadcast event together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationId(pub u128);

impl Validate for CorrelationId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "correlation_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DecisionNoticeId(pub u64);

impl Validate for DecisionNoticeId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "decision_notice_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeSeverity {
    Info,
    Warn,
    Error,
}

impl NoticeSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            NoticeSeverity::Info => "info",
            NoticeSeverity::Warn => "warn",
            NoticeSeverity::Error => "error",
        }
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
pub struct PayloadKey(String);

impl PayloadKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ContractViolation> {
        let key = Self(key.into());
        key.validate()?;
        Ok(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PayloadKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "payload_key",
                reason: "must be <= 64 chars",
            });
        }
        if !is_ascii_lower_snake_key(&self.0) {
            return Err(ContractViolation::InvalidValue {
                field: "payload_key",
                reason: "must be lower_snake_case (a-z0-9_)",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadValue(String);

impl PayloadValue {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let value = Self(value.into());
        value.validate()?;
        Ok(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PayloadValue {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "payload_value",
                reason: "must not be empty",
            });
        }
        if self.0.len() > 256 {
            return Err(ContractViolation::InvalidValue {
                field: "payload_value",
                reason: "must be <= 256 chars",
            });
        }
        Ok(())
    }
}

/// Minimal structured payload attached to a notice. Small by contract: a
/// notice is an audit row, not a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticePayload {
    pub schema_version: SchemaVersion,
    pub entries: BTreeMap<PayloadKey, PayloadValue>,
}

impl NoticePayload {
    pub fn empty_v1() -> Self {
        Self {
            schema_version: NOTICE_CONTRACT_VERSION,
            entries: BTreeMap::new(),
        }
    }

    pub fn v1(entries: BTreeMap<PayloadKey, PayloadValue>) -> Result<Self, ContractViolation> {
        let payload = Self {
            schema_version: NOTICE_CONTRACT_VERSION,
            entries,
        };
        payload.validate()?;
        Ok(payload)
    }
}

impl Validate for NoticePayload {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != NOTICE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "notice_payload.schema_version",
                reason: "must match NOTICE_CONTRACT_VERSION",
            });
        }
        if self.entries.len() > 16 {
            return Err(ContractViolation::InvalidValue {
                field: "notice_payload.entries",
                reason: "must be <= 16 entries",
            });
        }
        let mut total_bytes: usize = 0;
        for (k, v) in &self.entries {
            k.validate()?;
            v.validate()?;
            total_bytes = total_bytes.saturating_add(k.as_str().len());
            total_bytes = total_bytes.saturating_add(v.as_str().len());
            if total_bytes > 2048 {
                return Err(ContractViolation::InvalidValue {
                    field: "notice_payload",
                    reason: "total payload size must be <= 2048 bytes",
                });
            }
        }
        Ok(())
    }
}

/// One policy decision as presented to the sink: who, what category, which
/// effective outcome. `detail` is reserved for richer policy surfaces; the
/// interception filter always passes `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionNoticeInput {
    pub schema_version: SchemaVersion,
    pub correlation_id: CorrelationId,
    pub principal: PrincipalId,
    pub category: PrivacyCategory,
    pub outcome: PolicyOutcome,
    pub severity: NoticeSeverity,
    pub emitted_at: MonotonicTimeNs,
    pub detail: Option<PayloadValue>,
    pub payload_min: NoticePayload,
}

impl DecisionNoticeInput {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        correlation_id: CorrelationId,
        principal: PrincipalId,
        category: PrivacyCategory,
        outcome: PolicyOutcome,
        severity: NoticeSeverity,
        emitted_at: MonotonicTimeNs,
        detail: Option<PayloadValue>,
        payload_min: NoticePayload,
    ) -> Result<Self, ContractViolation> {
        let input = Self {
            schema_version: NOTICE_CONTRACT_VERSION,
            correlation_id,
            principal,
            category,
            outcome,
            severity,
            emitted_at,
            detail,
            payload_min,
        };
        input.validate()?;
        Ok(input)
    }
}

impl Validate for DecisionNoticeInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != NOTICE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "decision_notice_input.schema_version",
                reason: "must match NOTICE_CONTRACT_VERSION",
            });
        }
        self.correlation_id.validate()?;
        if self.emitted_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "decision_notice_input.emitted_at",
                reason: "must be > 0",
            });
        }
        if let Some(detail) = &self.detail {
            detail.validate()?;
        }
        self.payload_min.validate()
    }
}

/// A stored notice row: the input plus its assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionNotice {
    pub notice_id: DecisionNoticeId,
    pub correlation_id: CorrelationId,
    pub principal: PrincipalId,
    pub category: PrivacyCategory,
    pub outcome: PolicyOutcome,
    pub severity: NoticeSeverity,
    pub emitted_at: MonotonicTimeNs,
    pub detail: Option<PayloadValue>,
    pub payload_min: NoticePayload,
}

impl DecisionNotice {
    pub fn from_input(
        notice_id: DecisionNoticeId,
        input: DecisionNoticeInput,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        let notice = Self {
            notice_id,
            correlation_id: input.correlation_id,
            principal: input.principal,
            category: input.category,
            outcome: input.outcome,
            severity: input.severity,
            emitted_at: input.emitted_at,
            detail: input.detail,
            payload_min: input.payload_min,
        };
        notice.validate()?;
        Ok(notice)
    }
}

impl Validate for DecisionNotice {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.notice_id.validate()?;
        self.correlation_id.validate()?;
        if self.emitted_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "decision_notice.emitted_at",
                reason: "must be > 0",
            });
        }
        if let Some(detail) = &self.detail {
            detail.validate()?;
        }
        self.payload_min.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> DecisionNoticeInput {
        DecisionNoticeInput::v1(
            CorrelationId(42),
            PrincipalId(1000),
            PrivacyCategory::Sms,
            PolicyOutcome::Empty,
            NoticeSeverity::Info,
            MonotonicTimeNs(5),
            None,
            NoticePayload::empty_v1(),
        )
        .unwrap()
    }

    #[test]
    fn at_notice_01_payload_key_shape_is_enforced() {
        assert!(PayloadKey::new("Sighting").is_err());
        assert!(PayloadKey::new("sighting-kind").is_err());
        assert!(PayloadKey::new("1sighting").is_err());
        assert!(PayloadKey::new("sighting").is_ok());
        assert!(PayloadKey::new("k1").is_ok());
    }

    #[test]
    fn at_notice_02_payload_entry_budget_is_enforced() {
        let mut entries = BTreeMap::new();
        for i in 0..17 {
            entries.insert(
                PayloadKey::new(format!("k{i}")).unwrap(),
                PayloadValue::new("v").unwrap(),
            );
        }
        assert!(NoticePayload::v1(entries).is_err());
    }

    #[test]
    fn at_notice_03_zero_ids_are_rejected() {
        assert!(CorrelationId(0).validate().is_err());
        assert!(DecisionNoticeId(0).validate().is_err());
        let mut bad = input();
        bad.emitted_at = MonotonicTimeNs(0);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn at_notice_04_notice_row_carries_input_fields() {
        let notice = DecisionNotice::from_input(DecisionNoticeId(1), input()).unwrap();
        assert_eq!(notice.principal, PrincipalId(1000));
        assert_eq!(notice.category, PrivacyCategory::Sms);
        assert_eq!(notice.outcome, PolicyOutcome::Empty);
        assert!(notice.validate().is_ok());
    }
}
