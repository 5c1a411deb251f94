#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, SchemaVersion, Validate};

pub const POLICY_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Identity a policy record applies to. Stable within one boot session;
/// may be corrected after a package-added event (see `with_principal`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PrincipalId(pub u32);

/// The broadcast kinds the filter governs. Closed set: adding a category
/// means teaching the filter its field schema, so exhaustive matches are
/// deliberate everywhere this enum appears.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PrivacyCategory {
    OutgoingCall,
    IncomingCall,
    Sms,
    Mms,
    BootCompleted,
}

impl PrivacyCategory {
    pub const ALL: [PrivacyCategory; 5] = [
        PrivacyCategory::OutgoingCall,
        PrivacyCategory::IncomingCall,
        PrivacyCategory::Sms,
        PrivacyCategory::Mms,
        PrivacyCategory::BootCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PrivacyCategory::OutgoingCall => "outgoing_call",
            PrivacyCategory::IncomingCall => "incoming_call",
            PrivacyCategory::Sms => "sms",
            PrivacyCategory::Mms => "mms",
            PrivacyCategory::BootCompleted => "boot_completed",
        }
    }

    /// Name of the field the filter redacts for this category. BootCompleted
    /// carries no sensitive field; it is handled by action-tag rewrite.
    pub fn sensitive_field_name(self) -> Option<&'static str> {
        match self {
            PrivacyCategory::OutgoingCall => Some("phone_number"),
            PrivacyCategory::IncomingCall => Some("incoming_number"),
            PrivacyCategory::Sms | PrivacyCategory::Mms => Some("pdus"),
            PrivacyCategory::BootCompleted => None,
        }
    }

    pub fn expects_pdus(self) -> bool {
        matches!(self, PrivacyCategory::Sms | PrivacyCategory::Mms)
    }
}

/// Per-category policy decision. The filter collapses every non-`Real`
/// outcome to the same fixed placeholder; `Custom` and `Random` are kept
/// so records written by richer policy surfaces round-trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyOutcome {
    Real,
    Empty,
    Custom,
    Random,
}

impl PolicyOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyOutcome::Real => "real",
            PolicyOutcome::Empty => "empty",
            PolicyOutcome::Custom => "custom",
            PolicyOutcome::Random => "random",
        }
    }

    pub fn grants_real(self) -> bool {
        matches!(self, PolicyOutcome::Real)
    }
}

/// One principal's policy: exactly one outcome per category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub schema_version: SchemaVersion,
    pub principal: PrincipalId,
    pub outcomes: BTreeMap<PrivacyCategory, PolicyOutcome>,
}

impl PolicyRecord {
    pub fn v1(
        principal: PrincipalId,
        outcomes: BTreeMap<PrivacyCategory, PolicyOutcome>,
    ) -> Result<Self, ContractViolation> {
        let record = Self {
            schema_version: POLICY_CONTRACT_VERSION,
            principal,
            outcomes,
        };
        record.validate()?;
        Ok(record)
    }

    /// The record an absent principal resolves to: every category denied.
    pub fn default_deny(principal: PrincipalId) -> Self {
        let outcomes = PrivacyCategory::ALL
            .iter()
            .map(|category| (*category, PolicyOutcome::Empty))
            .collect();
        Self {
            schema_version: POLICY_CONTRACT_VERSION,
            principal,
            outcomes,
        }
    }

    /// Total by construction: `v1` refuses records missing a category and
    /// `default_deny` covers all of them.
    pub fn outcome_for(&self, category: PrivacyCategory) -> PolicyOutcome {
        self.outcomes
            .get(&category)
            .copied()
            .unwrap_or(PolicyOutcome::Empty)
    }

    /// Identity-corrected copy, used when a package-added event shows the
    /// stored record carries a stale principal id.
    pub fn with_principal(&self, principal: PrincipalId) -> Result<Self, ContractViolation> {
        let record = Self {
            schema_version: self.schema_version,
            principal,
            outcomes: self.outcomes.clone(),
        };
        record.validate()?;
        Ok(record)
    }
}

impl Validate for PolicyRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != POLICY_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "policy_record.schema_version",
                reason: "must match POLICY_CONTRACT_VERSION",
            });
        }
        for category in PrivacyCategory::ALL {
            if !self.outcomes.contains_key(&category) {
                return Err(ContractViolation::InvalidValue {
                    field: "policy_record.outcomes",
                    reason: "must hold exactly one outcome per category",
                });
            }
        }
        if self.outcomes.len() != PrivacyCategory::ALL.len() {
            return Err(ContractViolation::InvalidValue {
                field: "policy_record.outcomes",
                reason: "must not hold outcomes for unknown categories",
            });
        }
        Ok(())
    }
}

/// What a failed policy fetch means for the delivery being filtered.
/// Required at wiring construction with no default: fail-open and
/// fail-closed have opposite privacy implications, so the system owner
/// has to pick one explicitly. Neither posture aborts a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupFailurePosture {
    /// Treat the principal as if its outcome were `Real` for this category.
    FailOpen,
    /// Treat the principal as default-deny for this category.
    FailClosed,
}

impl LookupFailurePosture {
    pub fn as_str(self) -> &'static str {
        match self {
            LookupFailurePosture::FailOpen => "fail_open",
            LookupFailurePosture::FailClosed => "fail_closed",
        }
    }

    pub fn effective_outcome(self) -> PolicyOutcome {
        match self {
            LookupFailurePosture::FailOpen => PolicyOutcome::Real,
            LookupFailurePosture::FailClosed => PolicyOutcome::Empty,
        }
    }
}
