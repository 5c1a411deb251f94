#![forbid(unsafe_code)]

use veil_kernel_contracts::broadcast::{
    empty_pdu_list, ActionTag, BroadcastInstance, FieldKey, FieldValue, EMPTY_NUMBER,
};
use veil_kernel_contracts::policy::{PolicyOutcome, PrivacyCategory};
use veil_kernel_contracts::ContractViolation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptConfig {
    pub overwrite_mistyped_fields: bool,
}

impl InterceptConfig {
    pub fn mvp_v1() -> Self {
        Self {
            overwrite_mistyped_fields: false,
        }
    }
}

/// Shape of the sensitive field as found on a live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldState {
    Usable,
    Missing,
    Mistyped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptDecision {
    Redact,
    RestoreOriginal,
    LeaveUntouched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedMutation {
    Redacted,
    Restored,
    Untouched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMutation {
    Rearmed,
    Inerted,
}

#[derive(Debug, Clone)]
pub struct InterceptRuntime {
    config: InterceptConfig,
}

impl InterceptRuntime {
    pub fn new(config: InterceptConfig) -> Self {
        Self { config }
    }

    pub fn sensitive_field_state(
        &self,
        category: PrivacyCategory,
        instance: &BroadcastInstance,
    ) -> FieldState {
        let Some(key) = FieldKey::for_category(category) else {
            return FieldState::Missing;
        };
        match instance.field(&key) {
            None => FieldState::Missing,
            Some(FieldValue::PduList(_)) if category.expects_pdus() => FieldState::Usable,
            Some(FieldValue::Text(_)) if !category.expects_pdus() => FieldState::Usable,
            Some(_) => FieldState::Mistyped,
        }
    }

    /// The malformed-instance gate, applied before any cache or store work.
    /// A mistyped field only counts as workable when the owner opted into
    /// overwriting it.
    pub fn has_redactable_field(
        &self,
        category: PrivacyCategory,
        instance: &BroadcastInstance,
    ) -> bool {
        match self.sensitive_field_state(category, instance) {
            FieldState::Usable => true,
            FieldState::Missing => false,
            FieldState::Mistyped => self.config.overwrite_mistyped_fields,
        }
    }

    /// Anything short of Real redacts. Real leaves a first sighting alone
    /// and restores a repeat from the saved original, because an earlier
    /// receiver of the same event may have been served a redacted view of
    /// the shared instance.
    pub fn decide(&self, outcome: PolicyOutcome, sighting_is_new: bool) -> InterceptDecision {
        if !outcome.grants_real() {
            return InterceptDecision::Redact;
        }
        if sighting_is_new {
            InterceptDecision::LeaveUntouched
        } else {
            InterceptDecision::RestoreOriginal
        }
    }

    pub fn apply(
        &self,
        decision: InterceptDecision,
        category: PrivacyCategory,
        instance: &mut BroadcastInstance,
        original: Option<&BroadcastInstance>,
    ) -> Result<AppliedMutation, ContractViolation> {
        let Some(key) = FieldKey::for_category(category) else {
            return Err(ContractViolation::InvalidValue {
                field: "intercept.category",
                reason: "category has no sensitive field to mutate",
            });
        };
        match decision {
            InterceptDecision::Redact => {
                let placeholder = if category.expects_pdus() {
                    FieldValue::PduList(empty_pdu_list())
                } else {
                    FieldValue::Text(EMPTY_NUMBER.to_string())
                };
                instance.set_field(key, placeholder);
                Ok(AppliedMutation::Redacted)
            }
            InterceptDecision::RestoreOriginal => {
                let Some(original) = original else {
                    return Err(ContractViolation::InvalidValue {
                        field: "intercept.original",
                        reason: "restore requires the saved original",
                    });
                };
                let Some(value) = original.field(&key) else {
                    return Err(ContractViolation::InvalidValue {
                        field: "intercept.original",
                        reason: "saved original is missing the sensitive field",
                    });
                };
                instance.set_field(key, value.clone());
                Ok(AppliedMutation::Restored)
            }
            InterceptDecision::LeaveUntouched => Ok(AppliedMutation::Untouched),
        }
    }

    /// Boot-completed handling rewrites the action tag instead of a field:
    /// Real arms the live tag, anything else parks the instance on the
    /// inert marker. Idempotent in both directions.
    pub fn rearm_boot(
        &self,
        outcome: PolicyOutcome,
        instance: &mut BroadcastInstance,
    ) -> BootMutation {
        if outcome.grants_real() {
            instance.set_action(ActionTag::boot_completed());
            BootMutation::Rearmed
        } else {
            instance.set_action(ActionTag::boot_completed_inert());
            BootMutation::Inerted
        }
    }
}
