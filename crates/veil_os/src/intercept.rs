#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use veil_engines::dedup::{DedupRuntime, Sighting};
use veil_engines::intercept::{AppliedMutation, BootMutation, InterceptRuntime};
use veil_kernel_contracts::broadcast::{BroadcastClass, BroadcastInstance, ExpectedReceivers};
use veil_kernel_contracts::notice::{
    CorrelationId, DecisionNoticeInput, NoticePayload, NoticeSeverity, PayloadKey, PayloadValue,
};
use veil_kernel_contracts::policy::{
    LookupFailurePosture, PolicyOutcome, PrincipalId, PrivacyCategory,
};
use veil_kernel_contracts::{
    ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate,
};
use veil_storage::repo::{DecisionRepo, PolicyRepo};

pub const INTERCEPT_WIRING_VERSION: SchemaVersion = SchemaVersion(1);

pub mod reason_codes {
    use veil_kernel_contracts::ReasonCodeId;

    // Interception filter OS wiring reason-code namespace. Values are placeholders until registry lock.
    pub const FILTER_OK_DELIVERY: ReasonCodeId = ReasonCodeId(0x4649_0001);
    pub const FILTER_OK_PASSTHROUGH: ReasonCodeId = ReasonCodeId(0x4649_0002);
    pub const FILTER_OK_BOOT: ReasonCodeId = ReasonCodeId(0x4649_0003);
    pub const FILTER_OK_PACKAGE: ReasonCodeId = ReasonCodeId(0x4649_0004);
    pub const FILTER_POLICY_LOOKUP_FAILED: ReasonCodeId = ReasonCodeId(0x4649_0101);
    pub const FILTER_INPUT_SCHEMA_INVALID: ReasonCodeId = ReasonCodeId(0x4649_0102);
    pub const FILTER_INTERNAL_PIPELINE_ERROR: ReasonCodeId = ReasonCodeId(0x4649_01F1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptWiringConfig {
    pub filter_enabled: bool,
    pub lookup_failure_posture: LookupFailurePosture,
}

impl InterceptWiringConfig {
    /// The posture carries no default. Fail-open and fail-closed have
    /// opposite privacy implications, so the owner picks one here.
    pub fn mvp_v1(filter_enabled: bool, lookup_failure_posture: LookupFailurePosture) -> Self {
        Self {
            filter_enabled,
            lookup_failure_posture,
        }
    }
}

/// One delivery attempt as seen from the dispatcher: who is receiving,
/// how many receivers the event fans out to, and the monotonic reading
/// used if the instance still needs its fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub schema_version: SchemaVersion,
    pub correlation_id: CorrelationId,
    pub principal: PrincipalId,
    pub expected_receivers: ExpectedReceivers,
    pub now: MonotonicTimeNs,
}

impl DeliveryRequest {
    pub fn v1(
        correlation_id: CorrelationId,
        principal: PrincipalId,
        expected_receivers: ExpectedReceivers,
        now: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let req = Self {
            schema_version: INTERCEPT_WIRING_VERSION,
            correlation_id,
            principal,
            expected_receivers,
            now,
        };
        req.validate()?;
        Ok(req)
    }
}

impl Validate for DeliveryRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != INTERCEPT_WIRING_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "delivery_request.schema_version",
                reason: "must match INTERCEPT_WIRING_VERSION",
            });
        }
        self.correlation_id.validate()?;
        if self.now.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "delivery_request.now",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Everything one delivery can have done to its instance or the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedOutcome {
    LeftReal,
    RestoredOriginal,
    Redacted,
    NothingToRedact,
    BootRearmed,
    BootSuppressed,
    PrincipalCorrected,
    PrincipalConsistent,
    NoPolicyRecord,
    PackageAlreadyHandled,
    ReconcileFailed,
    Unmatched,
}

impl AppliedOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AppliedOutcome::LeftReal => "left_real",
            AppliedOutcome::RestoredOriginal => "restored_original",
            AppliedOutcome::Redacted => "redacted",
            AppliedOutcome::NothingToRedact => "nothing_to_redact",
            AppliedOutcome::BootRearmed => "boot_rearmed",
            AppliedOutcome::BootSuppressed => "boot_suppressed",
            AppliedOutcome::PrincipalCorrected => "principal_corrected",
            AppliedOutcome::PrincipalConsistent => "principal_consistent",
            AppliedOutcome::NoPolicyRecord => "no_policy_record",
            AppliedOutcome::PackageAlreadyHandled => "package_already_handled",
            AppliedOutcome::ReconcileFailed => "reconcile_failed",
            AppliedOutcome::Unmatched => "unmatched",
        }
    }

    fn is_redaction_delivery(self) -> bool {
        matches!(
            self,
            AppliedOutcome::LeftReal | AppliedOutcome::RestoredOriginal | AppliedOutcome::Redacted
        )
    }
}

/// What the dispatcher gets back from a completed delivery. Cross-field
/// shape is enforced: only redaction deliveries may carry a notice flag or
/// a counter, only boot outcomes may claim the boot category, and
/// unmatched or package traffic carries no category at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub schema_version: SchemaVersion,
    pub category: Option<PrivacyCategory>,
    pub applied: AppliedOutcome,
    pub notice_recorded: bool,
    pub remaining_after: Option<u32>,
    pub reason_code: ReasonCodeId,
}

impl DeliveryReport {
    pub fn v1(
        category: Option<PrivacyCategory>,
        applied: AppliedOutcome,
        notice_recorded: bool,
        remaining_after: Option<u32>,
        reason_code: ReasonCodeId,
    ) -> Result<Self, ContractViolation> {
        let report = Self {
            schema_version: INTERCEPT_WIRING_VERSION,
            category,
            applied,
            notice_recorded,
            remaining_after,
            reason_code,
        };
        report.validate()?;
        Ok(report)
    }
}

impl Validate for DeliveryReport {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != INTERCEPT_WIRING_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "delivery_report.schema_version",
                reason: "must match INTERCEPT_WIRING_VERSION",
            });
        }
        if self.reason_code.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "delivery_report.reason_code",
                reason: "must be a registered reason code",
            });
        }
        match self.applied {
            AppliedOutcome::LeftReal
            | AppliedOutcome::RestoredOriginal
            | AppliedOutcome::Redacted => match self.category {
                Some(category) if category.sensitive_field_name().is_some() => {}
                _ => {
                    return Err(ContractViolation::InvalidValue {
                        field: "delivery_report.category",
                        reason: "redaction outcomes require a redactable category",
                    });
                }
            },
            AppliedOutcome::BootRearmed | AppliedOutcome::BootSuppressed => {
                if self.category != Some(PrivacyCategory::BootCompleted) {
                    return Err(ContractViolation::InvalidValue {
                        field: "delivery_report.category",
                        reason: "boot outcomes require the boot_completed category",
                    });
                }
            }
            AppliedOutcome::NothingToRedact => {
                if self.category == Some(PrivacyCategory::BootCompleted) {
                    return Err(ContractViolation::InvalidValue {
                        field: "delivery_report.category",
                        reason: "boot_completed never reports nothing_to_redact",
                    });
                }
            }
            AppliedOutcome::PrincipalCorrected
            | AppliedOutcome::PrincipalConsistent
            | AppliedOutcome::NoPolicyRecord
            | AppliedOutcome::PackageAlreadyHandled
            | AppliedOutcome::ReconcileFailed
            | AppliedOutcome::Unmatched => {
                if self.category.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "delivery_report.category",
                        reason: "must be absent for non-policy outcomes",
                    });
                }
            }
        }
        if self.notice_recorded && !self.applied.is_redaction_delivery() {
            return Err(ContractViolation::InvalidValue {
                field: "delivery_report.notice_recorded",
                reason: "only redaction deliveries emit notices",
            });
        }
        if self.remaining_after.is_some() && !self.applied.is_redaction_delivery() {
            return Err(ContractViolation::InvalidValue {
                field: "delivery_report.remaining_after",
                reason: "only redaction deliveries drain a counter",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptRefuse {
    pub reason_code: ReasonCodeId,
    pub message: String,
}

impl InterceptRefuse {
    pub fn v1(reason_code: ReasonCodeId, message: String) -> Result<Self, ContractViolation> {
        let refuse = Self {
            reason_code,
            message,
        };
        refuse.validate()?;
        Ok(refuse)
    }
}

impl Validate for InterceptRefuse {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.reason_code.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "intercept_refuse.reason_code",
                reason: "must be a registered reason code",
            });
        }
        if self.message.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "intercept_refuse.message",
                reason: "must not be empty",
            });
        }
        if self.message.len() > 192 {
            return Err(ContractViolation::InvalidValue {
                field: "intercept_refuse.message",
                reason: "must be <= 192 chars",
            });
        }
        if !self.message.is_ascii() {
            return Err(ContractViolation::InvalidValue {
                field: "intercept_refuse.message",
                reason: "must be ASCII",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptOutcome {
    NotInvokedDisabled,
    Refused(InterceptRefuse),
    Completed(DeliveryReport),
}

/// The interception filter: one logical writer over the dedup cache, the
/// policy store, and the decision sink. `run_delivery` takes `&mut self`,
/// so the lookup-mutate-release sequence is exclusive by construction and
/// concurrent dispatch needs external mutual exclusion.
#[derive(Debug, Clone)]
pub struct InterceptFilter<S, N>
where
    S: PolicyRepo,
    N: DecisionRepo,
{
    config: InterceptWiringConfig,
    dedup: DedupRuntime,
    engine: InterceptRuntime,
    store: S,
    sink: N,
}

impl<S, N> InterceptFilter<S, N>
where
    S: PolicyRepo,
    N: DecisionRepo,
{
    pub fn new(
        config: InterceptWiringConfig,
        dedup: DedupRuntime,
        engine: InterceptRuntime,
        store: S,
        sink: N,
    ) -> Self {
        Self {
            config,
            dedup,
            engine,
            store,
            sink,
        }
    }

    pub fn dedup(&self) -> &DedupRuntime {
        &self.dedup
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sink(&self) -> &N {
        &self.sink
    }

    /// Filters one delivery in place. Store and sink faults never escape:
    /// they are absorbed into the posture, the report flags, or a refusal.
    /// The dispatcher always gets its instance back in a consistent state.
    pub fn run_delivery(
        &mut self,
        req: &DeliveryRequest,
        instance: &mut BroadcastInstance,
    ) -> InterceptOutcome {
        if !self.config.filter_enabled {
            return InterceptOutcome::NotInvokedDisabled;
        }
        if req.validate().is_err() || instance.validate().is_err() {
            return InterceptOutcome::Refused(refuse(
                reason_codes::FILTER_INPUT_SCHEMA_INVALID,
                "delivery request or broadcast instance failed contract validation",
            ));
        }
        match self.deliver(req, instance) {
            Ok(outcome) => outcome,
            Err(_) => InterceptOutcome::Refused(refuse(
                reason_codes::FILTER_INTERNAL_PIPELINE_ERROR,
                "delivery pipeline produced an invalid report",
            )),
        }
    }

    fn deliver(
        &mut self,
        req: &DeliveryRequest,
        instance: &mut BroadcastInstance,
    ) -> Result<InterceptOutcome, ContractViolation> {
        match instance.action.classify() {
            BroadcastClass::Unmatched => {
                let report = DeliveryReport::v1(
                    None,
                    AppliedOutcome::Unmatched,
                    false,
                    None,
                    reason_codes::FILTER_OK_PASSTHROUGH,
                )?;
                Ok(InterceptOutcome::Completed(report))
            }
            BroadcastClass::Policy(PrivacyCategory::BootCompleted) => {
                self.deliver_boot(req, instance)
            }
            BroadcastClass::Policy(category) => self.deliver_redaction(req, category, instance),
            BroadcastClass::PackageAdded => self.deliver_package_added(req, instance),
        }
    }

    /// Boot flow: latch the flag, pick the outcome, rewrite the action tag.
    /// No dedup and no notice; every installed principal receives this
    /// event, so one notice per principal would flood the log.
    fn deliver_boot(
        &mut self,
        req: &DeliveryRequest,
        instance: &mut BroadcastInstance,
    ) -> Result<InterceptOutcome, ContractViolation> {
        // Latch failures do not block the rewrite.
        let _ = self.store.mark_boot_completed();

        let (outcome, lookup_failed) =
            self.effective_outcome(req.principal, PrivacyCategory::BootCompleted);
        let applied = match self.engine.rearm_boot(outcome, instance) {
            BootMutation::Rearmed => AppliedOutcome::BootRearmed,
            BootMutation::Inerted => AppliedOutcome::BootSuppressed,
        };
        let reason_code = if lookup_failed {
            reason_codes::FILTER_POLICY_LOOKUP_FAILED
        } else {
            reason_codes::FILTER_OK_BOOT
        };
        let report = DeliveryReport::v1(
            Some(PrivacyCategory::BootCompleted),
            applied,
            false,
            None,
            reason_code,
        )?;
        Ok(InterceptOutcome::Completed(report))
    }

    fn deliver_redaction(
        &mut self,
        req: &DeliveryRequest,
        category: PrivacyCategory,
        instance: &mut BroadcastInstance,
    ) -> Result<InterceptOutcome, ContractViolation> {
        if !self.engine.has_redactable_field(category, instance) {
            let report = DeliveryReport::v1(
                Some(category),
                AppliedOutcome::NothingToRedact,
                false,
                None,
                reason_codes::FILTER_OK_DELIVERY,
            )?;
            return Ok(InterceptOutcome::Completed(report));
        }

        let fingerprint = instance.fingerprint_or_stash(req.now);
        let sighting =
            self.dedup
                .lookup_or_create(category, fingerprint, instance, req.expected_receivers);
        let (outcome, lookup_failed) = self.effective_outcome(req.principal, category);

        let decision = self.engine.decide(outcome, sighting.is_new());
        let original = match &sighting {
            Sighting::Seen { original } => Some(original),
            Sighting::New => None,
        };
        let mutation = match self.engine.apply(decision, category, instance, original) {
            Ok(mutation) => mutation,
            Err(_) => {
                // The slot must still drain, or the category would wedge
                // until a new fingerprint displaces it.
                self.dedup.release(category);
                return Ok(InterceptOutcome::Refused(refuse(
                    reason_codes::FILTER_INTERNAL_PIPELINE_ERROR,
                    "sensitive-field mutation failed mid-delivery",
                )));
            }
        };

        let applied = match mutation {
            AppliedMutation::Redacted => AppliedOutcome::Redacted,
            AppliedMutation::Restored => AppliedOutcome::RestoredOriginal,
            AppliedMutation::Untouched => AppliedOutcome::LeftReal,
        };
        let notice_recorded =
            self.record_notice(req, category, outcome, applied, sighting.is_new(), lookup_failed);
        self.dedup.release(category);
        let remaining_after = self.dedup.remaining(category);

        let reason_code = if lookup_failed {
            reason_codes::FILTER_POLICY_LOOKUP_FAILED
        } else {
            reason_codes::FILTER_OK_DELIVERY
        };
        let report =
            DeliveryReport::v1(Some(category), applied, notice_recorded, remaining_after, reason_code)?;
        Ok(InterceptOutcome::Completed(report))
    }

    /// Identity reconciliation, once per instance. The fingerprint guard is
    /// armed before any store contact, so a failed reconcile is not retried
    /// for the same instance.
    fn deliver_package_added(
        &mut self,
        req: &DeliveryRequest,
        instance: &mut BroadcastInstance,
    ) -> Result<InterceptOutcome, ContractViolation> {
        let Some(observed) = instance.principal_field() else {
            let report = DeliveryReport::v1(
                None,
                AppliedOutcome::NothingToRedact,
                false,
                None,
                reason_codes::FILTER_OK_PACKAGE,
            )?;
            return Ok(InterceptOutcome::Completed(report));
        };

        let fingerprint = instance.fingerprint_or_stash(req.now);
        if !self.dedup.package_event_is_new(fingerprint) {
            let report = DeliveryReport::v1(
                None,
                AppliedOutcome::PackageAlreadyHandled,
                false,
                None,
                reason_codes::FILTER_OK_PACKAGE,
            )?;
            return Ok(InterceptOutcome::Completed(report));
        }

        let (applied, reason_code) = match self.store.policy_strict(observed) {
            Ok(None) => (AppliedOutcome::NoPolicyRecord, reason_codes::FILTER_OK_PACKAGE),
            Ok(Some(record)) if record.principal == observed => (
                AppliedOutcome::PrincipalConsistent,
                reason_codes::FILTER_OK_PACKAGE,
            ),
            Ok(Some(record)) => {
                let applied = match record.with_principal(observed) {
                    Ok(corrected) => match self.store.save_policy(corrected) {
                        Ok(()) => AppliedOutcome::PrincipalCorrected,
                        Err(_) => AppliedOutcome::ReconcileFailed,
                    },
                    Err(_) => AppliedOutcome::ReconcileFailed,
                };
                (applied, reason_codes::FILTER_OK_PACKAGE)
            }
            Err(_) => (
                AppliedOutcome::ReconcileFailed,
                reason_codes::FILTER_POLICY_LOOKUP_FAILED,
            ),
        };

        let report = DeliveryReport::v1(None, applied, false, None, reason_code)?;
        Ok(InterceptOutcome::Completed(report))
    }

    fn effective_outcome(
        &self,
        principal: PrincipalId,
        category: PrivacyCategory,
    ) -> (PolicyOutcome, bool) {
        match self.store.policy_or_default(principal) {
            Ok(record) => (record.outcome_for(category), false),
            Err(_) => (self.config.lookup_failure_posture.effective_outcome(), true),
        }
    }

    /// One notice per redaction delivery. Sink faults are swallowed; the
    /// report carries `notice_recorded: false` and the delivery stands.
    fn record_notice(
        &mut self,
        req: &DeliveryRequest,
        category: PrivacyCategory,
        outcome: PolicyOutcome,
        applied: AppliedOutcome,
        sighting_is_new: bool,
        lookup_failed: bool,
    ) -> bool {
        let severity = if lookup_failed {
            NoticeSeverity::Warn
        } else {
            NoticeSeverity::Info
        };
        let posture = if lookup_failed {
            Some(self.config.lookup_failure_posture)
        } else {
            None
        };
        let input = match notice_input(
            req,
            category,
            outcome,
            severity,
            applied,
            sighting_is_new,
            posture,
        ) {
            Ok(input) => input,
            Err(_) => return false,
        };
        self.sink.record_decision(input).is_ok()
    }
}

// Refusal messages are static wiring literals within contract bounds.
fn refuse(reason_code: ReasonCodeId, message: &str) -> InterceptRefuse {
    InterceptRefuse {
        reason_code,
        message: message.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
fn notice_input(
    req: &DeliveryRequest,
    category: PrivacyCategory,
    outcome: PolicyOutcome,
    severity: NoticeSeverity,
    applied: AppliedOutcome,
    sighting_is_new: bool,
    posture: Option<LookupFailurePosture>,
) -> Result<DecisionNoticeInput, ContractViolation> {
    let mut entries = BTreeMap::new();
    entries.insert(
        PayloadKey::new("sighting")?,
        PayloadValue::new(if sighting_is_new { "new" } else { "repeat" })?,
    );
    entries.insert(
        PayloadKey::new("applied")?,
        PayloadValue::new(applied.as_str())?,
    );
    if let Some(posture) = posture {
        entries.insert(PayloadKey::new("lookup")?, PayloadValue::new("failed")?);
        entries.insert(
            PayloadKey::new("posture")?,
            PayloadValue::new(posture.as_str())?,
        );
    }
    DecisionNoticeInput::v1(
        req.correlation_id,
        req.principal,
        category,
        outcome,
        severity,
        req.now,
        None,
        NoticePayload::v1(entries)?,
    )
}
