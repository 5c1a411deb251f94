#![forbid(unsafe_code)]

use std::fmt::Write as _;

use sha2::{Digest, Sha256};
use veil_kernel_contracts::notice::{
    DecisionNotice, DecisionNoticeId, DecisionNoticeInput,
};
use veil_kernel_contracts::policy::PrincipalId;
use veil_kernel_contracts::Validate;

use crate::settings_store::StorageError;

const DECISION_LOG_TABLE: &str = "decision_log";

/// Append-only `decision_log` table. Every row is linked into a SHA-256
/// digest chain so a rewritten or dropped row is detectable after the fact;
/// the filter itself only ever appends.
#[derive(Debug, Clone, Default)]
pub struct DecisionLog {
    rows: Vec<DecisionNotice>,
    digests: Vec<String>,
    next_notice_id: u64,
}

impl DecisionLog {
    pub fn new_in_memory() -> Self {
        Self {
            rows: Vec::new(),
            digests: Vec::new(),
            next_notice_id: 1,
        }
    }

    pub fn append_notice(
        &mut self,
        input: DecisionNoticeInput,
    ) -> Result<DecisionNoticeId, StorageError> {
        input.validate()?;
        let notice_id = DecisionNoticeId(self.next_notice_id);
        let notice = DecisionNotice::from_input(notice_id, input)?;

        let prev = self
            .digests
            .last()
            .cloned()
            .unwrap_or_else(genesis_digest);
        let digest = link_digest(&prev, &canonical_row(&notice));

        self.next_notice_id = self.next_notice_id.saturating_add(1);
        self.digests.push(digest);
        self.rows.push(notice);
        Ok(notice_id)
    }

    pub fn notices(&self) -> &[DecisionNotice] {
        &self.rows
    }

    pub fn notice(&self, notice_id: DecisionNoticeId) -> Result<&DecisionNotice, StorageError> {
        let index = notice_id.0.checked_sub(1).map(|i| i as usize);
        index
            .and_then(|i| self.rows.get(i))
            .ok_or_else(|| StorageError::MissingRecord {
                table: DECISION_LOG_TABLE,
                key: notice_id.0.to_string(),
            })
    }

    pub fn notices_for_principal(&self, principal: PrincipalId) -> Vec<&DecisionNotice> {
        self.rows
            .iter()
            .filter(|n| n.principal == principal)
            .collect()
    }

    /// Recomputes every link from genesis. `at` in the error is the 1-based
    /// notice id of the first broken row.
    pub fn verify_chain(&self) -> Result<(), StorageError> {
        let mut prev = genesis_digest();
        for (index, row) in self.rows.iter().enumerate() {
            let expected = link_digest(&prev, &canonical_row(row));
            if self.digests.get(index) != Some(&expected) {
                return Err(StorageError::ChainBroken {
                    table: DECISION_LOG_TABLE,
                    at: index as u64 + 1,
                });
            }
            prev = expected;
        }
        Ok(())
    }

    pub fn digest_head(&self) -> String {
        self.digests.last().cloned().unwrap_or_else(genesis_digest)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn genesis_digest() -> String {
    hex_digest(&Sha256::digest([]))
}

fn link_digest(prev_hex: &str, row: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hex.as_bytes());
    hasher.update(row.as_bytes());
    hex_digest(&hasher.finalize())
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Pipe-joined stable encoding of one row. Field order is part of the
/// chain format and must not change.
fn canonical_row(notice: &DecisionNotice) -> String {
    let mut row = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        notice.notice_id.0,
        notice.correlation_id.0,
        notice.principal.0,
        notice.category.as_str(),
        notice.outcome.as_str(),
        notice.severity.as_str(),
        notice.emitted_at.0,
    );
    match &notice.detail {
        Some(detail) => {
            row.push('|');
            row.push_str(detail.as_str());
        }
        None => row.push_str("|-"),
    }
    for (key, value) in &notice.payload_min.entries {
        row.push('|');
        row.push_str(key.as_str());
        row.push('=');
        row.push_str(value.as_str());
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use veil_kernel_contracts::notice::{
        CorrelationId, NoticePayload, NoticeSeverity, PayloadKey, PayloadValue,
    };
    use veil_kernel_contracts::policy::{PolicyOutcome, PrivacyCategory};
    use veil_kernel_contracts::MonotonicTimeNs;

    fn input(principal: u32, correlation: u128) -> DecisionNoticeInput {
        let payload = NoticePayload::v1(BTreeMap::from([(
            PayloadKey::new("applied").unwrap(),
            PayloadValue::new("redacted").unwrap(),
        )]))
        .unwrap();
        DecisionNoticeInput::v1(
            CorrelationId(correlation),
            PrincipalId(principal),
            PrivacyCategory::Sms,
            PolicyOutcome::Empty,
            NoticeSeverity::Info,
            MonotonicTimeNs(100),
            None,
            payload,
        )
        .unwrap()
    }

    #[test]
    fn at_declog_01_append_assigns_sequential_ids() {
        let mut log = DecisionLog::new_in_memory();
        let first = log.append_notice(input(1000, 1)).unwrap();
        let second = log.append_notice(input(1000, 2)).unwrap();
        assert_eq!(first, DecisionNoticeId(1));
        assert_eq!(second, DecisionNoticeId(2));
        assert_eq!(log.len(), 2);
        assert_eq!(log.notice(first).unwrap().correlation_id, CorrelationId(1));
    }

    #[test]
    fn at_declog_02_chain_verifies_and_detects_tampering() {
        let mut log = DecisionLog::new_in_memory();
        log.append_notice(input(1000, 1)).unwrap();
        log.append_notice(input(1000, 2)).unwrap();
        log.append_notice(input(1000, 3)).unwrap();
        assert!(log.verify_chain().is_ok());

        log.rows[1].outcome = PolicyOutcome::Real;
        match log.verify_chain() {
            Err(StorageError::ChainBroken { at, .. }) => assert_eq!(at, 2),
            other => panic!("expected broken chain at row 2, got {other:?}"),
        }
    }

    #[test]
    fn at_declog_03_digest_head_moves_with_every_append() {
        let mut log = DecisionLog::new_in_memory();
        let genesis = log.digest_head();
        log.append_notice(input(1000, 1)).unwrap();
        let after_one = log.digest_head();
        log.append_notice(input(1000, 2)).unwrap();
        let after_two = log.digest_head();
        assert_ne!(genesis, after_one);
        assert_ne!(after_one, after_two);
    }

    #[test]
    fn at_declog_04_principal_filter_and_missing_id() {
        let mut log = DecisionLog::new_in_memory();
        log.append_notice(input(1000, 1)).unwrap();
        log.append_notice(input(2000, 2)).unwrap();
        log.append_notice(input(1000, 3)).unwrap();

        assert_eq!(log.notices_for_principal(PrincipalId(1000)).len(), 2);
        assert_eq!(log.notices_for_principal(PrincipalId(2000)).len(), 1);
        assert!(log.notices_for_principal(PrincipalId(3000)).is_empty());

        assert!(matches!(
            log.notice(DecisionNoticeId(99)),
            Err(StorageError::MissingRecord { .. })
        ));
        assert!(matches!(
            log.notice(DecisionNoticeId(0)),
            Err(StorageError::MissingRecord { .. })
        ));
    }
}
