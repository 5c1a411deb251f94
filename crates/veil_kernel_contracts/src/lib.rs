#![forbid(unsafe_code)]

pub mod broadcast;
pub mod common;
pub mod notice;
pub mod policy;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
