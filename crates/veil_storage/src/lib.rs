#![forbid(unsafe_code)]

pub mod decision_log;
pub mod repo;
pub mod settings_store;
