#![forbid(unsafe_code)]

pub mod dedup;
pub mod intercept;
pub mod policy_vault;
