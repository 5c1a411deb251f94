#![forbid(unsafe_code)]

pub mod intercept;
pub mod policy_source;
