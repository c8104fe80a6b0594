#![forbid(unsafe_code)]

pub mod activity;
pub mod common;
pub mod credential_secrets;

pub use common::{ContractViolation, SchemaVersion, Validate};
