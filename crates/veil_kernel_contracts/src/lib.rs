#![forbid(unsafe_code)]

pub mod common;
pub mod detector;
pub mod fhe;

pub use common::{ContractViolation, ReasonCodeId, SchemaVersion, Validate};
