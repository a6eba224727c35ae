#![forbid(unsafe_code)]

pub mod detector_store;
pub mod repo;
